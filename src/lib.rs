//! Multi-backend transaction signing and verification for the Hive
//! blockchain.
//!
//! A [`signer::SignerFacade`] routes each request to the backend serving its
//! [`types::LoginType`]: a raw WIF key, the Hive Keychain browser extension,
//! a HiveAuth remote approver or a local key vault.  Transactions are built
//! by [`tx_builder::TransactionBuilder`], checked by
//! [`verify::SignatureVerifier`], and the common social actions are wrapped
//! by [`service::OperationService`].

pub mod chain;
pub mod cli;
pub mod commands;
pub mod config;
pub mod crypto;
pub mod error;
pub mod operation;
pub mod rpc;
pub mod service;
pub mod signer;
pub mod tx_builder;
pub mod types;
pub mod verify;
