use anyhow::Result;

use crate::cli::{Cli, PostCommand};
use crate::commands::{print_broadcast, service};
use crate::service::CommentDraft;

pub async fn run(cli: &Cli, cmd: &PostCommand) -> Result<()> {
	let (svc, _) = service(cli).await?;

	let result = match cmd {
		PostCommand::Vote {
			author,
			permlink,
			weight,
		} => svc.vote(author, permlink, vote_weight(*weight)).await?,
		PostCommand::Comment {
			parent_author,
			parent_permlink,
			title,
			body,
			tags,
		} => {
			let draft = CommentDraft {
				parent_author: parent_author.clone(),
				parent_permlink: parent_permlink.clone(),
				title: title.clone(),
				body: body.clone(),
				tags: tags.clone(),
			};
			svc.add_comment(&draft).await?
		}
		PostCommand::Reblog { author, permlink } => svc.reblog(author, permlink).await?,
	};

	print_broadcast(result);
	Ok(())
}

/// Percent to basis points.  Range checking is left to the service;
/// out-of-range input saturates and is refused there.
fn vote_weight(percent: f32) -> i16 {
	(percent * 100.0).round() as i16
}
