//! Joins posts and comments with their authors using one batch lookup.

use std::collections::HashMap;

use domains::{Author, Comment, CommentView, DomainResult, Post, PostView, UserRepository};
use uuid::Uuid;

pub(crate) async fn post_views(
    users: &dyn UserRepository,
    posts: Vec<Post>,
) -> DomainResult<Vec<PostView>> {
    let authors = authors_for(users, posts.iter().map(|p| p.user_id)).await?;
    Ok(posts
        .into_iter()
        .map(|post| PostView {
            author: author_or_placeholder(&authors, post.user_id),
            post,
        })
        .collect())
}

pub(crate) async fn comment_views(
    users: &dyn UserRepository,
    comments: Vec<Comment>,
) -> DomainResult<Vec<CommentView>> {
    let authors = authors_for(users, comments.iter().map(|c| c.user_id)).await?;
    Ok(comments
        .into_iter()
        .map(|comment| CommentView {
            author: author_or_placeholder(&authors, comment.user_id),
            comment,
        })
        .collect())
}

async fn authors_for(
    users: &dyn UserRepository,
    ids: impl Iterator<Item = Uuid>,
) -> DomainResult<HashMap<Uuid, Author>> {
    let mut ids: Vec<Uuid> = ids.collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Ok(HashMap::new());
    }

    let found = users.find_users(&ids).await?;
    Ok(found.iter().map(|u| (u.id, Author::from(u))).collect())
}

// The owning account can vanish between the two reads; keep the post.
fn author_or_placeholder(authors: &HashMap<Uuid, Author>, id: Uuid) -> Author {
    authors.get(&id).cloned().unwrap_or(Author { id, username: None })
}
