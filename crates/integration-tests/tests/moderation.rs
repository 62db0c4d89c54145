mod common;

use chrono::Duration;
use common::{admin, Harness};
use domains::{DomainError, ErrorKind, VoteKind};
use uuid::Uuid;

#[tokio::test]
async fn test_create_and_get_post() {
    let h = Harness::new();
    let author = h.user("writer").await;

    let created = h
        .engine
        .create_post(&author, "coffee cart is back", 37.7749, -122.4194)
        .await
        .unwrap();
    assert_eq!(created.author.username.as_deref(), Some("writer"));
    assert_eq!((created.post.upvotes, created.post.downvotes), (0, 0));
    assert!(!created.post.is_flagged);

    let fetched = h.engine.get_post(created.post.id).await.unwrap();
    assert_eq!(fetched.post.content, "coffee cart is back");
    assert_eq!(fetched.author.id, author.user_id);

    let missing = h.engine.get_post(Uuid::now_v7()).await.unwrap_err();
    assert_eq!(missing.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_post_content_rules() {
    let h = Harness::new();
    let author = h.user("writer").await;

    let empty = h.engine.create_post(&author, "  ", 0.0, 0.0).await;
    assert!(matches!(empty, Err(DomainError::Validation(_))));
    let long = h
        .engine
        .create_post(&author, &"x".repeat(501), 0.0, 0.0)
        .await;
    assert!(matches!(long, Err(DomainError::Validation(_))));
    assert!(h
        .engine
        .create_post(&author, &"x".repeat(500), 0.0, 0.0)
        .await
        .is_ok());
}

#[tokio::test]
async fn test_comments_newest_first_with_authors() {
    let h = Harness::new();
    let author = h.user("writer").await;
    let reader = h.user("reader").await;
    let id = h
        .engine
        .create_post(&author, "thoughts?", 1.0, 1.0)
        .await
        .unwrap()
        .post
        .id;

    h.engine.create_comment(&reader, id, "first!").await.unwrap();
    h.clock.advance(Duration::seconds(5));
    let reply = h.engine.create_comment(&author, id, "thanks").await.unwrap();
    assert_eq!(reply.author.username.as_deref(), Some("writer"));

    let listed = h.engine.list_comments(id).await.unwrap();
    let rows: Vec<_> = listed
        .iter()
        .map(|c| (c.comment.content.as_str(), c.author.username.as_deref()))
        .collect();
    assert_eq!(rows, vec![("thanks", Some("writer")), ("first!", Some("reader"))]);

    let orphan = h
        .engine
        .create_comment(&reader, Uuid::now_v7(), "hello?")
        .await
        .unwrap_err();
    assert!(matches!(orphan, DomainError::NotFound { entity: "post", .. }));
}

#[tokio::test]
async fn test_admin_operations_require_admin() {
    let h = Harness::new();
    let user = h.user("regular").await;
    let id = h
        .engine
        .create_post(&user, "mine", 1.0, 1.0)
        .await
        .unwrap()
        .post
        .id;

    let attempts = [
        h.engine.list_flagged(&user).await.map(|_| ()),
        h.engine.delete_post(&user, id).await,
        h.engine.unflag_post(&user, id).await,
        h.engine.ban_user(&user, user.user_id).await,
        h.engine.unban_user(&user, user.user_id).await,
        h.engine.audit_counters(&user, id).await.map(|_| ()),
        h.engine.reconcile_counters(&user, id).await.map(|_| ()),
    ];
    for attempt in attempts {
        assert!(matches!(attempt, Err(DomainError::Forbidden(_))));
    }

    // Nothing happened.
    assert!(h.engine.get_post(id).await.is_ok());
    assert!(h.engine.login("regular", common::PASSWORD).await.is_ok());
}

#[tokio::test]
async fn test_delete_post_takes_everything_with_it() {
    let h = Harness::new();
    let author = h.user("writer").await;
    let reader = h.user("reader").await;
    let id = h
        .engine
        .create_post(&author, "doomed", 1.0, 1.0)
        .await
        .unwrap()
        .post
        .id;
    h.engine.cast_vote(&reader, id, VoteKind::Down).await.unwrap();
    h.engine.create_comment(&reader, id, "bye").await.unwrap();
    for _ in 0..3 {
        h.engine.file_report(&reader, id, "bad").await.unwrap();
    }
    assert_eq!(h.engine.list_flagged(&admin()).await.unwrap().len(), 1);

    h.engine.delete_post(&admin(), id).await.unwrap();

    assert!(h.engine.list_flagged(&admin()).await.unwrap().is_empty());
    assert!(h.engine.list_comments(id).await.unwrap().is_empty());
    assert!(h.engine.nearby_posts(1.0, 1.0).await.unwrap().is_empty());
    let again = h.engine.delete_post(&admin(), id).await.unwrap_err();
    assert!(matches!(again, DomainError::NotFound { .. }));
}

#[tokio::test]
async fn test_ban_unknown_user() {
    let h = Harness::new();
    let err = h.engine.ban_user(&admin(), Uuid::now_v7()).await.unwrap_err();
    assert!(matches!(err, DomainError::NotFound { entity: "user", .. }));
}

#[tokio::test]
async fn test_list_flagged_newest_first() {
    let h = Harness::new();
    let author = h.user("writer").await;
    let reporter = h.user("reporter").await;

    let mut ids = Vec::new();
    for content in ["older", "newer", "clean"] {
        ids.push(
            h.engine
                .create_post(&author, content, 1.0, 1.0)
                .await
                .unwrap()
                .post
                .id,
        );
        h.clock.advance(Duration::minutes(1));
    }
    for id in &ids[..2] {
        for _ in 0..3 {
            h.engine.file_report(&reporter, *id, "nope").await.unwrap();
        }
    }

    let flagged = h.engine.list_flagged(&admin()).await.unwrap();
    let contents: Vec<_> = flagged.iter().map(|v| v.post.content.as_str()).collect();
    assert_eq!(contents, vec!["newer", "older"]);
    assert!(flagged.iter().all(|v| v.author.username.as_deref() == Some("writer")));
}

#[tokio::test]
async fn test_tampered_access_token_rejected() {
    let h = Harness::new();
    let (_, pair) = h.sign_up("writer").await;

    let dot = pair.access_token.rfind('.').unwrap();
    let mut tampered: Vec<char> = pair.access_token.chars().collect();
    let target = dot + 5;
    tampered[target] = if tampered[target] == 'Q' { 'R' } else { 'Q' };
    let tampered: String = tampered.into_iter().collect();

    let err = h.engine.authenticate(&tampered).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
}
