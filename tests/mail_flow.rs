//! Mail store integration: send -> inbox -> ack, contact gating, and
//! cross-project isolation.

mod common;

use aweb::error::Error;
use aweb::identity::contacts;
use aweb::mail::{self, Recipient};
use aweb::models::{Priority, SignatureFields};
use common::{bootstrap_agent, test_state};

#[tokio::test]
async fn sent_mail_appears_in_inbox_until_acked() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let (message_id, _) = mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("bob".to_string()),
        "greeting",
        "hello bob",
        Priority::High,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap();

    let inbox = mail::inbox(&state.pool, &bob.project_id, &bob.agent_id, false, 50)
        .await
        .unwrap();
    assert_eq!(inbox.len(), 1);
    assert_eq!(inbox[0].message_id, message_id);
    assert_eq!(inbox[0].subject, "greeting");
    assert_eq!(inbox[0].body, "hello bob");
    assert_eq!(inbox[0].priority, "high");
    assert_eq!(inbox[0].from_alias, "alice");
    assert!(inbox[0].read_at.is_none());

    let acked_at = mail::ack(&state.pool, &bob.project_id, &bob.agent_id, &message_id)
        .await
        .unwrap();

    // unread_only no longer returns it; the full inbox still does.
    let unread = mail::inbox(&state.pool, &bob.project_id, &bob.agent_id, true, 50)
        .await
        .unwrap();
    assert!(unread.is_empty());
    let all = mail::inbox(&state.pool, &bob.project_id, &bob.agent_id, false, 50)
        .await
        .unwrap();
    assert_eq!(all[0].read_at.as_deref(), Some(acked_at.as_str()));
}

#[tokio::test]
async fn second_ack_is_an_idempotent_noop() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let (message_id, _) = mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::AgentId(bob.agent_id.clone()),
        "",
        "ping",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap();

    let first = mail::ack(&state.pool, &bob.project_id, &bob.agent_id, &message_id)
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let second = mail::ack(&state.pool, &bob.project_id, &bob.agent_id, &message_id)
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn ack_is_recipient_only_and_missing_is_not_found() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let (message_id, _) = mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("bob".to_string()),
        "",
        "for bob only",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap();

    let err = mail::ack(&state.pool, &alice.project_id, &alice.agent_id, &message_id)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    let missing = uuid::Uuid::new_v4().to_string();
    let err = mail::ack(&state.pool, &bob.project_id, &bob.agent_id, &missing)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn unknown_recipient_is_not_found() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;

    let err = mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("nobody".to_string()),
        "",
        "hello?",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn contacts_only_recipient_rejects_unlisted_sender() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    sqlx::query("UPDATE agents SET access_mode = 'contacts_only' WHERE agent_id = ?")
        .bind(&bob.agent_id)
        .execute(&state.pool)
        .await
        .unwrap();

    let err = mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("bob".to_string()),
        "",
        "let me in",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    // Allowlisting the sender's address opens the door.
    contacts::add_contact(&state.pool, &bob.project_id, "proj/alice", None)
        .await
        .unwrap();
    mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("bob".to_string()),
        "",
        "now it works",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap();
}

#[tokio::test]
async fn deregistered_recipient_is_gone() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    sqlx::query("UPDATE agents SET status = 'deregistered' WHERE agent_id = ?")
        .bind(&bob.agent_id)
        .execute(&state.pool)
        .await
        .unwrap();

    let err = mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("bob".to_string()),
        "",
        "anyone there?",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Gone(_)));
}

#[tokio::test]
async fn inboxes_are_isolated_across_projects() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj-p", "alice").await;
    let bob = bootstrap_agent(&state, "proj-p", "bob").await;
    let carol = bootstrap_agent(&state, "proj-q", "carol").await;

    mail::send_mail(
        &state,
        &alice.project_id,
        &alice.agent_id,
        Recipient::Alias("bob".to_string()),
        "",
        "p-internal",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap();

    // Project Q sees nothing of project P's mail, even when querying with
    // P's recipient agent id.
    let q_inbox = mail::inbox(&state.pool, &carol.project_id, &carol.agent_id, false, 50)
        .await
        .unwrap();
    assert!(q_inbox.is_empty());
    let cross = mail::inbox(&state.pool, &carol.project_id, &bob.agent_id, false, 50)
        .await
        .unwrap();
    assert!(cross.is_empty());

    // Aliases resolve within the caller's project only.
    let err = mail::send_mail(
        &state,
        &carol.project_id,
        &carol.agent_id,
        Recipient::Alias("bob".to_string()),
        "",
        "cross-project?",
        Priority::Normal,
        None,
        &SignatureFields::default(),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
