//! SSE stream integration: replay, live fan-out, frame shape, and deadline
//! validation.

mod common;

use aweb::auth::Principal;
use aweb::chat::{self, stream::session_stream};
use aweb::db::fmt_ts;
use aweb::error::Error;
use aweb::handlers::chat::{stream as stream_handler, StreamParams};
use aweb::models::SignatureFields;
use axum::extract::{Path, Query, State};
use chrono::{Duration, Utc};
use common::{bootstrap_agent, test_state, test_state_with};
use futures::StreamExt;

fn sigs() -> SignatureFields {
    SignatureFields::default()
}

/// Collect every frame the stream yields until it closes at its deadline.
async fn collect_frames(
    stream: impl futures::Stream<Item = Result<String, std::convert::Infallible>>,
) -> Vec<String> {
    stream.map(|frame| frame.unwrap()).collect().await
}

fn data_frames(frames: &[String]) -> Vec<serde_json::Value> {
    frames
        .iter()
        .filter(|f| f.starts_with("event: "))
        .map(|f| {
            let data_line = f
                .lines()
                .find(|l| l.starts_with("data: "))
                .expect("event frame carries a data line");
            serde_json::from_str(&data_line["data: ".len()..]).unwrap()
        })
        .collect()
}

#[tokio::test]
async fn new_subscribers_replay_recent_messages() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let created = chat::create_session(
        &state,
        &alice.project_id,
        &alice.agent_id,
        &["bob".to_string()],
        "hi bob",
        false,
        &sigs(),
    )
    .await
    .unwrap();

    // Bob connects after the send and still sees the message.
    let frames = collect_frames(session_stream(
        state.clone(),
        created.session_id.clone(),
        bob.agent_id.clone(),
        Utc::now() + Duration::milliseconds(400),
        None,
    ))
    .await;

    assert_eq!(frames[0], ": keepalive\n\n");
    let events = data_frames(&frames);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "message");
    assert_eq!(events[0]["session_id"], created.session_id);
    assert_eq!(events[0]["message_id"], created.message_id);
    assert_eq!(events[0]["from_agent"], "alice");
    assert_eq!(events[0]["body"], "hi bob");
    assert!(events[0]["timestamp"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn live_messages_and_read_receipts_reach_open_streams() {
    // A tiny extension keeps the read receipt from pushing the stream
    // deadline far out; the test only asserts it is positive.
    let settings = aweb::config::Settings {
        hang_on_extension_seconds: 1,
        ..aweb::config::Settings::default()
    };
    let (state, _dir) = test_state_with(settings).await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let created = chat::create_session(
        &state,
        &alice.project_id,
        &alice.agent_id,
        &["bob".to_string()],
        "hi",
        false,
        &sigs(),
    )
    .await
    .unwrap();

    // Alice streams from just after her send; bob replies and reads while
    // the stream is open.
    let after = Utc::now();
    let stream = session_stream(
        state.clone(),
        created.session_id.clone(),
        alice.agent_id.clone(),
        Utc::now() + Duration::milliseconds(800),
        Some(after),
    );

    let bob_side = async {
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        chat::mark_read(
            &state,
            &bob.project_id,
            &created.session_id,
            &bob.agent_id,
            &created.message_id,
        )
        .await
        .unwrap();
        chat::send_message(
            &state,
            &bob.project_id,
            &bob.agent_id,
            &created.session_id,
            "hello",
            false,
            &sigs(),
        )
        .await
        .unwrap();
    };

    let (frames, _) = tokio::join!(collect_frames(stream), bob_side);
    let events = data_frames(&frames);

    let receipt = events
        .iter()
        .find(|e| e["type"] == "read_receipt")
        .expect("read receipt frame");
    assert_eq!(receipt["reader_alias"], "bob");
    assert_eq!(receipt["up_to_message_id"], created.message_id);
    assert!(receipt["extends_wait_seconds"].as_i64().unwrap() > 0);

    let message = events
        .iter()
        .find(|e| e["type"] == "message" && e["body"] == "hello")
        .expect("live message frame");
    assert_eq!(message["from_agent"], "bob");
    assert_eq!(message["sender_leaving"], false);
    assert_eq!(message["hang_on"], false);
}

#[tokio::test]
async fn replayed_messages_are_not_duplicated_by_live_delivery() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let created = chat::create_session(
        &state,
        &alice.project_id,
        &alice.agent_id,
        &["bob".to_string()],
        "only once",
        false,
        &sigs(),
    )
    .await
    .unwrap();

    let frames = collect_frames(session_stream(
        state.clone(),
        created.session_id.clone(),
        bob.agent_id.clone(),
        Utc::now() + Duration::milliseconds(400),
        None,
    ))
    .await;

    let count = data_frames(&frames)
        .iter()
        .filter(|e| e["message_id"] == created.message_id)
        .count();
    assert_eq!(count, 1);
}

#[tokio::test]
async fn stream_rejects_past_deadlines_and_outsiders() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    bootstrap_agent(&state, "proj", "bob").await;
    let carol = bootstrap_agent(&state, "proj", "carol").await;

    let created = chat::create_session(
        &state,
        &alice.project_id,
        &alice.agent_id,
        &["bob".to_string()],
        "hi",
        false,
        &sigs(),
    )
    .await
    .unwrap();

    let principal = |agent: &str, project: &str| Principal {
        project_id: project.to_string(),
        agent_id: Some(agent.to_string()),
        api_key_id: None,
    };

    // Past deadline.
    let err = stream_handler(
        State(state.clone()),
        principal(&alice.agent_id, &alice.project_id),
        Path(created.session_id.clone()),
        Query(StreamParams {
            deadline: fmt_ts(Utc::now() - Duration::seconds(5)),
            after: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Unparseable deadline.
    let err = stream_handler(
        State(state.clone()),
        principal(&alice.agent_id, &alice.project_id),
        Path(created.session_id.clone()),
        Query(StreamParams {
            deadline: "tomorrow-ish".to_string(),
            after: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));

    // Non-participant.
    let err = stream_handler(
        State(state.clone()),
        principal(&carol.agent_id, &carol.project_id),
        Path(created.session_id.clone()),
        Query(StreamParams {
            deadline: fmt_ts(Utc::now() + Duration::seconds(5)),
            after: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    // Unknown session.
    let err = stream_handler(
        State(state.clone()),
        principal(&alice.agent_id, &alice.project_id),
        Path(uuid::Uuid::new_v4().to_string()),
        Query(StreamParams {
            deadline: fmt_ts(Utc::now() + Duration::seconds(5)),
            after: None,
        }),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}
