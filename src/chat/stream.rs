//! Server-push streaming of chat events.
//!
//! Yields `event:`/`data:` frames for the session until the (extendable)
//! deadline. On connect, a short window of recent messages is replayed so a
//! subscriber that raced the send still sees it; after that, frames come
//! from the live bus in commit order. Keepalive comment lines are emitted on
//! idle and must not be mistaken for protocol events.

use std::collections::HashSet;
use std::convert::Infallible;

use chrono::{DateTime, Duration, Utc};
use futures::Stream;
use sqlx::Row;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::bus::Event;
use crate::config::AppState;
use crate::db::fmt_ts;

/// Replay window for subscribers that connect without an `after` cursor.
const REPLAY_WINDOW_SECONDS: i64 = 300;
const REPLAY_LIMIT: i64 = 50;
const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(15);

fn frame(event: &Event) -> String {
    let data = serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string());
    format!("event: {}\ndata: {}\n\n", event.name(), data)
}

/// Stream of SSE frames for one subscriber of one session.
///
/// The caller is registered in the waiter registry for the life of the
/// stream, so `Pending` reports it as waiting; hang-on messages and read
/// receipts from other participants push the deadline out.
pub fn session_stream(
    state: AppState,
    session_id: String,
    agent_id: String,
    deadline: DateTime<Utc>,
    after: Option<DateTime<Utc>>,
) -> impl Stream<Item = std::result::Result<String, Infallible>> {
    async_stream::stream! {
        // Subscribe before the replay query so nothing committed in between
        // is missed; replayed ids are tracked to dedupe the overlap.
        let mut rx = state.bus.subscribe(&session_id).await;
        let guard = state.waiters.register(&session_id, &agent_id, deadline);

        // Immediate first byte so transports can start streaming before any
        // store work happens.
        yield Ok::<_, Infallible>(": keepalive\n\n".to_string());

        let replay_from = after.unwrap_or_else(|| Utc::now() - Duration::seconds(REPLAY_WINDOW_SECONDS));
        let mut replayed: HashSet<String> = HashSet::new();

        let recent = sqlx::query(
            "SELECT message_id, from_agent_id, from_alias, body, sender_leaving, hang_on,
                    from_did, to_did, signature, signing_key_id, created_at
             FROM chat_messages
             WHERE session_id = ? AND created_at > ?
             ORDER BY created_at ASC, message_id ASC
             LIMIT ?",
        )
        .bind(&session_id)
        .bind(fmt_ts(replay_from))
        .bind(REPLAY_LIMIT)
        .fetch_all(&state.pool)
        .await;

        match recent {
            Ok(rows) => {
                for row in &rows {
                    let hang_on: bool = row.get("hang_on");
                    let event = Event::Message {
                        session_id: session_id.clone(),
                        message_id: row.get("message_id"),
                        from_agent: row.get("from_alias"),
                        from_agent_id: row.get("from_agent_id"),
                        body: row.get("body"),
                        sender_leaving: row.get("sender_leaving"),
                        hang_on,
                        extends_wait_seconds: if hang_on {
                            state.settings.hang_on_extension_seconds
                        } else {
                            0
                        },
                        timestamp: row.get("created_at"),
                        from_did: row.get::<Option<String>, _>("from_did"),
                        to_did: row.get::<Option<String>, _>("to_did"),
                        signature: row.get::<Option<String>, _>("signature"),
                        signing_key_id: row.get::<Option<String>, _>("signing_key_id"),
                    };
                    if let Event::Message { ref message_id, .. } = event {
                        replayed.insert(message_id.clone());
                    }
                    yield Ok(frame(&event));
                }
            }
            Err(err) => {
                warn!("replay query failed for session {}: {}", session_id, err);
            }
        }

        loop {
            let now = Utc::now();
            let deadline = guard.slot().deadline();
            if now >= deadline {
                debug!("stream deadline reached for session {}", session_id);
                break;
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            let sleep_for = remaining.min(KEEPALIVE_INTERVAL);

            tokio::select! {
                event = rx.recv() => match event {
                    Ok(event) => {
                        match &event {
                            Event::Message {
                                message_id,
                                from_agent_id,
                                hang_on,
                                extends_wait_seconds,
                                ..
                            } => {
                                if replayed.contains(message_id) {
                                    continue;
                                }
                                if *hang_on
                                    && *extends_wait_seconds > 0
                                    && from_agent_id != &agent_id
                                {
                                    guard.slot().extend(*extends_wait_seconds);
                                }
                            }
                            Event::ReadReceipt {
                                reader_agent_id,
                                extends_wait_seconds,
                                ..
                            } => {
                                // The subscriber's own receipts are not echoed.
                                if reader_agent_id == &agent_id {
                                    continue;
                                }
                                if *extends_wait_seconds > 0 {
                                    guard.slot().extend(*extends_wait_seconds);
                                }
                            }
                            Event::Mail { .. } => continue,
                        }
                        yield Ok(frame(&event));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Delivering after a gap would violate commit order
                        // for this subscriber; end the stream instead.
                        warn!(
                            "stream for session {} lagged by {} events, closing",
                            session_id, skipped
                        );
                        break;
                    }
                    Err(RecvError::Closed) => {
                        rx = state.bus.subscribe(&session_id).await;
                    }
                },
                _ = tokio::time::sleep(sleep_for) => {
                    if Utc::now() < guard.slot().deadline() {
                        yield Ok(": keepalive\n\n".to_string());
                    }
                }
            }
        }
    }
}
