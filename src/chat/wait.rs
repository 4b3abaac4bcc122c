//! Waiter registry and the send-and-wait state machine.
//!
//! A waiter is an in-flight request blocked on a session: either a sender
//! waiting for a reply or an open stream. Registrations live only as long as
//! the blocked request; the guard deregisters on drop, which also covers
//! client disconnect (the handler future is dropped).
//!
//! Deadline bookkeeping happens in the slot, not recomputed per event: every
//! qualifying extension applies `deadline = max(now, deadline) + extends`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast::error::RecvError;

use crate::bus::{Event, EventBus};

pub struct WaiterSlot {
    deadline: Mutex<DateTime<Utc>>,
}

impl WaiterSlot {
    fn new(deadline: DateTime<Utc>) -> Self {
        Self {
            deadline: Mutex::new(deadline),
        }
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        *self.deadline.lock().expect("waiter deadline lock poisoned")
    }

    /// `deadline = max(now, deadline) + extends`.
    pub fn extend(&self, extends_seconds: i64) {
        let mut deadline = self.deadline.lock().expect("waiter deadline lock poisoned");
        let base = (*deadline).max(Utc::now());
        *deadline = base + Duration::seconds(extends_seconds);
    }

    pub fn remaining_seconds(&self) -> i64 {
        (self.deadline() - Utc::now()).num_seconds().max(0)
    }
}

/// Process-local registry of blocked requests, keyed by
/// `(session_id, agent_id)`. Sessions hold no back-reference to waiters;
/// lookup always goes through this map. Cloning shares the same registry.
#[derive(Clone)]
pub struct WaiterRegistry {
    inner: Arc<Mutex<HashMap<String, HashMap<String, Arc<WaiterSlot>>>>>,
}

impl WaiterRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register an agent as waiting on a session. A newer registration for
    /// the same key replaces the older one.
    pub fn register(
        &self,
        session_id: &str,
        agent_id: &str,
        deadline: DateTime<Utc>,
    ) -> WaiterGuard {
        let slot = Arc::new(WaiterSlot::new(deadline));
        self.inner
            .lock()
            .expect("waiter registry lock poisoned")
            .entry(session_id.to_string())
            .or_default()
            .insert(agent_id.to_string(), slot.clone());

        WaiterGuard {
            registry: self.clone(),
            session_id: session_id.to_string(),
            agent_id: agent_id.to_string(),
            slot,
        }
    }

    pub fn get(&self, session_id: &str, agent_id: &str) -> Option<Arc<WaiterSlot>> {
        self.inner
            .lock()
            .expect("waiter registry lock poisoned")
            .get(session_id)
            .and_then(|agents| agents.get(agent_id))
            .cloned()
    }

    /// Whether any agent other than `except_agent_id` is waiting on the
    /// session with a live deadline.
    pub fn has_other_waiter(&self, session_id: &str, except_agent_id: &str) -> bool {
        let now = Utc::now();
        self.inner
            .lock()
            .expect("waiter registry lock poisoned")
            .get(session_id)
            .is_some_and(|agents| {
                agents
                    .iter()
                    .any(|(aid, slot)| aid != except_agent_id && slot.deadline() > now)
            })
    }

    fn deregister(&self, session_id: &str, agent_id: &str, slot: &Arc<WaiterSlot>) {
        let mut inner = self.inner.lock().expect("waiter registry lock poisoned");
        if let Some(agents) = inner.get_mut(session_id) {
            // Only remove our own registration; a replacement stays.
            if agents
                .get(agent_id)
                .is_some_and(|current| Arc::ptr_eq(current, slot))
            {
                agents.remove(agent_id);
            }
            if agents.is_empty() {
                inner.remove(session_id);
            }
        }
    }
}

impl Default for WaiterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII registration handle; deregisters on drop.
pub struct WaiterGuard {
    registry: WaiterRegistry,
    session_id: String,
    agent_id: String,
    slot: Arc<WaiterSlot>,
}

impl WaiterGuard {
    pub fn slot(&self) -> &WaiterSlot {
        &self.slot
    }
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.registry
            .deregister(&self.session_id, &self.agent_id, &self.slot);
    }
}

/// Terminal outcome of a blocked send.
#[derive(Clone, Debug, PartialEq)]
pub enum WaitOutcome {
    Replied { from: String, body: String },
    SenderLeft { from: String, body: String },
    DeadlineReached,
}

impl WaitOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            WaitOutcome::Replied { .. } => "replied",
            WaitOutcome::SenderLeft { .. } => "sender_left",
            WaitOutcome::DeadlineReached => "deadline_reached",
        }
    }
}

/// Block until another participant replies, the (extendable) deadline
/// elapses, or the caller is cancelled by dropping this future.
///
/// Hang-on messages and read receipts from other participants extend the
/// deadline; the waiter's own sent message is skipped by id so a replay of
/// it never satisfies the wait.
pub async fn wait_for_reply(
    bus: &EventBus,
    registry: &WaiterRegistry,
    session_id: &str,
    agent_id: &str,
    own_message_id: &str,
    wait_seconds: i64,
) -> WaitOutcome {
    let mut rx = bus.subscribe(session_id).await;
    let guard = registry.register(session_id, agent_id, Utc::now() + Duration::seconds(wait_seconds));

    loop {
        let now = Utc::now();
        let deadline = guard.slot().deadline();
        if now >= deadline {
            return WaitOutcome::DeadlineReached;
        }
        let remaining = (deadline - now).to_std().unwrap_or_default();

        tokio::select! {
            event = rx.recv() => match event {
                Ok(Event::Message {
                    message_id,
                    from_agent,
                    from_agent_id,
                    body,
                    sender_leaving,
                    hang_on,
                    extends_wait_seconds,
                    ..
                }) => {
                    if message_id == own_message_id || from_agent_id == agent_id {
                        continue;
                    }
                    if hang_on {
                        if extends_wait_seconds > 0 {
                            guard.slot().extend(extends_wait_seconds);
                        }
                        continue;
                    }
                    if sender_leaving {
                        return WaitOutcome::SenderLeft { from: from_agent, body };
                    }
                    return WaitOutcome::Replied { from: from_agent, body };
                }
                Ok(Event::ReadReceipt { reader_agent_id, extends_wait_seconds, .. }) => {
                    if reader_agent_id != agent_id && extends_wait_seconds > 0 {
                        guard.slot().extend(extends_wait_seconds);
                    }
                }
                Ok(Event::Mail { .. }) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "waiter on session {} lagged, skipped {} events",
                        session_id,
                        skipped
                    );
                }
                Err(RecvError::Closed) => {
                    rx = bus.subscribe(session_id).await;
                }
            },
            _ = tokio::time::sleep(remaining) => {
                // Loop re-checks the deadline, which an extension may have
                // pushed out since this sleep was armed.
            }
        }
    }
}
