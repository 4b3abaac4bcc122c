//! Best-effort agent presence via TTL-keyed heartbeats.
//!
//! Ephemeral, in-process state: an agent is online iff it has heartbeated
//! within the TTL. Absence of an entry means offline. Presence never gates
//! delivery and is never authoritative for durability; stale entries are
//! pruned lazily on read.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

#[derive(Clone, Debug)]
pub struct PresenceEntry {
    pub agent_id: String,
    pub alias: String,
    pub last_seen: DateTime<Utc>,
}

pub struct PresenceStore {
    ttl: Duration,
    // (project_id, agent_id) -> entry
    entries: RwLock<HashMap<(String, String), PresenceEntry>>,
}

impl PresenceStore {
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            ttl: Duration::seconds(ttl_seconds),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    /// Record a heartbeat. Returns the timestamp written.
    pub async fn heartbeat(&self, project_id: &str, agent_id: &str, alias: &str) -> DateTime<Utc> {
        let now = Utc::now();
        self.entries.write().await.insert(
            (project_id.to_string(), agent_id.to_string()),
            PresenceEntry {
                agent_id: agent_id.to_string(),
                alias: alias.to_string(),
                last_seen: now,
            },
        );
        now
    }

    fn is_fresh(&self, entry: &PresenceEntry, now: DateTime<Utc>) -> bool {
        now - entry.last_seen < self.ttl
    }

    pub async fn is_online(&self, project_id: &str, agent_id: &str) -> bool {
        let key = (project_id.to_string(), agent_id.to_string());
        let now = Utc::now();

        {
            let entries = self.entries.read().await;
            match entries.get(&key) {
                Some(entry) if self.is_fresh(entry, now) => return true,
                Some(_) => {}
                None => return false,
            }
        }

        // Entry exists but expired; prune it.
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get(&key) {
            if self.is_fresh(entry, now) {
                return true;
            }
            entries.remove(&key);
        }
        false
    }

    /// Fetch an agent's presence record, or `None` if absent or expired.
    pub async fn get(&self, project_id: &str, agent_id: &str) -> Option<PresenceEntry> {
        if !self.is_online(project_id, agent_id).await {
            return None;
        }
        self.entries
            .read()
            .await
            .get(&(project_id.to_string(), agent_id.to_string()))
            .cloned()
    }

    /// Subset of `agent_ids` that are currently online in the project.
    pub async fn online_agents(&self, project_id: &str, agent_ids: &[String]) -> Vec<String> {
        let now = Utc::now();
        let entries = self.entries.read().await;
        agent_ids
            .iter()
            .filter(|aid| {
                entries
                    .get(&(project_id.to_string(), (*aid).clone()))
                    .is_some_and(|e| self.is_fresh(e, now))
            })
            .cloned()
            .collect()
    }

    /// Drop presence for the given agents. Returns the count removed.
    pub async fn clear(&self, project_id: &str, agent_ids: &[String]) -> usize {
        let mut entries = self.entries.write().await;
        agent_ids
            .iter()
            .filter(|aid| {
                entries
                    .remove(&(project_id.to_string(), (*aid).clone()))
                    .is_some()
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_marks_online_within_ttl() {
        let store = PresenceStore::new(60);
        assert!(!store.is_online("p1", "a1").await);

        store.heartbeat("p1", "a1", "alice").await;
        assert!(store.is_online("p1", "a1").await);
        assert!(!store.is_online("p2", "a1").await);

        let entry = store.get("p1", "a1").await.unwrap();
        assert_eq!(entry.alias, "alice");
    }

    #[tokio::test]
    async fn expired_entries_read_as_offline_and_are_pruned() {
        let store = PresenceStore::new(0);
        store.heartbeat("p1", "a1", "alice").await;
        assert!(!store.is_online("p1", "a1").await);
        assert!(store.entries.read().await.is_empty());
    }

    #[tokio::test]
    async fn online_agents_filters_by_project_and_freshness() {
        let store = PresenceStore::new(60);
        store.heartbeat("p1", "a1", "alice").await;
        store.heartbeat("p1", "a2", "bob").await;

        let ids = vec!["a1".to_string(), "a2".to_string(), "a3".to_string()];
        let online = store.online_agents("p1", &ids).await;
        assert_eq!(online, vec!["a1".to_string(), "a2".to_string()]);
        assert!(store.online_agents("p2", &ids).await.is_empty());

        assert_eq!(store.clear("p1", &ids).await, 2);
        assert!(store.online_agents("p1", &ids).await.is_empty());
    }
}
