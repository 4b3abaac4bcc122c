//! Project, agent, and API-key identity store.
//!
//! Bootstrap is find-or-create at every level: a project by slug, an agent by
//! alias (or auto-allocated), and a fresh agent-bound API key. Re-running
//! init for an existing agent rotates its key rather than stacking actives.

pub mod alias;
pub mod contacts;

use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::auth::generate_api_key;
use crate::db::now_ts;
use crate::error::{Error, Result};
use crate::identity::alias::{candidate_name_prefixes, used_name_prefixes};

pub const PROJECT_SLUG_MAX_LENGTH: usize = 256;
pub const AGENT_ALIAS_MAX_LENGTH: usize = 64;

/// Validate a project slug: alphanumeric plus `/ _ . -`.
pub fn validate_project_slug(slug: &str) -> Result<String> {
    let slug = slug.trim();
    if slug.is_empty() {
        return Err(Error::InvalidArgument("project_slug is required".to_string()));
    }
    if slug.len() > PROJECT_SLUG_MAX_LENGTH {
        return Err(Error::InvalidArgument("project_slug too long".to_string()));
    }
    let valid = slug
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'));
    if !valid {
        return Err(Error::InvalidArgument("invalid project_slug format".to_string()));
    }
    Ok(slug.to_string())
}

/// Validate an agent alias: alphanumeric start, then alphanumeric plus `_ -`.
/// `/` is reserved for cross-namespace addresses and never allowed.
pub fn validate_agent_alias(alias: &str) -> Result<String> {
    let alias = alias.trim();
    if alias.is_empty() {
        return Err(Error::InvalidArgument("alias is required".to_string()));
    }
    if alias.len() > AGENT_ALIAS_MAX_LENGTH {
        return Err(Error::InvalidArgument("alias too long".to_string()));
    }
    let mut chars = alias.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphanumeric());
    let rest_ok = chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
    if !head_ok || !rest_ok {
        return Err(Error::InvalidArgument("invalid alias format".to_string()));
    }
    Ok(alias.to_string())
}

#[derive(Clone, Debug)]
pub struct AgentRow {
    pub agent_id: String,
    pub project_id: String,
    pub alias: String,
    pub human_name: String,
    pub agent_type: String,
    pub access_mode: String,
    pub status: String,
}

fn agent_from_row(row: &sqlx::sqlite::SqliteRow) -> AgentRow {
    AgentRow {
        agent_id: row.get("agent_id"),
        project_id: row.get("project_id"),
        alias: row.get("alias"),
        human_name: row.get("human_name"),
        agent_type: row.get("agent_type"),
        access_mode: row.get("access_mode"),
        status: row.get("status"),
    }
}

const AGENT_COLUMNS: &str =
    "agent_id, project_id, alias, human_name, agent_type, access_mode, status";

/// Look up a live agent by id within a project.
pub async fn get_agent_by_id(
    pool: &SqlitePool,
    project_id: &str,
    agent_id: &str,
) -> Result<Option<AgentRow>> {
    let row = sqlx::query(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents
         WHERE agent_id = ? AND project_id = ? AND deleted_at IS NULL"
    ))
    .bind(agent_id)
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(agent_from_row))
}

/// Look up a live agent by alias within a project.
pub async fn get_agent_by_alias(
    pool: &SqlitePool,
    project_id: &str,
    alias: &str,
) -> Result<Option<AgentRow>> {
    let row = sqlx::query(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents
         WHERE project_id = ? AND alias = ? AND deleted_at IS NULL"
    ))
    .bind(project_id)
    .bind(alias)
    .fetch_optional(pool)
    .await?;
    Ok(row.as_ref().map(agent_from_row))
}

/// List live agents of a project, ordered by alias.
pub async fn list_agents(pool: &SqlitePool, project_id: &str) -> Result<Vec<AgentRow>> {
    let rows = sqlx::query(&format!(
        "SELECT {AGENT_COLUMNS} FROM agents
         WHERE project_id = ? AND deleted_at IS NULL
         ORDER BY alias"
    ))
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(agent_from_row).collect())
}

#[derive(Clone, Debug)]
pub struct ProjectRow {
    pub project_id: String,
    pub slug: String,
    pub name: String,
}

pub async fn get_project(pool: &SqlitePool, project_id: &str) -> Result<Option<ProjectRow>> {
    let row = sqlx::query(
        "SELECT project_id, slug, name FROM projects
         WHERE project_id = ? AND deleted_at IS NULL",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| ProjectRow {
        project_id: r.get("project_id"),
        slug: r.get("slug"),
        name: r.get("name"),
    }))
}

pub async fn get_project_by_slug(pool: &SqlitePool, slug: &str) -> Result<Option<ProjectRow>> {
    let row = sqlx::query(
        "SELECT project_id, slug, name FROM projects
         WHERE slug = ? AND deleted_at IS NULL",
    )
    .bind(slug)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|r| ProjectRow {
        project_id: r.get("project_id"),
        slug: r.get("slug"),
        name: r.get("name"),
    }))
}

#[derive(Clone, Debug)]
pub struct BootstrapResult {
    pub project_id: String,
    pub project_slug: String,
    pub project_name: String,
    pub agent_id: String,
    pub alias: String,
    pub api_key: String,
    pub created: bool,
}

/// Bootstrap a project, agent, and API key in one transaction.
pub async fn bootstrap_identity(
    pool: &SqlitePool,
    project_slug: &str,
    project_name: &str,
    alias: Option<&str>,
    human_name: &str,
    agent_type: &str,
) -> Result<BootstrapResult> {
    let project_slug = validate_project_slug(project_slug)?;
    let alias = match alias {
        Some(a) if !a.trim().is_empty() => Some(validate_agent_alias(a)?),
        _ => None,
    };
    let agent_type = {
        let t = agent_type.trim();
        if t.is_empty() { "agent" } else { t }
    };

    let mut tx = pool.begin().await?;

    // Find-or-create the project by slug.
    let project = sqlx::query(
        "SELECT project_id, slug, name FROM projects
         WHERE slug = ? AND deleted_at IS NULL",
    )
    .bind(&project_slug)
    .fetch_optional(&mut *tx)
    .await?;

    let (project_id, actual_slug, actual_name) = match project {
        Some(row) => (
            row.get::<String, _>("project_id"),
            row.get::<String, _>("slug"),
            row.get::<String, _>("name"),
        ),
        None => {
            let project_id = Uuid::new_v4().to_string();
            sqlx::query(
                "INSERT INTO projects (project_id, slug, name, created_at)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&project_id)
            .bind(&project_slug)
            .bind(project_name)
            .bind(now_ts())
            .execute(&mut *tx)
            .await?;
            (project_id, project_slug.clone(), project_name.to_string())
        }
    };

    // Find-or-create the agent.
    let (agent_id, alias, created) = match alias {
        Some(alias) => {
            let existing = sqlx::query(
                "SELECT agent_id FROM agents
                 WHERE project_id = ? AND alias = ? AND deleted_at IS NULL",
            )
            .bind(&project_id)
            .bind(&alias)
            .fetch_optional(&mut *tx)
            .await?;

            match existing {
                Some(row) => (row.get::<String, _>("agent_id"), alias, false),
                None => {
                    let agent_id =
                        insert_agent(&mut tx, &project_id, &alias, human_name, agent_type).await?;
                    (agent_id, alias, true)
                }
            }
        }
        None => {
            let existing: Vec<String> = sqlx::query(
                "SELECT alias FROM agents
                 WHERE project_id = ? AND deleted_at IS NULL
                 ORDER BY alias",
            )
            .bind(&project_id)
            .fetch_all(&mut *tx)
            .await?
            .iter()
            .map(|r| r.get::<String, _>("alias"))
            .collect();

            let used = used_name_prefixes(existing.iter().map(|s| s.as_str()));
            let allocated = candidate_name_prefixes()
                .find(|candidate| !used.contains(candidate))
                .ok_or_else(|| Error::Conflict("alias_exhausted".to_string()))?;

            let agent_id =
                insert_agent(&mut tx, &project_id, &allocated, human_name, agent_type).await?;
            (agent_id, allocated, true)
        }
    };

    // Rotate: at most one active key per agent.
    sqlx::query("UPDATE api_keys SET is_active = 0 WHERE agent_id = ? AND is_active = 1")
        .bind(&agent_id)
        .execute(&mut *tx)
        .await?;

    let (api_key, key_prefix, key_hash) = generate_api_key();
    sqlx::query(
        "INSERT INTO api_keys (api_key_id, project_id, agent_id, key_prefix, key_hash, is_active, created_at)
         VALUES (?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&project_id)
    .bind(&agent_id)
    .bind(&key_prefix)
    .bind(&key_hash)
    .bind(now_ts())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    if created {
        info!("bootstrapped agent {} in project {}", alias, actual_slug);
    }

    Ok(BootstrapResult {
        project_id,
        project_slug: actual_slug,
        project_name: actual_name,
        agent_id,
        alias,
        api_key,
        created,
    })
}

async fn insert_agent(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    project_id: &str,
    alias: &str,
    human_name: &str,
    agent_type: &str,
) -> Result<String> {
    let agent_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO agents (agent_id, project_id, alias, human_name, agent_type, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&agent_id)
    .bind(project_id)
    .bind(alias)
    .bind(human_name)
    .bind(agent_type)
    .bind(now_ts())
    .execute(&mut **tx)
    .await?;
    Ok(agent_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slug_validation() {
        for slug in ["my-project", "org/repo", "a", "my_project.v2", "Org/Sub/Repo", "123"] {
            assert!(validate_project_slug(slug).is_ok(), "{slug} should be valid");
        }
        for slug in ["has\\backslash", "has space", "", "has@at", "has#hash"] {
            assert!(validate_project_slug(slug).is_err(), "{slug} should be rejected");
        }
    }

    #[test]
    fn alias_validation_rejects_slash() {
        for alias in ["alice", "agent1", "my-agent", "my_agent", "A", "a1-b2_c3"] {
            assert!(validate_agent_alias(alias).is_ok(), "{alias} should be valid");
        }
        for alias in ["has/slash", "_starts", "-starts", "has space", "", "has@at"] {
            assert!(validate_agent_alias(alias).is_err(), "{alias} should be rejected");
        }
    }
}
