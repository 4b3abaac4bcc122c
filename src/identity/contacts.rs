//! Project contact lists and the access-mode gate.
//!
//! Contacts are addresses (`org` or `org/alias`) a project has allowlisted.
//! They only matter when a destination agent has `access_mode =
//! contacts_only`: the sender's canonical address must then appear in the
//! destination project's contact set, exactly or at org level.

use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::db::now_ts;
use crate::error::{Error, Result};
use crate::identity::AgentRow;

pub const CONTACT_ADDRESS_MAX_LENGTH: usize = 256;

/// Contact addresses share the slug charset: alphanumeric plus `/ _ . -`.
pub fn validate_contact_address(address: &str) -> Result<String> {
    let address = address.trim();
    if address.is_empty() {
        return Err(Error::InvalidArgument("contact_address is required".to_string()));
    }
    if address.len() > CONTACT_ADDRESS_MAX_LENGTH {
        return Err(Error::InvalidArgument("contact_address too long".to_string()));
    }
    let valid = address
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-'));
    if !valid {
        return Err(Error::InvalidArgument("invalid contact_address format".to_string()));
    }
    Ok(address.to_string())
}

#[derive(Clone, Debug)]
pub struct ContactRow {
    pub contact_id: String,
    pub contact_address: String,
    pub label: Option<String>,
    pub created_at: String,
}

pub async fn add_contact(
    pool: &SqlitePool,
    project_id: &str,
    contact_address: &str,
    label: Option<&str>,
) -> Result<ContactRow> {
    let address = validate_contact_address(contact_address)?;

    let project = sqlx::query(
        "SELECT slug FROM projects WHERE project_id = ? AND deleted_at IS NULL",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| Error::NotFound("project not found".to_string()))?;

    let slug: String = project.get("slug");
    if address == slug || address.starts_with(&format!("{slug}/")) {
        return Err(Error::InvalidArgument("cannot add self as contact".to_string()));
    }

    let contact_id = Uuid::new_v4().to_string();
    let created_at = now_ts();
    let inserted = sqlx::query(
        "INSERT INTO contacts (contact_id, project_id, contact_address, label, created_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (project_id, contact_address) DO NOTHING",
    )
    .bind(&contact_id)
    .bind(project_id)
    .bind(&address)
    .bind(label)
    .bind(&created_at)
    .execute(pool)
    .await?;

    if inserted.rows_affected() == 0 {
        return Err(Error::Conflict("contact already exists".to_string()));
    }

    Ok(ContactRow {
        contact_id,
        contact_address: address,
        label: label.map(|l| l.to_string()),
        created_at,
    })
}

pub async fn list_contacts(pool: &SqlitePool, project_id: &str) -> Result<Vec<ContactRow>> {
    let rows = sqlx::query(
        "SELECT contact_id, contact_address, label, created_at
         FROM contacts
         WHERE project_id = ?
         ORDER BY contact_address",
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|r| ContactRow {
            contact_id: r.get("contact_id"),
            contact_address: r.get("contact_address"),
            label: r.get("label"),
            created_at: r.get("created_at"),
        })
        .collect())
}

/// Remove a contact by id. Idempotent: removing an absent contact succeeds.
pub async fn remove_contact(pool: &SqlitePool, project_id: &str, contact_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM contacts WHERE contact_id = ? AND project_id = ?")
        .bind(contact_id)
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Whether `sender_address` may reach `recipient`.
///
/// Open recipients accept any sender in the project. Contacts-only
/// recipients require the sender's address in the project's contact set,
/// matched exactly or at org level.
pub async fn check_access(
    pool: &SqlitePool,
    recipient: &AgentRow,
    sender_address: &str,
) -> Result<bool> {
    if recipient.access_mode == "open" {
        return Ok(true);
    }

    let org = sender_address.split('/').next().unwrap_or(sender_address);
    let row = sqlx::query(
        "SELECT 1 FROM contacts
         WHERE project_id = ? AND contact_address IN (?, ?)",
    )
    .bind(&recipient.project_id)
    .bind(sender_address)
    .bind(org)
    .fetch_optional(pool)
    .await?;

    Ok(row.is_some())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contact_address_validation() {
        for addr in ["alice", "org/agent", "my_contact.v2", "a-b", "a/b/c"] {
            assert!(validate_contact_address(addr).is_ok(), "{addr} should be valid");
        }
        for addr in ["has\\backslash", "has space", "", "has@at"] {
            assert!(validate_contact_address(addr).is_err(), "{addr} should be rejected");
        }
    }
}
