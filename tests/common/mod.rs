//! Shared harness for integration tests: a fresh on-disk SQLite store per
//! test plus bootstrap helpers.
#![allow(dead_code)]

use aweb::config::{AppState, Settings};
use aweb::identity::BootstrapResult;
use tempfile::TempDir;

pub async fn test_state() -> (AppState, TempDir) {
    test_state_with(Settings::default()).await
}

pub async fn test_state_with(settings: Settings) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("aweb.sqlite");
    let pool = aweb::db::init_pool(db_path.to_str().unwrap()).await.unwrap();
    (AppState::new(pool, settings), dir)
}

pub async fn bootstrap_agent(state: &AppState, slug: &str, alias: &str) -> BootstrapResult {
    aweb::identity::bootstrap_identity(&state.pool, slug, "", Some(alias), "", "agent")
        .await
        .unwrap()
}
