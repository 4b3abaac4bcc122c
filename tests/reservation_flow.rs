//! Reservation lease integration: conflict detection, holder-only mutation,
//! TTL expiry, and prefix listing.

mod common;

use aweb::db::fmt_ts;
use aweb::error::Error;
use aweb::reservations;
use common::{bootstrap_agent, test_state};

const MAX_TTL: i64 = 86_400;

async fn expire_now(state: &aweb::config::AppState, project_id: &str, key: &str) {
    let past = fmt_ts(chrono::Utc::now() - chrono::Duration::seconds(10));
    sqlx::query(
        "UPDATE reservations SET expires_at = ? WHERE project_id = ? AND resource_key = ?",
    )
    .bind(&past)
    .bind(project_id)
    .bind(key)
    .execute(&state.pool)
    .await
    .unwrap();
}

#[tokio::test]
async fn second_acquirer_sees_the_holder_in_the_conflict() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let held = reservations::acquire(
        &state.pool,
        &alice.project_id,
        &alice.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({"reason": "release build"}),
    )
    .await
    .unwrap();
    assert_eq!(held.holder_alias, "alice");
    assert!(held.expires_at > held.acquired_at);

    let err = reservations::acquire(
        &state.pool,
        &bob.project_id,
        &bob.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap_err();
    match err {
        Error::ReservationHeld {
            holder_agent_id,
            holder_alias,
            ..
        } => {
            assert_eq!(holder_agent_id, alice.agent_id);
            assert_eq!(holder_alias, "alice");
        }
        other => panic!("expected ReservationHeld, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_rows_are_overwritten_by_any_acquirer() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    reservations::acquire(
        &state.pool,
        &alice.project_id,
        &alice.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();
    expire_now(&state, &alice.project_id, "build/main").await;

    let taken = reservations::acquire(
        &state.pool,
        &bob.project_id,
        &bob.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();
    assert_eq!(taken.holder_alias, "bob");
}

#[tokio::test]
async fn renew_requires_a_live_lease_held_by_the_caller() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    let held = reservations::acquire(
        &state.pool,
        &alice.project_id,
        &alice.agent_id,
        "deploy",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();

    let renewed = reservations::renew(
        &state.pool,
        &alice.project_id,
        &alice.agent_id,
        "deploy",
        120,
        MAX_TTL,
    )
    .await
    .unwrap();
    assert!(renewed > held.expires_at);

    // Another live holder's lease cannot be renewed.
    let err = reservations::renew(&state.pool, &bob.project_id, &bob.agent_id, "deploy", 60, MAX_TTL)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    // Absent and expired rows are NOT_FOUND.
    let err =
        reservations::renew(&state.pool, &alice.project_id, &alice.agent_id, "ghost", 60, MAX_TTL)
            .await
            .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    expire_now(&state, &alice.project_id, "deploy").await;
    let err =
        reservations::renew(&state.pool, &alice.project_id, &alice.agent_id, "deploy", 60, MAX_TTL)
            .await
            .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn release_then_reacquire_succeeds() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    reservations::acquire(
        &state.pool,
        &alice.project_id,
        &alice.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();

    // A non-holder cannot release a live lease.
    let err = reservations::release(&state.pool, &bob.project_id, &bob.agent_id, "build/main")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    assert!(reservations::release(&state.pool, &alice.project_id, &alice.agent_id, "build/main")
        .await
        .unwrap());

    // Releasing a missing row is idempotent.
    assert!(!reservations::release(&state.pool, &alice.project_id, &alice.agent_id, "build/main")
        .await
        .unwrap());

    let taken = reservations::acquire(
        &state.pool,
        &bob.project_id,
        &bob.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();
    assert_eq!(taken.holder_alias, "bob");
}

#[tokio::test]
async fn list_excludes_expired_and_filters_by_prefix() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;

    for key in ["build/main", "build/docs", "deploy/prod"] {
        reservations::acquire(
            &state.pool,
            &alice.project_id,
            &alice.agent_id,
            key,
            60,
            MAX_TTL,
            &serde_json::json!({}),
        )
        .await
        .unwrap();
    }
    expire_now(&state, &alice.project_id, "build/docs").await;

    let all = reservations::list(&state.pool, &alice.project_id, None)
        .await
        .unwrap();
    let keys: Vec<&str> = all.iter().map(|r| r.resource_key.as_str()).collect();
    assert_eq!(keys, vec!["build/main", "deploy/prod"]);

    let build = reservations::list(&state.pool, &alice.project_id, Some("build/"))
        .await
        .unwrap();
    assert_eq!(build.len(), 1);
    assert_eq!(build[0].resource_key, "build/main");

    // LIKE wildcards in the prefix are literal.
    let weird = reservations::list(&state.pool, &alice.project_id, Some("build/%"))
        .await
        .unwrap();
    assert!(weird.is_empty());
}

#[tokio::test]
async fn revoke_bulk_releases_own_keys_only() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj", "alice").await;
    let bob = bootstrap_agent(&state, "proj", "bob").await;

    for key in ["work/a", "work/b"] {
        reservations::acquire(
            &state.pool,
            &alice.project_id,
            &alice.agent_id,
            key,
            60,
            MAX_TTL,
            &serde_json::json!({}),
        )
        .await
        .unwrap();
    }
    reservations::acquire(
        &state.pool,
        &bob.project_id,
        &bob.agent_id,
        "work/c",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();

    // Bob's prefix revoke can't touch alice's keys; with only her keys
    // matching a narrower prefix it is a FORBIDDEN.
    let err = reservations::revoke(&state.pool, &bob.project_id, &bob.agent_id, Some("work/a"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    let deleted = reservations::revoke(&state.pool, &alice.project_id, &alice.agent_id, Some("work/"))
        .await
        .unwrap();
    assert_eq!(deleted, 2);

    let remaining = reservations::list(&state.pool, &alice.project_id, None)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].holder_alias, "bob");
}

#[tokio::test]
async fn reservations_are_scoped_per_project() {
    let (state, _dir) = test_state().await;
    let alice = bootstrap_agent(&state, "proj-p", "alice").await;
    let carol = bootstrap_agent(&state, "proj-q", "carol").await;

    reservations::acquire(
        &state.pool,
        &alice.project_id,
        &alice.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();

    // Same key in another project is a distinct lease.
    let taken = reservations::acquire(
        &state.pool,
        &carol.project_id,
        &carol.agent_id,
        "build/main",
        60,
        MAX_TTL,
        &serde_json::json!({}),
    )
    .await
    .unwrap();
    assert_eq!(taken.holder_alias, "carol");

    let p_list = reservations::list(&state.pool, &alice.project_id, None)
        .await
        .unwrap();
    assert_eq!(p_list.len(), 1);
    assert_eq!(p_list[0].holder_alias, "alice");
}
