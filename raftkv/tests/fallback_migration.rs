//! Fallback controller migration between two clusters and a standalone
//! store.
//!
//! What does this test do?
//!
//! - builds a high-priority two-node cluster (R2) and a low-priority
//!   single-node cluster (R1) behind one fallback controller;
//! - partitions R2 so it reports unavailable (its leader also trips the
//!   two-node stale-follower guard), and asserts the controller migrates
//!   down to R1, overwriting R1's contents with R2's data;
//! - heals R2 and asserts the controller migrates back up using the null
//!   rejoin strategy, leaving R2's contents untouched;
//! - asserts a transaction straddling a migration fails with a retry error.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use memkv::MemKv;
use pretty_assertions::assert_eq;
use raftkv::Config;
use raftkv::Consistency;
use raftkv::FallbackKv;
use raftkv::FallbackTarget;

async fn wait_for_target(fallback: &FallbackKv<MemKv, RaftRouter>, want: i32, msg: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if fallback.status().current_target_index == want {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for fallback target {}: {} (status {:?})",
            want,
            msg,
            fallback.status()
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn migrates_down_and_back_up() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("fallback".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));

    // R1: a single-node cluster; R2: a two-node cluster with higher
    // priority.
    router.build_cluster("r1", &[]).await?;
    router.build_cluster("r2a", &["r2b"]).await?;
    router.put("r1", b"site", b"r1-old").await?;
    router.put("r2a", b"site", b"r2-data").await?;

    let standalone = Arc::new(MemKv::new());
    let state_dir = tempfile::tempdir()?;
    let state_file = state_dir.path().join("fallback.state");

    let tune = |mut target: FallbackTarget<MemKv, RaftRouter>| {
        target.transaction_timeout = Duration::from_millis(200);
        target.check_interval = Duration::from_millis(100);
        target.min_available_time = Duration::from_millis(300);
        target.min_unavailable_time = Duration::from_millis(300);
        target
    };
    let targets = vec![
        tune(FallbackTarget::new(router.node("r1").await?)),
        tune(FallbackTarget::new(router.node("r2a").await?)),
    ];

    let fallback = FallbackKv::start(targets, standalone.clone(), &state_file)?;

    // The controller starts on the highest-priority target.
    wait_for_target(&fallback, 1, "initial target").await;
    let tx = fallback.create_transaction(Consistency::Linearizable).await?;
    tx.put(b"via-fallback".to_vec(), b"on-r2".to_vec())?;
    tx.commit().await?;
    assert_eq!(
        router.get("r2a", b"via-fallback", Consistency::Linearizable).await?,
        Some(b"on-r2".to_vec())
    );

    // Partition R2 internally: its leader now has a stale lone follower and
    // cannot serve linearizable reads, so availability collapses.
    tracing::info!("--- partitioning R2");
    router.isolate_node("r2b").await;

    wait_for_target(&fallback, 0, "migrate down to R1").await;
    assert!(fallback.migration_count() >= 1);

    // Moving down used R2's unavailable strategy (overwrite): R1 now holds
    // R2's data, and R1's old contents are gone.
    let r1_store = router.get_storage_handle("r1").await?;
    assert_eq!(r1_store.read(b"site").await, Some(b"r2-data".to_vec()));
    assert_eq!(r1_store.read(b"via-fallback").await, Some(b"on-r2".to_vec()));

    // New transactions land on R1.
    let tx = fallback.create_transaction(Consistency::Linearizable).await?;
    tx.put(b"during-fallback".to_vec(), b"on-r1".to_vec())?;
    tx.commit().await?;
    assert_eq!(r1_store.read(b"during-fallback").await, Some(b"on-r1".to_vec()));

    // The controller's choice was persisted.
    let state_bytes = std::fs::read(&state_file)?;
    assert!(!state_bytes.is_empty());

    // Heal R2; once it has been available for the minimum time the
    // controller migrates back, and the null rejoin strategy leaves R2
    // untouched.
    tracing::info!("--- healing R2");
    router.restore_node("r2b").await;

    wait_for_target(&fallback, 1, "migrate back to R2").await;
    let r2_store = router.get_storage_handle("r2a").await?;
    assert_eq!(router.get("r2a", b"site", Consistency::Linearizable).await?, Some(b"r2-data".to_vec()));
    assert_eq!(r2_store.read(b"during-fallback").await, None, "null rejoin must not copy data");

    fallback.shutdown().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn transaction_straddling_a_migration_is_retried() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("fallback-straddle".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("r1", &[]).await?;

    let standalone = Arc::new(MemKv::new());
    let state_dir = tempfile::tempdir()?;
    let state_file = state_dir.path().join("fallback.state");

    let mut target = FallbackTarget::new(router.node("r1").await?);
    target.transaction_timeout = Duration::from_millis(200);
    target.check_interval = Duration::from_millis(100);
    target.min_available_time = Duration::from_millis(200);
    target.min_unavailable_time = Duration::from_millis(200);

    let fallback = FallbackKv::start(vec![target], standalone.clone(), &state_file)?;
    wait_for_target(&fallback, 0, "initial target").await;

    // Open a transaction, then force the controller onto the standalone
    // store underneath it.
    let tx = fallback.create_transaction(Consistency::Linearizable).await?;
    tx.put(b"late".to_vec(), b"value".to_vec())?;

    fallback.force_standalone(true);
    wait_for_target(&fallback, -1, "forced standalone").await;

    let err = tx.commit().await.expect_err("commit across a migration must fail");
    assert!(err.is_retryable(), "unexpected error: {:?}", err);

    // Retrying on the newly selected store succeeds, and lands standalone.
    let tx = fallback.create_transaction(Consistency::Linearizable).await?;
    tx.put(b"late".to_vec(), b"value".to_vec())?;
    tx.commit().await?;
    assert_eq!(standalone.read(b"late").await, Some(b"value".to_vec()));

    fallback.shutdown().await?;
    Ok(())
}
