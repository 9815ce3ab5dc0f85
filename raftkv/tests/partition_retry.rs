//! Partition the leader away and retry on the new one.
//!
//! What does this test do?
//!
//! - brings a three-node cluster online with `a` as leader;
//! - partitions `a` from `b` and `c`;
//! - a pending read-write transaction on `a` times out;
//! - `b` or `c` wins an election in a higher term; the client retries there
//!   and succeeds;
//! - when `a` is restored it steps down, discards its dead-end entry, and
//!   converges on the new timeline.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;
use raftkv::error::CommitError;
use raftkv::Config;
use raftkv::Consistency;
use raftkv::RoleKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn partitioned_leader_times_out_and_retry_succeeds() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("partition".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;

    router.put("a", b"stable", b"before-partition").await?;
    let pre_partition_applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], pre_partition_applied, "baseline").await?;

    tracing::info!("--- partitioning the leader");
    router.isolate_node("a").await;

    // A write on the isolated leader cannot reach a majority and times out.
    let old_leader = router.node("a").await?;
    let tx = old_leader.create_transaction(Consistency::Linearizable).await?;
    tx.put(b"k".to_vec(), b"doomed".to_vec())?;
    tx.set_timeout(Duration::from_millis(500))?;
    let err = tx.commit().await.expect_err("commit on a partitioned leader must fail");
    assert!(matches!(err, CommitError::Timeout), "unexpected error: {:?}", err);

    // The majority side elects a new leader in a higher term.
    let new_leader = router.wait_for_leader(&["b", "c"], "majority side elects").await?;
    assert_ne!(new_leader, "a");
    let new_term = router.node(&new_leader).await?.status().current_term;
    assert!(new_term > 1, "expected a new term, got {}", new_term);

    // The client retries on the new leader and succeeds.
    router.put(&new_leader, b"k", b"survived").await?;
    assert_eq!(
        router.get(&new_leader, b"k", Consistency::Linearizable).await?,
        Some(b"survived".to_vec())
    );

    tracing::info!("--- healing the partition");
    router.restore_node("a").await;

    // The old leader observes the higher term, steps down, and replaces its
    // uncommitted entry with the new timeline.
    router
        .wait("a", Some(Duration::from_secs(5)))
        .await?
        .metrics(
            |m| m.role == RoleKind::Follower && m.current_term >= new_term,
            "old leader steps down",
        )
        .await?;
    let applied = router.node(&new_leader).await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], applied, "old leader converges").await?;

    assert_eq!(
        router.get("a", b"k", Consistency::Eventual).await?,
        Some(b"survived".to_vec()),
        "the doomed write must not survive on the old leader"
    );
    router.assert_same_store_contents(&["a", "b", "c"]).await;
    Ok(())
}
