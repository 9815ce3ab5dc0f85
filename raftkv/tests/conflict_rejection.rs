//! The leader rejects forwarded commits whose reads went stale.
//!
//! What does this test do?
//!
//! - brings a three-node cluster online;
//! - client X opens a transaction on a follower and reads key `x`;
//! - client Y commits a write to `x` through the leader;
//! - X commits: the leader finds X's reads conflict with the committed
//!   write and rejects the commit, which surfaces to X as a retryable
//!   error.

mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;
use raftkv::Config;
use raftkv::Consistency;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn forwarded_commit_with_stale_reads_is_rejected() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("conflict".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;

    router.put("a", b"x", b"original").await?;
    let applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], applied, "baseline replicated").await?;

    // Client X reads `x` on a follower and stages a dependent write.
    let follower = router.node("b").await?;
    let tx_x = follower.create_transaction(Consistency::Linearizable).await?;
    assert_eq!(tx_x.get(b"x")?, Some(b"original".to_vec()));
    tx_x.put(b"x-derived".to_vec(), b"stale-derivation".to_vec())?;

    // Client Y overwrites `x` through the leader.
    router.put("a", b"x", b"updated").await?;
    let applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b"], applied, "conflicting write replicated").await?;

    // X's forwarded commit is verified against the log on the leader and
    // rejected.
    let err = tx_x.commit().await.expect_err("stale reads must not commit");
    assert!(err.is_retryable(), "unexpected error: {:?}", err);

    // The dependent write never happened anywhere.
    assert_eq!(router.get("a", b"x-derived", Consistency::Linearizable).await?, None);

    // A fresh transaction sees the new value and can commit.
    let tx_retry = follower.create_transaction(Consistency::Linearizable).await?;
    assert_eq!(tx_retry.get(b"x")?, Some(b"updated".to_vec()));
    tx_retry.put(b"x-derived".to_vec(), b"fresh-derivation".to_vec())?;
    tx_retry.commit().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn non_conflicting_concurrent_transactions_both_commit() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("no-conflict".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;

    // Two transactions touching disjoint keys are both admitted; the later
    // one is rebased past the earlier one's entry.
    let follower = router.node("b").await?;
    let tx_one = follower.create_transaction(Consistency::Linearizable).await?;
    tx_one.get(b"one")?;
    tx_one.put(b"one".to_vec(), b"1".to_vec())?;

    router.put("a", b"two", b"2").await?;

    tx_one.commit().await?;
    assert_eq!(router.get("a", b"one", Consistency::Linearizable).await?, Some(b"1".to_vec()));
    assert_eq!(router.get("a", b"two", Consistency::Linearizable).await?, Some(b"2".to_vec()));
    Ok(())
}
