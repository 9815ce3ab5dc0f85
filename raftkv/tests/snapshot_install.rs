//! Bringing a far-behind node up to date with a streamed snapshot.
//!
//! What does this test do?
//!
//! - builds a single-node cluster and commits enough entries that the
//!   oldest ones fall out of the retained applied window;
//! - adds a fresh node: the leader cannot replay the discarded entries, so
//!   it streams a snapshot of the applied state in chunks instead;
//! - asserts the new member ends up with identical contents and then
//!   receives ordinary appends.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::address_of;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;
use raftkv::Config;
use raftkv::Consistency;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn lagging_follower_receives_snapshot() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("snapshot".into())
            .disable_sync(true)
            // Small chunks so the stream spans several messages.
            .snapshot_chunk_size(512)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &[]).await?;
    let leader = router.node("a").await?;

    // Push well past the retained applied window (256 entries) so the log
    // prefix needed by a fresh node is gone.
    tracing::info!("--- committing 300 entries");
    for i in 0..300u32 {
        let tx = leader.create_transaction(Consistency::Linearizable).await?;
        tx.put(
            format!("bulk/{:05}", i).into_bytes(),
            format!("value-{}", i).into_bytes(),
        )?;
        tx.commit().await?;
    }

    tracing::info!("--- adding node b, which must be snapshotted");
    router.new_raft_node("b").await;
    leader.config_change("b".to_string(), Some(address_of("b"))).await?;

    let applied = leader.status().last_applied.index;
    router
        .wait("b", Some(Duration::from_secs(10)))
        .await?
        .log(applied, "new member caught up")
        .await?;
    router.assert_same_store_contents(&["a", "b"]).await;

    // The new member now participates in ordinary replication.
    router.put("a", b"after-snapshot", b"replicated").await?;
    let applied = leader.status().last_applied.index;
    router.wait_for_log(&["a", "b"], applied, "post-snapshot append").await?;
    assert_eq!(
        router.get("b", b"after-snapshot", Consistency::Eventual).await?,
        Some(b"replicated".to_vec())
    );

    // The commit needed a majority of the grown cluster, so the new member
    // must have acknowledged the entry.
    assert_eq!(router.node("b").await?.status().config.len(), 2);
    Ok(())
}
