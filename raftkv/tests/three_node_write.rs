//! A linearizable write forwarded through a follower of a three-node
//! cluster.
//!
//! What does this test do?
//!
//! - brings a three-node cluster online;
//! - commits `put("k", "v")` through a transaction opened on a follower,
//!   which forwards the commit to the leader;
//! - asserts the write is readable from every node and that all three state
//!   machines hold identical contents.

mod fixtures;

use std::sync::Arc;

use anyhow::Result;
use fixtures::RaftRouter;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use raftkv::Config;
use raftkv::Consistency;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn three_node_linearizable_write() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("three-node".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    let leader = router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;
    assert_eq!(leader, "a");

    // Commit through the follower: the transaction is forwarded to the
    // leader, replicated, and completed once committed and applied locally.
    let follower = router.node("b").await?;
    let tx = follower.create_transaction(Consistency::Linearizable).await?;
    tx.put(b"k".to_vec(), b"v".to_vec())?;
    tx.commit().await?;

    // Once committed, the value is visible on every node.
    let applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], applied, "write replicated").await?;
    for id in ["a", "b", "c"] {
        assert_eq!(
            router.get(id, b"k", Consistency::Linearizable).await?,
            Some(b"v".to_vec()),
            "node {} does not see the committed write",
            id
        );
    }

    router.assert_same_store_contents(&["a", "b", "c"]).await;

    // Commit indices never regress, and every node agrees on the term and
    // the membership.
    let metrics = router.latest_metrics().await;
    let term = metrics[0].current_term;
    for m in &metrics {
        assert_eq!(m.current_term, term);
        assert!(m.commit_index >= applied);
        let members: std::collections::BTreeSet<String> = m.config.keys().cloned().collect();
        assert_eq!(members, btreeset!["a".to_string(), "b".to_string(), "c".to_string()]);
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn writes_interleaved_across_nodes() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("three-node-interleaved".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;

    // Writes submitted through different nodes all land in one total order.
    for (node, i) in [("a", 0), ("b", 1), ("c", 2), ("b", 3), ("a", 4)] {
        router
            .put(node, format!("key/{}", i).as_bytes(), format!("from-{}", node).as_bytes())
            .await?;
    }

    let applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], applied, "all writes applied").await?;
    router.assert_same_store_contents(&["a", "b", "c"]).await;

    for i in 0..5 {
        assert!(router
            .get("c", format!("key/{}", i).as_bytes(), Consistency::Eventual)
            .await?
            .is_some());
    }
    Ok(())
}
