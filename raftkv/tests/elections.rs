//! Elections: voluntary elections, election safety, and the optional
//! pre-election liveness probe.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;
use raftkv::Config;
use raftkv::RoleKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn requested_election_transfers_leadership() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("requested-election".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;
    let term_before = router.node("a").await?.status().current_term;

    // Ask b to campaign immediately; its higher term deposes a.
    router.node("b").await?.start_election().await?;
    router
        .wait("b", Some(Duration::from_secs(5)))
        .await?
        .role(RoleKind::Leader, "b wins its election")
        .await?;

    let term_after = router.node("b").await?.status().current_term;
    assert!(term_after > term_before);

    // Election safety: exactly one leader per term among the nodes.
    let leaders: Vec<_> = router
        .latest_metrics()
        .await
        .into_iter()
        .filter(|m| m.role == RoleKind::Leader && m.current_term == term_after)
        .collect();
    assert_eq!(leaders.len(), 1);

    // The cluster keeps working under the new leader.
    router.put("b", b"new-era", b"ok").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn probing_follower_does_not_storm_elections_while_partitioned() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("probe-election".into())
            .disable_sync(true)
            .probe_before_election(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;
    let term_before = router.node("c").await?.status().current_term;

    // Isolate c. Its election timer fires repeatedly, but with probing on
    // it never hears back from a peer, so it never starts an election and
    // its term stays put.
    router.isolate_node("c").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let c_metrics = router.node("c").await?.status();
    assert_eq!(c_metrics.role, RoleKind::Follower);
    assert_eq!(
        c_metrics.current_term, term_before,
        "a partitioned probing follower must not drive its term up"
    );

    // The majority side was never disturbed.
    let leader = router.wait_for_leader(&["a", "b"], "majority stable").await?;
    assert_eq!(router.node(&leader).await?.status().current_term, term_before);

    // Once restored, c rejoins without an election.
    router.restore_node("c").await;
    router.put("a", b"after-heal", b"ok").await?;
    let applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], applied, "c caught back up").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn leader_loss_triggers_new_election() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("leader-loss".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;

    router.isolate_node("a").await;
    let new_leader = router.wait_for_leader(&["b", "c"], "survivors elect").await?;
    assert_ne!(new_leader, "a");

    // Log matching: both survivors agree entry-for-entry after the dust
    // settles.
    router.put(&new_leader, b"settled", b"yes").await?;
    let applied = router.node(&new_leader).await?.status().last_applied.index;
    router.wait_for_log(&["b", "c"], applied, "survivors converge").await?;
    router.assert_same_store_contents(&["b", "c"]).await;
    Ok(())
}
