//! Durable state across node restarts.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use fixtures::RaftRouter;
use pretty_assertions::assert_eq;
use raftkv::Config;
use raftkv::Consistency;
use raftkv::RoleKind;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_restart_preserves_log_and_term() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("restart".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("n1", &[]).await?;

    for i in 0..10u32 {
        router.put("n1", format!("persist/{}", i).as_bytes(), b"x").await?;
    }
    let before = router.node("n1").await?.status();

    router.restart_node("n1").await?;

    // The restarted node recovers its term and applied position from disk,
    // then wins its own election and resumes service.
    router
        .wait("n1", Some(Duration::from_secs(5)))
        .await?
        .role(RoleKind::Leader, "restarted node leads again")
        .await?;

    let after = router.node("n1").await?.status();
    assert!(after.current_term >= before.current_term);
    assert!(after.last_applied.index >= before.last_applied.index);
    assert_eq!(after.config.len(), 1);

    assert_eq!(
        router.get("n1", b"persist/0", Consistency::Linearizable).await?,
        Some(b"x".to_vec())
    );
    router.put("n1", b"after-restart", b"ok").await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 6)]
async fn restarted_follower_rejoins_the_cluster() -> Result<()> {
    fixtures::init_tracing();
    let config = Arc::new(
        Config::build("restart-follower".into())
            .disable_sync(true)
            .validate()
            .expect("valid config"),
    );
    let router = Arc::new(RaftRouter::new(config));
    router.build_cluster("a", &["b", "c"]).await?;
    router.wait_for_leader(&["a", "b", "c"], "cluster formed").await?;
    router.put("a", b"pre-restart", b"v1").await?;

    router.restart_node("b").await?;

    // Writes committed while b was down reach it after rejoining.
    router.put("a", b"while-down", b"v2").await?;
    let applied = router.node("a").await?.status().last_applied.index;
    router.wait_for_log(&["a", "b", "c"], applied, "b rejoined").await?;
    router.assert_same_store_contents(&["a", "b", "c"]).await;
    Ok(())
}
