mod common;

use std::time::Duration;

use common::{node_config, wait_for_ring, CONVERGE_TIMEOUT};
use meshcache_node::{CacheNodeBuilder, MembershipChange, NodeState};
use tokio_stream::StreamExt;

#[tokio::test]
async fn test_member_join() -> anyhow::Result<()> {
    test_helper::init_logging();

    let addrs = test_helper::get_unused_addrs(2);
    let node_1 = CacheNodeBuilder::new(node_config("node-1", addrs[0], &[]))
        .start()
        .await?;
    let node_2 = CacheNodeBuilder::new(node_config("node-2", addrs[1], &[addrs[0]]))
        .start()
        .await?;

    assert!(
        node_1
            .wait_for_members(
                |members| members.state_of("node-2") == Some(NodeState::Alive),
                CONVERGE_TIMEOUT,
            )
            .await,
        "Node 1 should learn about node 2."
    );
    assert!(
        node_2
            .wait_for_members(
                |members| members.state_of("node-1") == Some(NodeState::Alive),
                CONVERGE_TIMEOUT,
            )
            .await,
        "Node 2 should learn about node 1."
    );
    assert!(wait_for_ring(&[&node_1, &node_2], 2).await);

    let stats = node_1.statistics();
    assert_eq!(stats.num_live_members(), 2);
    assert_eq!(stats.num_dead_members(), 0);
    assert!(stats.num_ring_rebuilds() >= 1);

    let stats = node_2.statistics();
    assert_eq!(stats.num_live_members(), 2);
    assert_eq!(stats.num_dead_members(), 0);

    Ok(())
}

#[tokio::test]
async fn test_member_join_through_other_member() -> anyhow::Result<()> {
    test_helper::init_logging();

    let addrs = test_helper::get_unused_addrs(3);
    let node_1 = CacheNodeBuilder::new(node_config("node-1", addrs[0], &[]))
        .start()
        .await?;
    let node_2 = CacheNodeBuilder::new(node_config("node-2", addrs[1], &[addrs[0]]))
        .start()
        .await?;
    let node_3 = CacheNodeBuilder::new(node_config("node-3", addrs[2], &[addrs[1]]))
        .start()
        .await?;

    // Node 1 only hears about node 3 through gossip.
    for node in [&node_1, &node_2, &node_3] {
        assert!(
            node.wait_for_members(
                |members| members.count(NodeState::Alive) == 3,
                CONVERGE_TIMEOUT,
            )
            .await,
            "{} should see every member alive.",
            node.me(),
        );
    }
    assert!(wait_for_ring(&[&node_1, &node_2, &node_3], 3).await);

    Ok(())
}

#[tokio::test]
async fn test_crashed_member_is_declared_dead() -> anyhow::Result<()> {
    test_helper::init_logging();

    let addrs = test_helper::get_unused_addrs(3);
    let node_1 = CacheNodeBuilder::new(node_config("node-1", addrs[0], &[]))
        .start()
        .await?;

    let mut cfg = node_config("node-2", addrs[1], &[addrs[0]]);
    cfg.gossip.announce_leave = false;
    let node_2 = CacheNodeBuilder::new(cfg).start().await?;

    let node_3 = CacheNodeBuilder::new(node_config("node-3", addrs[2], &[addrs[0]]))
        .start()
        .await?;

    assert!(wait_for_ring(&[&node_1, &node_2, &node_3], 3).await);

    // Without announcing the departure this looks like a crash.
    node_2.shutdown().await;

    assert!(
        node_1
            .wait_for_members(
                |members| members.state_of("node-2") == Some(NodeState::Dead),
                Duration::from_secs(10),
            )
            .await,
        "Node 1 should declare node 2 dead."
    );
    assert!(wait_for_ring(&[&node_1, &node_3], 2).await);

    let ring = node_1.ring();
    assert!(!ring.contains("node-2"));
    for i in 0..1_000 {
        let key = format!("key-{i}");
        let owners = ring.lookup(key.as_bytes());
        assert!(!owners.is_empty());
        assert!(owners.iter().all(|owner| owner.node_id != "node-2"));
    }

    let stats = node_1.statistics();
    assert_eq!(stats.num_live_members(), 2);
    assert_eq!(stats.num_dead_members(), 1);

    Ok(())
}

#[tokio::test]
async fn test_graceful_leave_is_announced() -> anyhow::Result<()> {
    test_helper::init_logging();

    let addrs = test_helper::get_unused_addrs(2);

    // Suspicion alone could never mark node 2 dead within the test.
    let mut cfg_1 = node_config("node-1", addrs[0], &[]);
    cfg_1.gossip.suspicion_timeout = Duration::from_secs(60);
    let node_1 = CacheNodeBuilder::new(cfg_1).start().await?;
    let node_2 = CacheNodeBuilder::new(node_config("node-2", addrs[1], &[addrs[0]]))
        .start()
        .await?;

    assert!(wait_for_ring(&[&node_1, &node_2], 2).await);

    node_2.shutdown().await;

    assert!(
        node_1
            .wait_for_members(
                |members| members.state_of("node-2") == Some(NodeState::Dead),
                Duration::from_secs(2),
            )
            .await,
        "Node 1 should learn node 2 left."
    );
    assert!(wait_for_ring(&[&node_1], 1).await);

    Ok(())
}

#[tokio::test]
async fn test_restarted_member_rejoins() -> anyhow::Result<()> {
    test_helper::init_logging();

    let addrs = test_helper::get_unused_addrs(2);
    let node_1 = CacheNodeBuilder::new(node_config("node-1", addrs[0], &[]))
        .start()
        .await?;
    let node_2 = CacheNodeBuilder::new(node_config("node-2", addrs[1], &[addrs[0]]))
        .start()
        .await?;
    assert!(wait_for_ring(&[&node_1, &node_2], 2).await);

    node_2.shutdown().await;
    assert!(
        node_1
            .wait_for_members(
                |members| members.state_of("node-2") == Some(NodeState::Dead),
                Duration::from_secs(5),
            )
            .await
    );

    // The new process starts again at incarnation 0 and has to refute
    // the record marking it dead.
    let node_2 = CacheNodeBuilder::new(node_config("node-2", addrs[1], &[addrs[0]]))
        .start()
        .await?;
    assert!(
        node_1
            .wait_for_members(
                |members| members.state_of("node-2") == Some(NodeState::Alive),
                CONVERGE_TIMEOUT,
            )
            .await,
        "Node 2 should be alive again."
    );
    assert!(wait_for_ring(&[&node_1, &node_2], 2).await);
    assert!(node_2.membership().get("node-2").unwrap().incarnation > 0);

    Ok(())
}

#[tokio::test]
async fn test_membership_changes_are_streamed() -> anyhow::Result<()> {
    test_helper::init_logging();

    let addrs = test_helper::get_unused_addrs(3);
    let node_1 = CacheNodeBuilder::new(node_config("node-1", addrs[0], &[]))
        .start()
        .await?;
    let mut changes = node_1.membership_changes();

    let node_2 = CacheNodeBuilder::new(node_config("node-2", addrs[1], &[addrs[0]]))
        .start()
        .await?;
    let node_3 = CacheNodeBuilder::new(node_config("node-3", addrs[2], &[addrs[0]]))
        .start()
        .await?;
    assert!(wait_for_ring(&[&node_1, &node_2, &node_3], 3).await);

    node_2.shutdown().await;
    node_3.shutdown().await;
    assert!(wait_for_ring(&[&node_1], 1).await);

    // Every change is delivered even though nobody read the stream so far.
    let mut joined = Vec::new();
    let mut left = Vec::new();
    while left.len() < 2 {
        let change: MembershipChange =
            tokio::time::timeout(CONVERGE_TIMEOUT, changes.next())
                .await?
                .expect("Stream should stay open while the node runs")?;
        joined.extend(change.joined.into_iter().map(|member| member.node_id));
        left.extend(change.left.into_iter().map(|member| member.node_id));
    }

    joined.sort();
    left.sort();
    assert_eq!(joined, ["node-2", "node-3"]);
    assert_eq!(left, ["node-2", "node-3"]);

    Ok(())
}
