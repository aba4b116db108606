//! End-to-end tests of scattered clusters over the in-memory network.
//!
//! These tests drive whole nodes through topology changes, biased reads and
//! writes, and check the traffic recorded by the network.

#[cfg(test)]
mod tests {
    use crate::config::{BiasAcquisition, BiasConfig, ScatteredConfig, StateTransferConfig};
    use crate::network::{Command, CommandKind};
    use crate::testing::{wait_for, TestCluster};
    use crate::types::{EntryVersion, InternalEntry, NodeId};
    use crate::versioning::SegmentState;
    use bytes::Bytes;
    use std::time::Duration;
    use test_log::test;

    const SEGMENTS: u32 = 8;

    fn config(acquisition: BiasAcquisition) -> ScatteredConfig {
        ScatteredConfig::default()
            .with_num_segments(SEGMENTS)
            .with_state_transfer(
                StateTransferConfig::default()
                    .with_chunk_size(4)
                    .with_timeout(Duration::from_secs(2)),
            )
            .with_bias(
                BiasConfig::default()
                    .with_acquisition(acquisition)
                    .with_lifespan(Duration::from_millis(1000))
                    .with_remote_timeout(Duration::from_millis(200))
                    .with_wake_up_interval(Duration::from_millis(100)),
            )
    }

    fn value(v: &'static str) -> Bytes {
        Bytes::from_static(v.as_bytes())
    }

    fn is_removal_to(command: &Command, key: &[u8]) -> bool {
        matches!(command, Command::InvalidateVersions { removal: true, .. }) && command.mentions_key(key)
    }

    // ==================== Join transfer ====================

    #[test(tokio::test)]
    async fn test_joiner_takes_over_segment() {
        // 1 owns the segment, 3 keeps a stale copy, 2 joins and takes the segment over
        let mut cluster = TestCluster::start(&[1, 3], config(BiasAcquisition::Never)).unwrap();
        let key = cluster.key_in_segment(0, "user");
        assert_eq!(cluster.owner_of(&key), 1);

        let stale = cluster.put(3, key.clone(), value("v1")).await.unwrap();
        let written = cluster.put(1, key.clone(), value("v2")).await.unwrap();
        assert_eq!(written.version.topology_id, 1);
        assert_eq!(cluster.node(3).container().get(&key).unwrap().version, stale.version);

        cluster.add_node(2).unwrap();
        let next = cluster.topology().reassign(2, vec![1, 2, 3], &[(0, 2)]);
        cluster.install(next, true).unwrap();
        cluster.quiesce().await;

        let joiner = cluster.node(2);
        assert_eq!(joiner.versions().segment_state(0), SegmentState::Owned);
        let entry = joiner.container().get(&key).unwrap();
        assert!(!entry.is_remote());
        assert_eq!(entry.version, written.version);
        assert_eq!(joiner.read(&key).await.unwrap(), Some(value("v2")));

        assert_eq!(cluster.node(1).versions().segment_state(0), SegmentState::NotOwned);
        // a backup copy of the newest version may stay, the stale one may not
        assert!(cluster
            .node(3)
            .container()
            .get(&key)
            .map_or(true, |e| e.version == written.version));

        let confirms = cluster
            .network
            .commands_of(CommandKind::ConfirmRevokedSegments);
        assert!(confirms.iter().all(|c| c.origin == 2));
        assert_eq!(confirms.len(), 2);

        // the third member learns the version the joiner now holds
        let invalidations = cluster.network.commands_of(CommandKind::InvalidateVersions);
        assert!(invalidations.iter().any(|c| c.origin == 2
            && c.target == 3
            && c.command.invalidated().contains(&(key.clone(), written.version))));

        // writes on the new owner carry the new topology
        let rewritten = cluster.put(1, key.clone(), value("v3")).await.unwrap();
        assert_eq!(rewritten.version.topology_id, 2);
        assert!(rewritten.version > written.version);
    }

    #[test(tokio::test)]
    async fn test_previous_owner_backs_up_before_invalidating() {
        let mut cluster = TestCluster::start(&[1, 3], config(BiasAcquisition::Never)).unwrap();
        let key = cluster.key_in_segment(0, "order");
        cluster.put(3, key.clone(), value("v")).await.unwrap();
        cluster.network.clear_log();

        cluster.add_node(2).unwrap();
        let next = cluster.topology().reassign(2, vec![1, 2, 3], &[(0, 2)]);
        cluster.install(next, true).unwrap();
        cluster.quiesce().await;

        let log = cluster.network.call_log();
        let backup = log
            .iter()
            .find(|c| c.origin == 1 && c.command.kind() == CommandKind::BackupPut)
            .unwrap();
        assert_eq!(backup.target, 2);
        assert!(backup.command.mentions_key(&key));
        let completed = backup.completed_at.unwrap();

        let invalidation = log
            .iter()
            .find(|c| c.origin == 1 && c.target == 3 && is_removal_to(&c.command, &key))
            .unwrap();
        assert!(invalidation.sent_at > completed);
    }

    #[test(tokio::test)]
    async fn test_failed_key_pull_leaves_segment_unowned() {
        let mut cluster = TestCluster::start(&[1, 2], config(BiasAcquisition::Never)).unwrap();
        let key = cluster.key_in_segment(7, "item");
        assert_eq!(cluster.owner_of(&key), 2);
        cluster.put(2, key.clone(), value("v")).await.unwrap();

        cluster
            .network
            .faults()
            .fail_next(2, CommandKind::RequestKeys, 1);
        cluster.add_node(3).unwrap();
        let next = cluster.topology().reassign(2, vec![1, 2, 3], &[(7, 3)]);
        cluster.install(next, true).unwrap();
        cluster.quiesce().await;

        let joiner = cluster.node(3);
        assert_eq!(joiner.versions().segment_state(7), SegmentState::NotOwned);
        assert!(!joiner.is_transferring());
        assert_eq!(joiner.metrics().key_transfer_failures.get(), 1);
        // no pointer survives the failed transfer
        assert!(joiner
            .container()
            .get(&key)
            .map_or(true, |e| !e.is_remote()));
    }

    #[test(tokio::test)]
    async fn test_leaver_is_tolerated_by_transfer() {
        let mut cluster = TestCluster::start(&[1, 2, 3], config(BiasAcquisition::Never)).unwrap();
        let key = cluster.key_in_segment(2, "cart");
        assert_eq!(cluster.owner_of(&key), 3);
        cluster.put(3, key.clone(), value("v")).await.unwrap();

        // 2 leaves while 1 takes over the segment of 3
        cluster.remove_node(2);
        let next = cluster.topology().reassign(2, vec![1, 3], &[(1, 1), (2, 1), (4, 3), (7, 3)]);
        cluster.install(next, true).unwrap();
        cluster.quiesce().await;

        let owner = cluster.node(1);
        assert_eq!(owner.versions().segment_state(2), SegmentState::Owned);
        assert_eq!(owner.read(&key).await.unwrap(), Some(value("v")));
    }

    // ==================== Biases ====================

    #[test(tokio::test)]
    async fn test_write_revokes_reader_bias_before_returning() {
        let cluster = TestCluster::start(&[1, 2, 3], config(BiasAcquisition::OnRead)).unwrap();
        let key = cluster.key_in_segment(0, "profile");
        assert_eq!(cluster.owner_of(&key), 1);
        cluster.put(1, key.clone(), value("v1")).await.unwrap();

        let reader = cluster.node(2);
        assert_eq!(reader.read(&key).await.unwrap(), Some(value("v1")));
        assert!(reader.bias().has_local_bias(&key));

        // served locally while biased
        cluster.network.clear_log();
        assert_eq!(reader.read(&key).await.unwrap(), Some(value("v1")));
        assert!(cluster.network.commands_of(CommandKind::Get).is_empty());

        let outcome = cluster.put(3, key.clone(), value("v2")).await.unwrap();
        assert!(outcome.biased);
        assert!(!reader.bias().has_local_bias(&key));
        let revokes = cluster.network.commands_of(CommandKind::RevokeBias);
        assert_eq!(revokes.len(), 1);
        assert_eq!(revokes[0].target, 2);
        assert!(revokes[0].completed_at.is_some());

        cluster.network.clear_log();
        assert_eq!(reader.read(&key).await.unwrap(), Some(value("v2")));
        let gets = cluster.network.commands_of(CommandKind::Get);
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].target, 1);

        // the writer is biased now and reads its own copy
        cluster.network.clear_log();
        assert_eq!(cluster.node(3).read(&key).await.unwrap(), Some(value("v2")));
        assert!(cluster.network.commands_of(CommandKind::Get).is_empty());
    }

    #[test(tokio::test(start_paused = true))]
    async fn test_bias_valid_within_lifespan_then_expires() {
        let cluster = TestCluster::start(&[1, 2, 3], config(BiasAcquisition::OnRead)).unwrap();
        let used = cluster.key_in_segment(0, "cart");
        let idle = cluster.key_in_segment(0, "wishlist");
        cluster.put(1, used.clone(), value("a")).await.unwrap();
        cluster.put(1, idle.clone(), value("b")).await.unwrap();

        let reader = cluster.node(2);
        assert_eq!(reader.read(&used).await.unwrap(), Some(value("a")));
        assert_eq!(reader.read(&idle).await.unwrap(), Some(value("b")));
        cluster.network.clear_log();

        // half way through the lifespan the bias still serves reads
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(reader.read(&used).await.unwrap(), Some(value("a")));
        assert!(cluster.network.commands_of(CommandKind::Get).is_empty());

        // the unread bias lapses after the lifespan
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!reader.bias().has_local_bias(&idle));

        // the read one was renewed once and lapses a lifespan later
        let renewals = cluster.network.commands_of(CommandKind::RenewBias);
        assert_eq!(renewals.len(), 1);
        assert!(renewals[0].command.mentions_key(&used));
        tokio::time::sleep(Duration::from_millis(950)).await;
        assert!(!reader.bias().has_local_bias(&used));

        cluster.network.clear_log();
        assert_eq!(reader.read(&used).await.unwrap(), Some(value("a")));
        let gets = cluster.network.commands_of(CommandKind::Get);
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].target, 1);
    }

    #[test(tokio::test)]
    async fn test_write_during_remote_read_is_not_masked_by_bias() {
        let cluster = TestCluster::start(&[1, 2, 3], config(BiasAcquisition::OnRead)).unwrap();
        let key = cluster.key_in_segment(0, "stock");
        assert_eq!(cluster.owner_of(&key), 1);

        // the owner only knows where the value lives
        let old = EntryVersion::new(1, 0);
        cluster.node(1).container().merge_remote(key.clone(), old, 3);
        cluster
            .node(3)
            .container()
            .put_local(key.clone(), InternalEntry::value(value("old"), old));
        cluster
            .network
            .faults()
            .set_latency(CommandKind::RequestValues, Duration::from_millis(200));

        let reader = cluster.node(2).clone();
        let read_key = key.clone();
        let read = tokio::spawn(async move { reader.read(&read_key).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let written = cluster.put(1, key.clone(), value("new")).await.unwrap();
        assert!(written.version > old);

        // the read raced the write; it may see the old value but gets no bias
        assert_eq!(read.await.unwrap().unwrap(), Some(value("old")));
        let reader = cluster.node(2);
        assert!(!reader.bias().has_local_bias(&key));
        assert!(cluster.node(1).bias().get_remote_bias(&key).is_none());

        assert_eq!(reader.read(&key).await.unwrap(), Some(value("new")));
        assert!(reader.bias().has_local_bias(&key));
        assert_eq!(reader.read(&key).await.unwrap(), Some(value("new")));
    }

    #[test(tokio::test)]
    async fn test_concurrent_writes_share_one_revocation() {
        let cluster = TestCluster::start(&[1, 2], config(BiasAcquisition::OnRead)).unwrap();
        let key = cluster.key_in_segment(0, "counter");
        cluster.put(1, key.clone(), value("v1")).await.unwrap();
        cluster.node(2).read(&key).await.unwrap();
        assert!(cluster.node(2).bias().has_local_bias(&key));

        cluster
            .network
            .faults()
            .set_latency(CommandKind::RevokeBias, Duration::from_millis(50));
        let owner = cluster.node(1);
        let (a, b) = tokio::join!(
            owner.write(1, key.clone(), value("v2")),
            owner.write(1, key.clone(), value("v3")),
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert_eq!(cluster.network.commands_of(CommandKind::RevokeBias).len(), 1);
        assert!(!cluster.node(2).bias().has_local_bias(&key));
    }

    #[test(tokio::test)]
    async fn test_failed_revocation_reported_after_write() {
        let cluster = TestCluster::start(&[1, 2], config(BiasAcquisition::OnRead)).unwrap();
        let key = cluster.key_in_segment(0, "session");
        cluster.put(1, key.clone(), value("v1")).await.unwrap();
        cluster.node(2).read(&key).await.unwrap();

        cluster
            .network
            .faults()
            .fail_next(2, CommandKind::RevokeBias, 1);
        let result = cluster.put(1, key.clone(), value("v2")).await;
        assert!(matches!(result, Err(crate::error::Error::RevocationFailed)));
        assert_eq!(
            cluster.node(1).container().get_value(&key),
            Some(value("v2"))
        );
    }

    // ==================== Invalidations ====================

    #[test(tokio::test)]
    async fn test_invalidations_batched_by_threshold() {
        let cluster = TestCluster::start(
            &[1, 2],
            config(BiasAcquisition::Never).with_invalidation_batch_size(3),
        )
        .unwrap();
        let keys: Vec<_> = (0..3)
            .map(|i| cluster.key_in_segment(0, &format!("batch{}", i)))
            .collect();
        for key in &keys {
            cluster.put(2, key.clone(), value("v")).await.unwrap();
        }

        let sent = wait_for(
            || !cluster.network.commands_of(CommandKind::InvalidateVersions).is_empty(),
            Duration::from_secs(1),
            Duration::from_millis(5),
        )
        .await;
        assert!(sent);

        let invalidations = cluster.network.commands_of(CommandKind::InvalidateVersions);
        assert_eq!(invalidations.len(), 1);
        assert_eq!(invalidations[0].origin, 1);
        assert_eq!(invalidations[0].command.invalidated().len(), 3);

        // equal versions survive a regular invalidation
        for key in &keys {
            assert!(cluster.node(2).container().get(key).is_some());
        }
    }

    #[test(tokio::test)]
    async fn test_removal_reaches_every_member() {
        let cluster = TestCluster::start(&[1, 2, 3], config(BiasAcquisition::Never)).unwrap();
        let key = cluster.key_in_segment(0, "gone");
        cluster.put(2, key.clone(), value("v")).await.unwrap();
        cluster.delete(3, key.clone()).await.unwrap();
        cluster.quiesce().await;

        let members: Vec<NodeId> = cluster.node_ids();
        for node in members {
            assert!(
                cluster.node(node).container().get(&key).is_none(),
                "node {} still holds the key",
                node
            );
        }
        assert_eq!(cluster.node(1).read(&key).await.unwrap(), None);
    }
}
