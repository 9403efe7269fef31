//! End-to-end split of `80-` into `80-c0` and `c0-` while the source serves writes.

mod common;

use std::sync::Arc;
use std::time::Instant;

use common::{Cluster, KEYSPACE, WAIT};
use holo_reshard::copier::{CopyEndpoint, CopyJob, CopyOptions, JobState};
use holo_reshard::row::{RowChange, Value};
use holo_reshard::topology::ServingRole;
use holo_reshard::{ErrorKind, KeyRange, ReshardConfig, TabletConn, TabletType};

const KSID_LOW: u64 = 0x1000_0000_0000_0000;
const KSID_MID: u64 = 0x9000_0000_0000_0000;
const KSID_HIGH: u64 = 0xD000_0000_0000_0000;
const SPLIT: u64 = 0xC000_0000_0000_0000;

fn ids(cluster: &Cluster, shard: &str) -> Vec<u64> {
    cluster.rows(shard, "resharding1").keys().copied().collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn split_moves_serving_role_by_role() {
    let mut cluster = Cluster::with_initial_shards(common::test_config()).await;
    assert_eq!(cluster.partition("test_nj", ServingRole::Primary), "-80 80-");

    cluster.insert("-80", "resharding1", 1, KSID_LOW, "low").await.expect("insert");
    cluster.insert("80-", "resharding1", 2, KSID_MID, "mid").await.expect("insert");
    cluster.insert("80-", "resharding1", 3, KSID_HIGH, "high").await.expect("insert");
    cluster.insert("80-", "resharding2", 4, KSID_HIGH + 1, "other table").await.expect("insert");

    cluster.add_shard("80-c0").await;
    cluster.add_shard("c0-").await;
    // New overlapping shards start out serving nothing.
    assert_eq!(cluster.partition("test_ny", ServingRole::Rdonly), "-80 80-");
    assert!(!cluster.primary("80-c0").query_service_enabled());

    let status = cluster.split_clone("80-", &["80-c0", "c0-"]).await;
    assert_eq!(status.rows_copied, 3);
    assert_eq!(cluster.rows("80-c0", "resharding1").keys().copied().collect::<Vec<_>>(), vec![2]);
    assert_eq!(cluster.rows("c0-", "resharding1").keys().copied().collect::<Vec<_>>(), vec![3]);
    assert_eq!(cluster.rows("c0-", "resharding2").len(), 1);

    let state = cluster.coordinator.state();
    let refs = &state.shard(KEYSPACE, "80-c0").expect("shard").source_shards;
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].shard, "80-");
    // A primary fed by filtered replication keeps its query service off.
    assert!(!cluster.primary("c0-").query_service_enabled());

    // Writes after the copy flow through filtered replication.
    cluster.insert("80-", "resharding1", 5, KSID_MID + 7, "live").await.expect("insert");
    cluster.insert("80-", "resharding1", 3, KSID_HIGH, "high updated").await.expect("update");
    cluster.delete("80-", "resharding2", 4, KSID_HIGH + 1).await.expect("delete");
    assert!(
        common::wait_until(WAIT, || {
            cluster.rows("80-c0", "resharding1").contains_key(&5)
                && cluster.rows("c0-", "resharding2").is_empty()
                && cluster.rows("c0-", "resharding1")[&3].values["msg"]
                    == Value::from("high updated")
        })
        .await,
        "live writes did not reach the destinations"
    );
    assert!(!cluster.rows("c0-", "resharding1").contains_key(&5));
    for dest in ["80-c0", "c0-"] {
        cluster.wait_for_replication(dest).await;
        let report = cluster
            .coordinator
            .verify_consistency(KEYSPACE, dest, Vec::new())
            .await
            .expect("verify");
        assert!(report.matched, "{dest}: {}", report.summary());
    }

    let outcome = cluster
        .migrate("80-", ServingRole::Rdonly, &[], false)
        .await
        .expect("migrate rdonly");
    assert_eq!(outcome.destinations, vec!["80-c0".to_string(), "c0-".to_string()]);
    for cell in common::CELLS {
        assert_eq!(cluster.partition(cell, ServingRole::Rdonly), "-80 80-c0 c0-");
        assert_eq!(cluster.partition(cell, ServingRole::Replica), "-80 80-");
    }
    assert!(cluster.tablet("80-c0", "test_ny", TabletType::Rdonly).query_service_enabled());
    assert!(!cluster.tablet("80-", "test_ny", TabletType::Rdonly).query_service_enabled());

    cluster
        .migrate("80-", ServingRole::Replica, &["test_ny"], false)
        .await
        .expect("migrate replica in test_ny");
    assert_eq!(cluster.partition("test_ny", ServingRole::Replica), "-80 80-c0 c0-");
    assert_eq!(cluster.partition("test_nj", ServingRole::Replica), "-80 80-");

    cluster
        .migrate("80-", ServingRole::Replica, &["test_ny"], true)
        .await
        .expect("reverse replica in test_ny");
    assert_eq!(cluster.partition("test_ny", ServingRole::Replica), "-80 80-");
    assert!(cluster.tablet("80-", "test_ny", TabletType::Replica).query_service_enabled());

    cluster
        .migrate("80-", ServingRole::Replica, &[], false)
        .await
        .expect("migrate replica");
    for cell in common::CELLS {
        assert_eq!(cluster.partition(cell, ServingRole::Replica), "-80 80-c0 c0-");
    }

    let outcome = cluster
        .migrate("80-", ServingRole::Primary, &[], false)
        .await
        .expect("migrate primary");
    assert_eq!(outcome.torn_down.len(), 2);
    for cell in common::CELLS {
        assert_eq!(cluster.partition(cell, ServingRole::Primary), "-80 80-c0 c0-");
    }
    let srv = cluster
        .coordinator
        .get_srv_keyspace("test_nj", KEYSPACE)
        .expect("srv keyspace");
    assert_eq!(
        srv.to_string(),
        "Partitions(primary): -80 80-c0 c0-\nPartitions(rdonly): -80 80-c0 c0-\nPartitions(replica): -80 80-c0 c0-\n"
    );

    let state = cluster.coordinator.state();
    for dest in ["80-c0", "c0-"] {
        assert!(state.shard(KEYSPACE, dest).expect("shard").source_shards.is_empty());
        assert!(cluster.primary(dest).query_service_enabled());
    }
    assert!(!cluster.primary("80-").query_service_enabled());
    assert!(cluster.coordinator.player_statuses().await.is_empty());

    cluster
        .insert("80-c0", "resharding1", 6, KSID_MID + 9, "after cutover")
        .await
        .expect("write to new primary");
    let err = cluster
        .insert("80-", "resharding1", 7, KSID_MID + 10, "stale")
        .await
        .expect_err("old primary must reject writes");
    assert_eq!(err.kind(), ErrorKind::Precondition);

    // Repeating a completed migration changes nothing.
    let outcome = cluster
        .migrate("80-", ServingRole::Primary, &[], false)
        .await
        .expect("repeat");
    assert!(outcome.noop);
    let err = cluster
        .migrate("80-", ServingRole::Replica, &[], true)
        .await
        .expect_err("reverse after primary cutover");
    assert_eq!(err.kind(), ErrorKind::Precondition);

    // Retire the source shard.
    let err = cluster
        .coordinator
        .delete_shard(KEYSPACE, "80-")
        .await
        .expect_err("tablets remain");
    assert_eq!(err.kind(), ErrorKind::Precondition);
    for tablet in cluster.shard_tablets("80-") {
        cluster
            .coordinator
            .delete_tablet(tablet.alias(), true)
            .await
            .expect("delete tablet");
    }
    for cell in common::CELLS {
        cluster.coordinator.remove_shard_cell(KEYSPACE, "80-", cell).expect("remove cell");
    }
    cluster.coordinator.delete_shard(KEYSPACE, "80-").await.expect("delete shard");
    let state = cluster.coordinator.state();
    let shards = state
        .keyspace(KEYSPACE)
        .expect("keyspace")
        .shards
        .keys()
        .cloned()
        .collect::<Vec<_>>();
    assert_eq!(shards, vec!["-80".to_string(), "80-c0".to_string(), "c0-".to_string()]);

    cluster.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn rerun_copy_drops_rows_deleted_since_an_earlier_attempt() {
    let mut cluster = Cluster::with_initial_shards(common::test_config()).await;
    cluster.insert("80-", "resharding1", 1, KSID_MID, "first").await.expect("insert");
    cluster.insert("80-", "resharding1", 2, KSID_MID + 1, "second").await.expect("insert");
    cluster.add_shard("80-c0").await;
    cluster.add_shard("c0-").await;
    for dest in ["80-c0", "c0-"] {
        cluster.create_tables(dest).await;
    }

    // A copy that landed its rows but was never finalized.
    let endpoint = |shard: &str| CopyEndpoint {
        shard: shard.to_string(),
        key_range: KeyRange::parse(shard).expect("keyrange"),
        tablet: cluster.primary(shard) as Arc<dyn TabletConn>,
    };
    let job = CopyJob::spawn(
        vec![endpoint("80-")],
        vec![endpoint("80-c0"), endpoint("c0-")],
        CopyOptions::from_config(cluster.coordinator.config(), Vec::new()),
        None,
    )
    .expect("spawn copy");
    assert_eq!(job.wait(WAIT).await.expect("copy finished").state, JobState::Succeeded);
    assert_eq!(ids(&cluster, "80-c0"), vec![1, 2]);
    let state = cluster.coordinator.state();
    assert!(state.shard(KEYSPACE, "80-c0").expect("shard").source_shards.is_empty());

    cluster.delete("80-", "resharding1", 1, KSID_MID).await.expect("delete");
    let status = cluster.split_clone("80-", &["80-c0", "c0-"]).await;
    assert_eq!(status.rows_copied, 1);
    assert_eq!(ids(&cluster, "80-c0"), vec![2]);

    let report = cluster
        .coordinator
        .verify_consistency(KEYSPACE, "80-c0", Vec::new())
        .await
        .expect("verify");
    assert!(report.matched, "{}", report.summary());

    cluster.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn writes_accepted_during_primary_cutover_reach_the_destinations() {
    let config = ReshardConfig {
        max_migration_lag_ms: 0,
        ..common::test_config()
    };
    let mut cluster = Cluster::with_initial_shards(config).await;
    cluster.add_shard("80-c0").await;
    cluster.add_shard("c0-").await;
    cluster.split_clone("80-", &["80-c0", "c0-"]).await;
    for role in [ServingRole::Rdonly, ServingRole::Replica] {
        cluster.migrate("80-", role, &[], false).await.expect("migrate");
    }

    // Writers run until the source primary stops accepting writes.
    let source = cluster.primary("80-");
    let writers = (1..=4u64)
        .map(|writer| {
            let source = source.clone();
            tokio::spawn(async move {
                let deadline = Instant::now() + WAIT;
                let mut accepted = Vec::new();
                for n in 0u64.. {
                    if Instant::now() >= deadline {
                        break;
                    }
                    let id = writer * 1_000_000 + n;
                    let base = if n % 2 == 0 { KSID_MID } else { KSID_HIGH };
                    let ksid = base + id;
                    let write = source
                        .execute(vec![RowChange::Upsert {
                            table: "resharding1".into(),
                            row: common::row(id, ksid, "racing"),
                        }])
                        .await;
                    match write {
                        Ok(_) => accepted.push((id, ksid)),
                        Err(err) if err.kind() == ErrorKind::Precondition => break,
                        Err(err) => panic!("write {id} failed: {err}"),
                    }
                    tokio::task::yield_now().await;
                }
                accepted
            })
        })
        .collect::<Vec<_>>();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    cluster
        .migrate("80-", ServingRole::Primary, &[], false)
        .await
        .expect("migrate primary");
    let mut accepted = Vec::new();
    for writer in writers {
        accepted.extend(writer.await.expect("writer task"));
    }
    assert!(!accepted.is_empty());

    let low = cluster.rows("80-c0", "resharding1");
    let high = cluster.rows("c0-", "resharding1");
    for (id, ksid) in accepted {
        let dest = if ksid < SPLIT { &low } else { &high };
        assert!(dest.contains_key(&id), "accepted write {id} is missing after the cutover");
    }

    cluster.coordinator.shutdown().await;
}
