//! Merge of `-40` and `40-80` into `-80`: one destination fed by two sources.

mod common;

use common::{Cluster, KEYSPACE, WAIT};
use holo_reshard::coordinator::DataCopyRequest;
use holo_reshard::copier::JobState;
use holo_reshard::topology::ServingRole;
use holo_reshard::{ErrorKind, TabletType};

const KSID_A: u64 = 0x1000_0000_0000_0000;
const KSID_B: u64 = 0x5000_0000_0000_0000;

#[tokio::test(flavor = "multi_thread")]
async fn merge_two_sources_into_one_destination() {
    let mut cluster = Cluster::new(common::test_config()).await;
    for shard in ["-40", "40-80", "80-"] {
        cluster.add_shard(shard).await;
        cluster.create_tables(shard).await;
    }
    cluster
        .coordinator
        .rebuild_keyspace_graph(KEYSPACE, &[])
        .await
        .expect("rebuild graph");
    assert_eq!(cluster.partition("test_nj", ServingRole::Primary), "-40 40-80 80-");

    cluster.insert("-40", "resharding1", 1, KSID_A, "a").await.expect("insert");
    cluster.insert("40-80", "resharding1", 2, KSID_B, "b").await.expect("insert");

    cluster.add_shard("-80").await;
    let sources = vec![
        cluster.alias("-40", "test_nj", TabletType::Rdonly),
        cluster.alias("40-80", "test_nj", TabletType::Rdonly),
    ];
    cluster
        .coordinator
        .copy_schema_shard(&sources[0], KEYSPACE, "-80", &[])
        .await
        .expect("copy schema");
    let job = cluster
        .coordinator
        .start_data_copy(&DataCopyRequest {
            keyspace: KEYSPACE.into(),
            destination_shards: vec!["-80".into()],
            source_tablets: sources,
            ..DataCopyRequest::default()
        })
        .await
        .expect("start copy");
    let status = job.wait(WAIT).await.expect("copy finished");
    assert_eq!(status.state, JobState::Succeeded, "{:?}", status.error);
    assert_eq!(status.start_positions.len(), 2);

    let state = cluster.coordinator.state();
    let refs = &state.shard(KEYSPACE, "-80").expect("shard").source_shards;
    let mut sources = refs.iter().map(|r| (r.uid, r.shard.clone())).collect::<Vec<_>>();
    sources.sort();
    assert_eq!(sources, vec![(0, "-40".to_string()), (1, "40-80".to_string())]);

    cluster.insert("-40", "resharding1", 3, KSID_A + 1, "a live").await.expect("insert");
    cluster.insert("40-80", "resharding2", 4, KSID_B + 1, "b live").await.expect("insert");
    assert!(
        common::wait_until(WAIT, || {
            cluster.rows("-80", "resharding1").len() == 3
                && cluster.rows("-80", "resharding2").len() == 1
        })
        .await,
        "writes from both sources must reach the merged shard"
    );
    let report = cluster
        .coordinator
        .verify_consistency(KEYSPACE, "-80", Vec::new())
        .await
        .expect("verify");
    assert!(report.matched, "{}", report.summary());
    assert_eq!(report.source_positions.len(), 2);

    // Either source names the whole migration.
    cluster
        .migrate("40-80", ServingRole::Rdonly, &[], false)
        .await
        .expect("migrate rdonly");
    assert_eq!(cluster.partition("test_ny", ServingRole::Rdonly), "-80 80-");
    cluster
        .migrate("-40", ServingRole::Replica, &[], false)
        .await
        .expect("migrate replica");
    let outcome = cluster
        .migrate("-40", ServingRole::Primary, &[], false)
        .await
        .expect("migrate primary");
    assert_eq!(outcome.sources, vec!["-40".to_string(), "40-80".to_string()]);
    assert_eq!(outcome.destinations, vec!["-80".to_string()]);
    assert_eq!(outcome.torn_down.len(), 2);
    for cell in common::CELLS {
        for role in ServingRole::ALL {
            assert_eq!(cluster.partition(cell, role), "-80 80-");
        }
    }
    assert!(cluster.primary("-80").query_service_enabled());
    for source in ["-40", "40-80"] {
        assert!(!cluster.primary(source).query_service_enabled());
        let err = cluster
            .insert(source, "resharding1", 9, KSID_A, "stale")
            .await
            .expect_err("retired primary");
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }
    cluster
        .insert("-80", "resharding1", 5, KSID_B + 2, "merged")
        .await
        .expect("write to merged primary");

    cluster.coordinator.shutdown().await;
}
