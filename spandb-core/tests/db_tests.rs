//! End-to-end tests of the storage engine against a local backend

use spandb_core::backend::{BackendCompactor, BackendReader, BackendWriter, LocalBackend, DATA_NAME};
use spandb_core::block::{BlockConfig, HeadBlock};
use spandb_core::compactor::{Compactor, CompactorConfig, NoOverrides, OwnAll};
use spandb_core::db::{Db, DbConfig, SearchConfig};
use spandb_core::ingester::{Ingester, IngesterConfig};
use spandb_core::metrics::Metrics;
use spandb_core::model::{sort_trace, ObjectDecoder, ResourceSpans, Span, Trace, V1Decoder};
use spandb_core::wal::WalConfig;
use spandb_core::{BlockMeta, BlockVersion, Encoding, SpanError, BLOCK_ID_MAX, BLOCK_ID_MIN};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    dir: TempDir,
    backend: Arc<LocalBackend>,
    db: Arc<Db>,
}

fn harness(configure: impl FnOnce(&mut DbConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let backend = Arc::new(LocalBackend::new(dir.path().join("blocks")).unwrap());
    let mut config = DbConfig {
        wal: WalConfig {
            dir: dir.path().join("wal"),
            ..Default::default()
        },
        ..Default::default()
    };
    configure(&mut config);

    let db = Db::new(
        config,
        backend.clone(),
        backend.clone(),
        backend.clone(),
        Arc::new(Metrics::unregistered()),
    )
    .unwrap();
    Harness {
        dir,
        backend,
        db: Arc::new(db),
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn trace(id: &[u8], service: &str, span_ids: &[u8]) -> Trace {
    let start = now() as u64 * 1_000_000_000;
    let spans = span_ids
        .iter()
        .map(|&s| Span {
            span_id: vec![s],
            name: format!("op-{}", s),
            start_time_unix_nano: start + s as u64,
            end_time_unix_nano: start + s as u64 + 1_000,
            ..Default::default()
        })
        .collect();
    Trace {
        id: id.to_vec(),
        batches: vec![ResourceSpans {
            resource: BTreeMap::from([("service.name".to_string(), service.to_string())]),
            spans,
        }],
    }
}

fn encode(trace: &Trace) -> Vec<u8> {
    V1Decoder.prepare_for_write(trace, now() as u32, now() as u32).unwrap()
}

/// Write `objects` through a head block and complete it into the backend
async fn write_block(db: &Db, tenant: &str, objects: &[(Vec<u8>, Vec<u8>)]) -> BlockMeta {
    let mut head = HeadBlock::new(db.wal().new_block(Uuid::new_v4(), tenant, "v1").unwrap());
    for (id, object) in objects {
        head.append(id, object, now(), now()).unwrap();
    }
    let completing = head.seal().unwrap();
    let block = db.complete_block(&completing).await.unwrap();
    completing.clear().unwrap();
    block.meta().clone()
}

async fn find_all(db: &Db, tenant: &str, id: &[u8]) -> spandb_core::Result<Option<Trace>> {
    let result = db
        .find(tenant, id, BLOCK_ID_MIN, BLOCK_ID_MAX, 0, 0, &CancellationToken::new())
        .await?;
    Ok(match result.combine(&V1Decoder)? {
        Some(object) => Some(V1Decoder.prepare_for_read(&object)?),
        None => None,
    })
}

#[tokio::test]
async fn test_complete_block_round_trip_all_formats() {
    for &wal_encoding in Encoding::all() {
        for &version in BlockVersion::all() {
            for &encoding in Encoding::all() {
                let h = harness(|c| {
                    c.wal.encoding = wal_encoding;
                    c.block = BlockConfig {
                        version,
                        encoding,
                        ..Default::default()
                    };
                });

                let mut expected = Vec::new();
                let mut objects = Vec::new();
                for i in 0..20u8 {
                    let t = trace(&[i, 0xAB], "svc", &[1, 2, 3]);
                    objects.push((t.id.clone(), encode(&t)));
                    expected.push(t);
                }

                // before completion, from the head block
                let mut head = HeadBlock::new(h.db.wal().new_block(Uuid::new_v4(), "t", "v1").unwrap());
                for (id, object) in &objects {
                    head.append(id, object, now(), now()).unwrap();
                }
                let before = head.find_by_id(&objects[7].0).unwrap().unwrap();

                let completing = head.seal().unwrap();
                let block = h.db.complete_block(&completing).await.unwrap();
                completing.clear().unwrap();
                assert_eq!(block.meta().version, version);
                assert_eq!(block.meta().encoding, encoding);
                assert_eq!(block.meta().total_objects, 20);

                let after = block
                    .find_by_id(&objects[7].0, &CancellationToken::new())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(before, after, "{:?} -> {:?}/{:?}", wal_encoding, version, encoding);

                h.db.poll_blocklist().await.unwrap();
                for mut t in expected {
                    let mut found = find_all(&h.db, "t", &t.id).await.unwrap().unwrap();
                    sort_trace(&mut t);
                    sort_trace(&mut found);
                    assert_eq!(found, t);
                }
            }
        }
    }
}

#[tokio::test]
async fn test_blocklist_order_and_deletion() {
    let h = harness(|_| {});
    let mut written = Vec::new();
    for i in 0..3i64 {
        let mut head = HeadBlock::new(h.db.wal().new_block(Uuid::new_v4(), "t", "v1").unwrap());
        // newest block written first, all within the ingestion slack
        let start = now() - 30 * (i + 1);
        head.append(&[i as u8 + 1], b"obj", start, start + 1).unwrap();
        let completing = head.seal().unwrap();
        written.push(h.db.complete_block(&completing).await.unwrap().meta().clone());
        completing.clear().unwrap();
    }

    h.db.poll_blocklist().await.unwrap();
    let metas = h.db.blocklist().metas("t");
    let mut expected = written.clone();
    expected.sort_by_key(|m| m.start_time);
    let ids: Vec<Uuid> = metas.iter().map(|m| m.block_id).collect();
    assert_eq!(ids, expected.iter().map(|m| m.block_id).collect::<Vec<_>>());
    assert!(metas.windows(2).all(|w| w[0].start_time <= w[1].start_time));

    h.backend.clear_block(written[1].block_id, "t").await.unwrap();
    h.db.poll_blocklist().await.unwrap();
    let ids: Vec<Uuid> = h.db.blocklist().metas("t").iter().map(|m| m.block_id).collect();
    assert_eq!(ids.len(), 2);
    assert!(!ids.contains(&written[1].block_id));
}

#[tokio::test]
async fn test_compaction_keeps_old_ranges_searchable_until_retention() {
    let h = harness(|_| {});
    let mut inputs = Vec::new();
    for i in 0..4u8 {
        let t = trace(&[0x10 + i], "svc", &[i]);
        // the same trace is split across every block
        let shared = trace(&[0x01], &format!("svc-{}", i), &[100 + i]);
        inputs.push(
            write_block(
                &h.db,
                "t",
                &[(shared.id.clone(), encode(&shared)), (t.id.clone(), encode(&t))],
            )
            .await,
        );
    }
    h.db.poll_blocklist().await.unwrap();
    assert_eq!(h.db.blocklist().metas("t").len(), 4);

    let config = CompactorConfig {
        max_compaction_range: Duration::from_secs(10 * 365 * 24 * 3600),
        compacted_block_retention: Duration::ZERO,
        ..Default::default()
    };
    let compactor = Compactor::new(config, h.db.clone(), Arc::new(OwnAll), Arc::new(NoOverrides));
    assert_eq!(compactor.do_compaction(&CancellationToken::new()).await.unwrap(), 1);

    let active = h.db.blocklist().metas("t");
    assert_eq!(active.len(), 1);
    assert_eq!(h.db.blocklist().compacted_metas("t").len(), 4);
    let output = &active[0];
    assert_eq!(output.compaction_level, 1);
    assert_eq!(output.total_objects, 5);
    assert_eq!(output.min_id, inputs.iter().map(|m| m.min_id.clone()).min().unwrap());
    assert_eq!(output.max_id, inputs.iter().map(|m| m.max_id.clone()).max().unwrap());

    // duplicates were combined into one object
    let shared = find_all(&h.db, "t", &[0x01]).await.unwrap().unwrap();
    assert_eq!(shared.span_count(), 4);

    // the old block range still answers
    let old = inputs[2].block_id.to_string();
    let result = h
        .db
        .find("t", &[0x12], &old, &old, 0, 0, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 1);

    // a zero compacted retention prunes the retired blocks
    compactor.do_retention().await.unwrap();
    assert!(h.db.blocklist().compacted_metas("t").is_empty());
    assert_eq!(h.backend.blocks("t").await.unwrap(), vec![output.block_id]);
    let result = h
        .db
        .find("t", &[0x12], &old, &old, 0, 0, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert!(find_all(&h.db, "t", &[0x12]).await.unwrap().is_some());
}

#[tokio::test]
async fn test_ingestion_slack_clamps_block_times() {
    let h = harness(|c| c.wal.ingestion_slack = Duration::from_secs(60));
    let mut head = HeadBlock::new(h.db.wal().new_block(Uuid::new_v4(), "t", "v1").unwrap());
    head.append(&[1], b"obj", now() - 3600, now() + 3600).unwrap();
    let completing = head.seal().unwrap();
    let block = h.db.complete_block(&completing).await.unwrap();

    let meta = block.meta();
    assert!((meta.start_time.timestamp() - now()).abs() <= 1);
    assert!((meta.end_time.timestamp() - now()).abs() <= 1);
}

#[tokio::test]
async fn test_unknown_tenant_is_empty() {
    let h = harness(|_| {});
    write_block(&h.db, "t", &[(vec![1], encode(&trace(&[1], "svc", &[1])))]).await;
    h.db.poll_blocklist().await.unwrap();

    let result = h
        .db
        .find("nobody", &[1], BLOCK_ID_MIN, BLOCK_ID_MAX, 0, 0, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_empty());
    assert!(result.failed_blocks.is_empty());
    assert!(find_all(&h.db, "t", &[2]).await.unwrap().is_none());
}

#[tokio::test]
async fn test_partial_failure_threshold() {
    let h = harness(|c| {
        c.search = SearchConfig {
            max_failed_blocks_fraction: 0.5,
            ..Default::default()
        }
    });
    let object = encode(&trace(&[1], "svc", &[1]));
    let mut metas = Vec::new();
    for _ in 0..3 {
        metas.push(write_block(&h.db, "t", &[(vec![1], object.clone())]).await);
    }

    // corrupt one block's data
    h.backend
        .write(DATA_NAME, metas[0].block_id, "t", bytes::Bytes::from_static(b"garbage"), false)
        .await
        .unwrap();
    h.db.poll_blocklist().await.unwrap();

    let result = h
        .db
        .find("t", &[1], BLOCK_ID_MIN, BLOCK_ID_MAX, 0, 0, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.objects.len(), 2);
    assert_eq!(result.failed_blocks, vec![metas[0].block_id]);

    // a second bad block crosses the threshold
    h.backend
        .write(DATA_NAME, metas[1].block_id, "t", bytes::Bytes::from_static(b"garbage"), false)
        .await
        .unwrap();
    let err = h
        .db
        .find("t", &[1], BLOCK_ID_MIN, BLOCK_ID_MAX, 0, 0, &CancellationToken::new())
        .await
        .unwrap_err();
    match err {
        SpanError::PartialFailure { failed_blocks, total } => {
            assert_eq!(failed_blocks.len(), 2);
            assert_eq!(total, 3);
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_ingester_to_backend() {
    let h = harness(|_| {});
    let local_dir = h.dir.path().join("local");
    let ingester = Ingester::start(
        IngesterConfig {
            local_dir,
            ..Default::default()
        },
        h.db.clone(),
    )
    .await
    .unwrap();

    let t = trace(&[0xCA, 0xFE], "svc", &[1, 2]);
    ingester.push("t", &t.id, &encode(&t), now(), now()).unwrap();
    let from_head = ingester.find_by_id("t", &t.id, &CancellationToken::new()).await.unwrap().unwrap();

    ingester.stop().await;
    h.db.poll_blocklist().await.unwrap();
    let meta = &h.db.blocklist().metas("t")[0];
    assert_eq!(h.backend.block_meta(meta.block_id, "t").await.unwrap().total_objects, 1);

    let found = find_all(&h.db, "t", &t.id).await.unwrap().unwrap();
    assert_eq!(V1Decoder.prepare_for_read(&from_head).unwrap(), found);
}
