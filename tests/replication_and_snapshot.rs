use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use finchdb::indexer::{RequestMeta, WriteKind};
use finchdb::raft::{LocalNode, NodeEndpoint, NodeManager, ReplicatedEngine, StateMachine};
use finchdb::{BatchedIndexer, CollectionManager, Store, WriteOperation};
use serde_json::json;
use tempfile::TempDir;

struct Cluster {
    _dir: TempDir,
    store: Arc<Store>,
    manager: Arc<CollectionManager>,
    indexer: Arc<BatchedIndexer>,
    engine: Arc<ReplicatedEngine>,
    node: Arc<NodeManager>,
    workers: Vec<std::thread::JoinHandle<()>>,
}

fn start_node() -> Cluster {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("state")).unwrap());
    let manager = Arc::new(CollectionManager::new(store.clone(), 1000));
    let indexer = Arc::new(BatchedIndexer::new(manager.clone(), store.clone(), 2));
    let engine = Arc::new(ReplicatedEngine::new(
        store.clone(),
        manager.clone(),
        indexer.clone(),
    ));
    engine.boot().unwrap();

    let endpoint = NodeEndpoint {
        ip: "127.0.0.1".to_string(),
        peering_port: 8107,
        api_port: 8108,
    };
    let node = Arc::new(NodeManager::new(engine.clone(), endpoint.clone(), false));
    let local = Arc::new(LocalNode::new(
        engine.clone(),
        endpoint,
        dir.path().join("snapshots"),
    ));
    node.init_node(local, "127.0.0.1:8107:8108").unwrap();

    let workers = indexer.clone().run();
    Cluster {
        _dir: dir,
        store,
        manager,
        indexer,
        engine,
        node,
        workers,
    }
}

impl Cluster {
    fn shutdown(self) {
        self.indexer.stop();
        for handle in self.workers {
            let _ = handle.join();
        }
        self.node.shutdown();
        self.store.flush().unwrap();
    }
}

#[test]
fn write_through_log_returns_created_document() {
    let cluster = start_node();
    let runtime = tokio::runtime::Runtime::new().unwrap();

    let schema = json!({
        "name": "books",
        "fields": [
            {"name": "title", "type": "string"},
            {"name": "points", "type": "int32"}
        ],
        "default_sorting_field": "points"
    });
    let (code, _) = runtime
        .block_on(cluster.node.write(
            RequestMeta {
                req_id: 1,
                log_index: 0,
                kind: WriteKind::CreateCollection,
            },
            schema.to_string().into_bytes(),
            "/collections",
        ))
        .unwrap();
    assert_eq!(code, 201);

    let doc = json!({"id": "0", "title": "Sherlock Holmes", "points": 100});
    let (code, body) = runtime
        .block_on(cluster.node.write(
            RequestMeta {
                req_id: 2,
                log_index: 0,
                kind: WriteKind::WriteDocument {
                    collection: "books".into(),
                    action: "create".into(),
                },
            },
            doc.to_string().into_bytes(),
            "/collections/books/documents",
        ))
        .unwrap();
    assert_eq!(code, 201);
    assert_eq!(body["id"], "0");

    // The applied write is visible to reads immediately after the response.
    let result = cluster
        .manager
        .do_search(
            [("q".to_string(), "sherlock".to_string()), ("query_by".to_string(), "title".to_string())]
                .into_iter()
                .collect::<BTreeMap<_, _>>(),
            BTreeMap::new(),
            "books",
            Instant::now(),
        )
        .unwrap();
    assert_eq!(result["found"], 1);

    assert!(cluster.engine.applied_index() >= 2);
    assert!(cluster.node.is_leader());
    cluster.shutdown();
}

#[test]
fn status_reports_leadership_and_watermarks() {
    let cluster = start_node();
    let status = cluster.node.get_status();
    assert_eq!(status["is_leader"], true);
    assert_eq!(status["read_caught_up"], true);
    assert_eq!(status["write_caught_up"], true);
    cluster.shutdown();
}

#[test]
fn snapshot_round_trip_preserves_documents_and_seq_ids() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::new(dir.path().join("state")).unwrap());
    let manager = Arc::new(CollectionManager::new(store.clone(), 64));
    let indexer = Arc::new(BatchedIndexer::new(manager.clone(), store.clone(), 2));
    let engine = ReplicatedEngine::new(store.clone(), manager.clone(), indexer);

    manager
        .create_collection(&json!({
            "name": "books",
            "fields": [
                {"name": "title", "type": "string"},
                {"name": "points", "type": "int32"}
            ],
            "default_sorting_field": "points"
        }))
        .unwrap();
    for i in 0..1000 {
        manager
            .add_document(
                "books",
                json!({"id": i.to_string(), "title": format!("book number {}", i), "points": i}),
                WriteOperation::Create,
            )
            .unwrap();
    }

    let snapshot_dir = dir.path().join("snap");
    engine.on_snapshot_save(&snapshot_dir).unwrap();

    // Writes racing past the snapshot point are rolled back by the restore.
    for i in 1000..1010 {
        manager
            .add_document(
                "books",
                json!({"id": i.to_string(), "title": "late", "points": i}),
                WriteOperation::Create,
            )
            .unwrap();
    }

    engine.on_snapshot_load(&snapshot_dir).unwrap();

    let handle = manager.get_collection("books").unwrap();
    let coll = handle.read();
    assert_eq!(coll.indexes.num_documents(), 1000);
    assert_eq!(coll.next_seq_id(), 1000);

    // The id <-> seq-id mapping is idempotent across the restore.
    assert_eq!(coll.seq_id_for("42").unwrap(), Some(42));
    assert_eq!(coll.seq_id_for("1005").unwrap(), None);
    drop(coll);

    // New writes continue from the restored sequence counter.
    let stored = manager
        .add_document(
            "books",
            json!({"id": "fresh", "title": "fresh", "points": 1}),
            WriteOperation::Create,
        )
        .unwrap();
    assert_eq!(stored["id"], "fresh");
    let handle = manager.get_collection("books").unwrap();
    assert_eq!(handle.read().seq_id_for("fresh").unwrap(), Some(1000));
}

#[test]
fn poison_write_is_skipped_on_replay() {
    let cluster = start_node();

    // Simulate a crash: a marker for index 99 is left on disk, then reload.
    cluster.indexer.persist_applying_index(99).unwrap();
    cluster.indexer.populate_skip_index().unwrap();

    let runtime = tokio::runtime::Runtime::new().unwrap();
    let (code, _) = runtime
        .block_on(async {
            // The local node assigns increasing indices; drive it until 99.
            let mut last = (0u16, serde_json::Value::Null);
            for i in 0..99 {
                let schema = json!({
                    "name": format!("c{}", i),
                    "fields": [{"name": "x", "type": "string"}]
                });
                last = cluster
                    .node
                    .write(
                        RequestMeta {
                            req_id: 100 + i,
                            log_index: 0,
                            kind: WriteKind::CreateCollection,
                        },
                        schema.to_string().into_bytes(),
                        "/collections",
                    )
                    .await
                    .unwrap();
            }
            Ok::<_, finchdb::EngineError>(last)
        })
        .unwrap();

    // Entry applied at the poisoned index 99 was skipped with a 422.
    assert_eq!(code, 422);
    assert!(cluster.manager.get_collection("c98").is_none());
    assert!(cluster.manager.get_collection("c97").is_some());
    cluster.shutdown();
}
