use std::sync::Arc;

use reflow::document::JobStateDoc;
use reflow::job::JobRequest;
use reflow::store::{MemoryStore, StoreError, VersionedStore};

fn make_doc() -> JobStateDoc {
    JobStateDoc::new(JobRequest::new(vec!["src".to_string()], "dest"), Vec::new())
}

#[reflow::test]
async fn get_returns_document_and_token() {
    let store = MemoryStore::new_arc();
    store.insert("j1", &make_doc()).unwrap();
    let (doc, _token) = store.get("j1").await.unwrap();
    assert_eq!(doc, make_doc());
}

#[reflow::test]
async fn get_unknown_job_is_not_found() {
    let store = MemoryStore::new_arc();
    assert!(matches!(
        store.get("missing").await,
        Err(StoreError::NotFound(_))
    ));
}

#[reflow::test]
async fn insert_rejects_duplicate_job_id() {
    let store = MemoryStore::new_arc();
    store.insert("j1", &make_doc()).unwrap();
    assert!(matches!(
        store.insert("j1", &make_doc()),
        Err(StoreError::WriteFailure(_))
    ));
}

#[reflow::test]
async fn update_with_current_token_succeeds_and_bumps_version() {
    let store = MemoryStore::new_arc();
    store.insert("j1", &make_doc()).unwrap();
    let (doc, token) = store.get("j1").await.unwrap();
    let claimed = doc.with_allocation(3);
    let new_token = store.update("j1", &claimed, token).await.unwrap();
    assert_ne!(new_token, token);
    let (read_back, read_token) = store.get("j1").await.unwrap();
    assert_eq!(read_back.allocation, Some(3));
    assert_eq!(read_token, new_token);
}

#[reflow::test]
async fn update_with_stale_token_conflicts_without_mutating() {
    let store: Arc<MemoryStore> = MemoryStore::new_arc();
    store.insert("j1", &make_doc()).unwrap();
    let (doc, token) = store.get("j1").await.unwrap();

    // First writer wins.
    store
        .update("j1", &doc.with_allocation(3), token)
        .await
        .unwrap();

    // Second writer still holds the original token.
    let result = store.update("j1", &doc.with_allocation(99), token).await;
    assert!(matches!(result, Err(StoreError::VersionConflict)));
    assert_eq!(store.snapshot("j1").unwrap().allocation, Some(3));
}

#[reflow::test]
async fn every_round_trip_goes_through_the_wire_codec() {
    let store = MemoryStore::new_arc();
    let mut doc = make_doc();
    doc.request.query = Some(serde_json::json!({"term": {"user": "kimchy"}}));
    store.insert("j1", &doc).unwrap();
    let (read_back, _) = store.get("j1").await.unwrap();
    assert_eq!(read_back.request.query, doc.request.query);
}
