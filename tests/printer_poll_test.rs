// Integration tests for the printer poll exchange

mod common;

use axum::http::StatusCode;
use common::{kiln_request, record_ids, RecordingHook, StaticPhotos, TestManagerBuilder, TestStore};
use kiln_print_queue::epos::TicketOptions;
use kiln_print_queue::photo::EncodedImage;
use kiln_print_queue::protocol::{PollBody, PollHandler};
use kiln_print_queue::{QueueManager, RemovalMatch};
use serde_json::json;
use std::sync::atomic::Ordering;
use std::sync::Arc;

const GET_REQUEST: &[u8] = b"ConnectionType=GetRequest&ID=local_printer&Name=TM-m30";
const SET_RESPONSE: &[u8] =
    b"ConnectionType=SetResponse&ID=local_printer&ResponseFile=%3CPrintResponseInfo%2F%3E";

fn poll_handler(
    manager: Arc<QueueManager>,
    telemetry: Arc<kiln_print_queue::telemetry::TelemetryCollector>,
    image: Option<EncodedImage>,
) -> PollHandler {
    PollHandler::new(
        manager,
        Arc::new(StaticPhotos { image }),
        telemetry,
        TicketOptions::default(),
    )
}

fn xml(body: PollBody) -> String {
    match body {
        PollBody::Xml(xml) => xml,
        PollBody::Json(value) => panic!("expected XML, got {}", value),
    }
}

#[tokio::test]
async fn test_get_request_renders_head_without_removing_it() {
    let store = TestStore::new().await;
    let (manager, telemetry) = TestManagerBuilder::new().build(store, RecordingHook::new());
    let handler = poll_handler(manager.clone(), telemetry.clone(), None);

    manager.enqueue("t1", &kiln_request("r1", "t1", "Ann")).await.unwrap();
    manager.enqueue("t1", &kiln_request("r2", "t1", "Bo")).await.unwrap();

    let reply = handler.handle("t1", GET_REQUEST).await;

    assert_eq!(reply.status, StatusCode::OK);
    let ticket = xml(reply.body);
    assert!(ticket.contains("<devid>local_printer</devid>"));
    assert!(ticket.contains("Name: Ann Potter"));
    assert!(!ticket.contains("Bo Potter"));
    assert!(ticket.contains("<text>Doodle:&#10;</text>"));

    assert_eq!(record_ids(&manager.list_jobs("t1").await.unwrap()), vec!["r1", "r2"]);
    assert_eq!(telemetry.get_metrics().await.polls_with_job, 1);
}

#[tokio::test]
async fn test_photo_replaces_doodle() {
    let store = TestStore::new().await;
    let (manager, telemetry) = TestManagerBuilder::new().build(store, RecordingHook::new());
    let image = EncodedImage {
        width: 8,
        height: 1,
        data: "/w==".to_string(),
    };
    let handler = poll_handler(manager.clone(), telemetry, Some(image));

    let mut record = kiln_request("r1", "t1", "Ann");
    record.photo_url = Some("https://cdn.example.com/pots/r1.jpg".to_string());
    manager.enqueue("t1", &record).await.unwrap();

    let ticket = xml(handler.handle("t1", GET_REQUEST).await.body);

    assert!(ticket.contains(
        "<image width=\"8\" height=\"1\" color=\"color_1\" mode=\"mono\">/w==</image>"
    ));
    assert!(!ticket.contains("Doodle:"));
}

#[tokio::test]
async fn test_unavailable_photo_falls_back_to_doodle() {
    let store = TestStore::new().await;
    let (manager, telemetry) = TestManagerBuilder::new().build(store, RecordingHook::new());
    let handler = poll_handler(manager.clone(), telemetry, None);

    let mut record = kiln_request("r1", "t1", "Ann");
    record.photo_url = Some("https://cdn.example.com/pots/missing.jpg".to_string());
    manager.enqueue("t1", &record).await.unwrap();

    let reply = handler.handle("t1", GET_REQUEST).await;

    assert_eq!(reply.status, StatusCode::OK);
    let ticket = xml(reply.body);
    assert!(ticket.contains("Doodle:"));
    assert!(!ticket.contains("<image"));
}

#[tokio::test]
async fn test_get_request_on_empty_queue() {
    let store = TestStore::new().await;
    let (manager, telemetry) = TestManagerBuilder::new().build(store, RecordingHook::new());
    let handler = poll_handler(manager, telemetry.clone(), None);

    let reply = handler.handle("t1", GET_REQUEST).await;

    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.body, PollBody::Json(json!({ "message": "No jobs in queue" })));
    assert_eq!(telemetry.get_metrics().await.polls_empty, 1);
}

#[tokio::test]
async fn test_get_request_store_error() {
    let store = TestStore::new().await;
    store.permanent_errors();
    store.fail_lists(1);
    let (manager, telemetry) = TestManagerBuilder::new().build(store, RecordingHook::new());
    let handler = poll_handler(manager, telemetry, None);

    let reply = handler.handle("t1", GET_REQUEST).await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body, PollBody::Json(json!({ "success": false })));
}

#[tokio::test]
async fn test_set_response_acknowledges_head() {
    let store = TestStore::new().await;
    let hook = RecordingHook::new();
    let (manager, telemetry) = TestManagerBuilder::new().build(store, hook.clone());
    let handler = poll_handler(manager.clone(), telemetry.clone(), None);

    manager.enqueue("t1", &kiln_request("r1", "t1", "Ann")).await.unwrap();
    manager.enqueue("t1", &kiln_request("r2", "t1", "Bo")).await.unwrap();

    let reply = handler.handle("t1", SET_RESPONSE).await;

    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(
        reply.body,
        PollBody::Json(json!({ "success": true, "message": "Processed print job successfully" }))
    );
    assert_eq!(record_ids(&manager.list_jobs("t1").await.unwrap()), vec!["r2"]);
    assert_eq!(hook.flagged_ids(), vec!["r1"]);
    assert_eq!(telemetry.get_metrics().await.acknowledgements, 1);
}

#[tokio::test]
async fn test_set_response_on_empty_queue_is_idempotent() {
    let store = TestStore::new().await;
    let hook = RecordingHook::new();
    let (manager, telemetry) = TestManagerBuilder::new().build(store, hook.clone());
    let handler = poll_handler(manager.clone(), telemetry, None);

    for _ in 0..2 {
        let reply = handler.handle("t1", SET_RESPONSE).await;
        assert_eq!(reply.status, StatusCode::OK);
    }

    assert!(manager.list_jobs("t1").await.unwrap().is_empty());
    assert!(hook.flagged_ids().is_empty());
}

#[tokio::test]
async fn test_set_response_hook_failure() {
    let store = TestStore::new().await;
    let hook = RecordingHook::new();
    hook.fail_permanently();
    let (manager, telemetry) = TestManagerBuilder::new().build(store, hook);
    let handler = poll_handler(manager.clone(), telemetry, None);

    manager.enqueue("t1", &kiln_request("r1", "t1", "Ann")).await.unwrap();

    let reply = handler.handle("t1", SET_RESPONSE).await;

    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        reply.body,
        PollBody::Json(json!({ "success": false, "message": "Error processing print job" }))
    );
    // Still at the head for the next acknowledgement
    assert_eq!(record_ids(&manager.list_jobs("t1").await.unwrap()), vec!["r1"]);
}

#[tokio::test]
async fn test_simultaneous_acknowledgements_remove_head_once() {
    let store = TestStore::new().await;
    let hook = RecordingHook::new();
    let (manager, telemetry) = TestManagerBuilder::new().build(store.clone(), hook.clone());
    let handler = poll_handler(manager.clone(), telemetry, None);

    for id in ["r1", "r2", "r3"] {
        manager.enqueue("t1", &kiln_request(id, "t1", "Ann")).await.unwrap();
    }

    let (a, b) = tokio::join!(
        handler.handle("t1", SET_RESPONSE),
        handler.handle("t1", SET_RESPONSE)
    );

    assert_eq!(a.status, StatusCode::OK);
    assert_eq!(b.status, StatusCode::OK);
    // Both saw r1 at the head; only one entry left the queue
    assert_eq!(record_ids(&manager.list_jobs("t1").await.unwrap()), vec!["r2", "r3"]);
    assert_eq!(hook.flagged_ids(), vec!["r1", "r1"]);
    assert_eq!(store.max_per_tenant.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_simultaneous_acknowledgements_by_content_clear_duplicate_head() {
    let store = TestStore::new().await;
    let hook = RecordingHook::new();
    let (manager, telemetry) = TestManagerBuilder::new()
        .with_removal_match(RemovalMatch::Content)
        .build(store.clone(), hook.clone());
    let handler = poll_handler(manager.clone(), telemetry, None);

    let record = kiln_request("r1", "t1", "Ann");
    manager.enqueue("t1", &record).await.unwrap();
    manager.enqueue("t1", &record).await.unwrap();

    let (a, b) = tokio::join!(
        handler.handle("t1", SET_RESPONSE),
        handler.handle("t1", SET_RESPONSE)
    );

    assert_eq!(a.status, StatusCode::OK);
    assert_eq!(b.status, StatusCode::OK);
    // Each removal takes the first equal payload, so both copies go
    assert!(manager.list_jobs("t1").await.unwrap().is_empty());
    assert_eq!(hook.flagged_ids(), vec!["r1", "r1"]);
    assert_eq!(store.max_per_tenant.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_full_print_cycle_drains_queue_in_order() {
    let store = TestStore::new().await;
    let hook = RecordingHook::new();
    let (manager, telemetry) = TestManagerBuilder::new().build(store, hook.clone());
    let handler = poll_handler(manager.clone(), telemetry, None);

    for (id, name) in [("r1", "Ann"), ("r2", "Bo"), ("r3", "Cy")] {
        manager.enqueue("t1", &kiln_request(id, "t1", name)).await.unwrap();
    }

    for name in ["Ann", "Bo", "Cy"] {
        let ticket = xml(handler.handle("t1", GET_REQUEST).await.body);
        assert!(ticket.contains(&format!("Name: {} Potter", name)));
        assert_eq!(handler.handle("t1", SET_RESPONSE).await.status, StatusCode::OK);
    }

    assert_eq!(handler.handle("t1", GET_REQUEST).await.status, StatusCode::CREATED);
    assert_eq!(hook.flagged_ids(), vec!["r1", "r2", "r3"]);
}

#[tokio::test]
async fn test_invalid_connection_type() {
    let store = TestStore::new().await;
    let (manager, telemetry) = TestManagerBuilder::new().build(store, RecordingHook::new());
    let handler = poll_handler(manager, telemetry.clone(), None);

    let reply = handler.handle("t1", b"ConnectionType=Status").await;

    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        reply.body,
        PollBody::Json(json!({ "success": false, "message": "Invalid connection type" }))
    );
    assert_eq!(telemetry.get_metrics().await.poll_errors, 1);
}
