//! Upload coordinator against the REST client and a mock store server.

use std::sync::Arc;
use std::time::Duration;

use azfinance_lib::cfstore_api::Client;
use azfinance_lib::upload::ENTITY_TABLE;
use azfinance_lib::{
    InsertMode, PipelineError, ReferencedEntity, RequestTracker, RetryPolicy, Row,
    UploadConfig, UploadCoordinator, UploadRow, WorkQueue,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)).without_jitter()
}

fn coordinator(server: &MockServer) -> (UploadCoordinator<Client>, Arc<RequestTracker>) {
    let client = Client::new(&server.uri(), "k").unwrap();
    let tracker = Arc::new(RequestTracker::new());
    (
        UploadCoordinator::new(
            Arc::new(client),
            UploadConfig::default(),
            fast_retry(),
            Arc::clone(&tracker),
        ),
        tracker,
    )
}

fn rows(n: usize) -> Vec<Row> {
    (0..n)
        .map(|i| json!({"seq": i, "donor_name": "Jane Doe"}).as_object().unwrap().clone())
        .collect()
}

/// Matches insert bodies whose first element carries `seq`.
fn first_seq(seq: u64) -> impl Fn(&Request) -> bool {
    move |req: &Request| {
        serde_json::from_slice::<Vec<Value>>(&req.body)
            .ok()
            .and_then(|rows| rows.first().and_then(|r| r["seq"].as_u64()))
            == Some(seq)
    }
}

async fn posts_to(server: &MockServer, table: &str) -> usize {
    let target = format!("/rest/v1/{}", table);
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "POST" && r.url.path() == target)
        .count()
}

#[tokio::test]
async fn two_hundred_fifty_rows_make_three_writes() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_donations"))
        .respond_with(ResponseTemplate::new(201))
        .expect(3)
        .mount(&server)
        .await;

    let (up, _) = coordinator(&server);
    let written = up
        .insert_rows("cf_donations", &rows(250), &InsertMode::plain())
        .await
        .unwrap();
    assert_eq!(written, 250);
}

#[tokio::test]
async fn deadlock_on_second_chunk_is_retried_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_donations"))
        .and(first_seq(100))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_string(r#"{"code":"40P01","message":"deadlock detected"}"#),
        )
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_donations"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let (up, tracker) = coordinator(&server);
    up.insert_rows("cf_donations", &rows(250), &InsertMode::plain())
        .await
        .unwrap();

    assert_eq!(posts_to(&server, "cf_donations").await, 4);
    assert_eq!(tracker.summary().requests_retried, 1);
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_donations"))
        .respond_with(
            ResponseTemplate::new(422).set_body_string(r#"{"code":"22P02","message":"bad"}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (up, tracker) = coordinator(&server);
    let err = up
        .insert_rows("cf_donations", &rows(10), &InsertMode::plain())
        .await
        .unwrap_err();
    match err {
        PipelineError::ChunkFailed { chunk, source, .. } => {
            assert_eq!(chunk, 1);
            assert_eq!(source.status(), Some(422));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(tracker.summary().requests_retried, 0);
}

#[tokio::test]
async fn server_error_retries_are_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_donations"))
        .respond_with(ResponseTemplate::new(503))
        .expect(4)
        .mount(&server)
        .await;

    let (up, tracker) = coordinator(&server);
    let result = up
        .insert_rows("cf_donations", &rows(10), &InsertMode::plain())
        .await;
    assert!(matches!(result, Err(PipelineError::ChunkFailed { .. })));
    let summary = tracker.summary();
    assert_eq!(summary.requests_retried, 3);
    assert_eq!(summary.requests_failed, 1);
}

struct Txn(i64, i64);

impl UploadRow for Txn {
    fn to_row(&self) -> Row {
        json!({"public_transaction_id": self.0, "transaction_entity_id": self.1})
            .as_object()
            .unwrap()
            .clone()
    }

    fn referenced_entity(&self) -> Option<ReferencedEntity> {
        Some(ReferencedEntity::stub(self.1))
    }
}

#[tokio::test]
async fn failed_chunk_never_marks_unit_processed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/rest/v1/{}", ENTITY_TABLE)))
        .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("/rest/v1/{}", ENTITY_TABLE)))
        .and(query_param("on_conflict", "entity_id"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_transactions"))
        .respond_with(ResponseTemplate::new(409).set_body_string(r#"{"code":"23503"}"#))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/cf_entities"))
        .respond_with(ResponseTemplate::new(204))
        .expect(0)
        .mount(&server)
        .await;

    let (up, _) = coordinator(&server);
    let txns = vec![Txn(1, 500), Txn(2, 501), Txn(3, -1)];
    let err = up
        .upload(
            &WorkQueue::entities(),
            42,
            "cf_transactions",
            &txns,
            &InsertMode::merge_duplicates("public_transaction_id"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.store_status(), Some(409));
}

#[tokio::test]
async fn precreate_failure_blocks_dependent_writes() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/rest/v1/{}", ENTITY_TABLE)))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_transactions"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let (up, _) = coordinator(&server);
    let err = up
        .upload(
            &WorkQueue::entities(),
            42,
            "cf_transactions",
            &[Txn(1, 500)],
            &InsertMode::plain(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::EntityPrecreate(_)));
    assert_eq!(posts_to(&server, "cf_transactions").await, 0);
}

#[tokio::test]
async fn successful_upload_marks_processed_with_aggregates() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/v1/cf_donations"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/rest/v1/cf_report_pdfs"))
        .and(query_param("pdf_id", "eq.7"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let (up, _) = coordinator(&server);
    let written = up
        .upload(
            &WorkQueue::report_pdfs(),
            7,
            "cf_donations",
            &rows(120),
            &InsertMode::plain(),
        )
        .await
        .unwrap();
    assert_eq!(written, 120);

    let requests = server.received_requests().await.unwrap_or_default();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH")
        .unwrap();
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(body["status"], json!("processed"));
    assert_eq!(body["row_count"], json!(120));
    assert!(body["processed_at"].is_string());
}
