//! Report processing end to end: mock filing site, scripted extractor,
//! in-memory store.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use azfinance_lib::normalize::DonorClassifier;
use azfinance_lib::pipeline::ReportStrategy;
use azfinance_lib::store::memory::MemoryStore;
use azfinance_lib::{
    ExtractedTable, Extractor, ExtractorError, FilingsClient, RequestTracker, RetryPolicy, Row,
    Runner, UploadConfig, UploadCoordinator, WorkQueue, WorkStatus,
};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CSV: &str = "\
OrgNm,OrgEml,OrgTel,OrgAdr,OrgTreasurer,Jurisdiction,Rpt_Name,Donor_Name,Donor_Addr,Donation_Date,Donation_Amt
Friends of Jane,Phone: 602-555-0100,1 Main St,Treasurer: Sam Roe,,,Q1,Pat Doe,\"1 Elm Rd, Mesa, AZ 85201\",03/01/2024,100
Friends of Jane,Phone: 602-555-0100,1 Main St,Treasurer: Sam Roe,,,Q1,Acme PAC,,03/02/2024,\"$2,500.00\"
";

/// Returns a fixed table, and fails when the document was never saved.
struct CannedExtractor;

impl Extractor for CannedExtractor {
    fn extract(
        &self,
        pdf: &Path,
        _csv_out: &Path,
    ) -> impl Future<Output = Result<ExtractedTable, ExtractorError>> + Send {
        let exists = pdf.exists();
        let missing = pdf.to_path_buf();
        async move {
            if !exists {
                return Err(ExtractorError::MissingOutput(missing));
            }
            ExtractedTable::from_reader(CSV.as_bytes())
        }
    }
}

/// Leaves partial output next to the document, then fails.
struct PartialExtractor;

impl Extractor for PartialExtractor {
    fn extract(
        &self,
        _pdf: &Path,
        csv_out: &Path,
    ) -> impl Future<Output = Result<ExtractedTable, ExtractorError>> + Send {
        let written = std::fs::write(csv_out, "Donor_Name\nPat Doe\n");
        async move {
            written.map_err(ExtractorError::Spawn)?;
            Err(ExtractorError::Exited {
                status: 1,
                stderr: "unsupported layout".to_string(),
            })
        }
    }
}

fn row(v: serde_json::Value) -> Row {
    v.as_object().unwrap().clone()
}

async fn setup(server: &MockServer) -> Arc<MemoryStore> {
    Mock::given(method("GET"))
        .and(path("/Reporting/GetPDF/1.pdf"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF".to_vec()))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Reporting/ReportFile/2"))
        .respond_with(ResponseTemplate::new(404))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/Reporting/GetPDF/3.pdf"))
        .respond_with(ResponseTemplate::new(502))
        .mount(server)
        .await;

    let store = MemoryStore::new()
        .with_identity("cf_reports", "report_id")
        .with_identity("cf_donations", "donation_id");
    let uri = server.uri();
    store.seed(
        "cf_report_pdfs",
        vec![
            row(json!({"pdf_id": 1, "entity_id": 50, "status": "unprocessed",
                "pdf_url": format!("{}/Reporting/GetPDF/1.pdf", uri), "report_name": "2024 Q1"})),
            row(json!({"pdf_id": 2, "entity_id": 50, "status": "unprocessed",
                "pdf_url": format!("{}/Reporting/ReportFile/2", uri), "report_name": "2024 Q2"})),
            row(json!({"pdf_id": 3, "entity_id": 50, "status": "unprocessed",
                "pdf_url": format!("{}/Reporting/GetPDF/3.pdf", uri), "report_name": "2024 Q3"})),
        ],
    );
    Arc::new(store)
}

fn strategy(
    store: &Arc<MemoryStore>,
    server: &MockServer,
    work_dir: &Path,
) -> Arc<ReportStrategy<MemoryStore, CannedExtractor>> {
    strategy_with(store, server, work_dir, CannedExtractor)
}

fn strategy_with<E: Extractor + 'static>(
    store: &Arc<MemoryStore>,
    server: &MockServer,
    work_dir: &Path,
    extractor: E,
) -> Arc<ReportStrategy<MemoryStore, E>> {
    let tracker = Arc::new(RequestTracker::new());
    let retry =
        RetryPolicy::new(1, Duration::from_millis(1), Duration::from_millis(2)).without_jitter();
    let coordinator = UploadCoordinator::new(
        Arc::clone(store),
        UploadConfig::default(),
        retry,
        Arc::clone(&tracker),
    );
    let filings = FilingsClient::new(&server.uri(), retry, tracker).unwrap();
    Arc::new(ReportStrategy::new(
        coordinator,
        filings,
        extractor,
        DonorClassifier::from_seed().unwrap(),
        work_dir,
    ))
}

#[tokio::test]
async fn processes_skips_and_fails_independently() {
    let server = MockServer::start().await;
    let store = setup(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let queue = WorkQueue::report_pdfs();

    let units = queue
        .fetch(store.as_ref(), WorkStatus::Unprocessed, None, None)
        .await
        .unwrap();
    assert_eq!(units.len(), 3);

    let stats = Runner::new(2)
        .run(strategy(&store, &server, dir.path()), units, |_, _| {})
        .await;
    assert_eq!(stats.processed, 1);
    assert_eq!(stats.skipped, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.rows, 2);

    let pdfs = store.rows("cf_report_pdfs");
    assert_eq!(pdfs[0]["status"], json!("processed"));
    assert_eq!(pdfs[0]["row_count"], json!(2));
    assert_eq!(pdfs[1]["status"], json!("skipped"));
    assert_eq!(pdfs[2]["status"], json!("unprocessed"));
    assert!(pdfs[2]["last_error"].as_str().unwrap().contains("502"));

    let reports = store.rows("cf_reports");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0]["org_phone"], json!("602-555-0100"));
    assert_eq!(reports[0]["org_treasurer"], json!("Sam Roe"));
    assert_eq!(reports[0]["org_jurisdiction"], json!("Arizona Secretary of State"));
    assert_eq!(reports[0]["rpt_name"], json!("Q1"));

    let donations = store.rows("cf_donations");
    assert_eq!(donations.len(), 2);
    assert!(donations.iter().all(|d| d["report_id"] == reports[0]["report_id"]));
    assert_eq!(donations[1]["is_pac"], json!(true));

    // scratch files are removed
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn reprocessing_a_document_is_idempotent() {
    let server = MockServer::start().await;
    let store = setup(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let queue = WorkQueue::report_pdfs();
    let strategy = strategy(&store, &server, dir.path());

    for _ in 0..2 {
        queue
            .reset(store.as_ref(), WorkStatus::Processed, None)
            .await
            .unwrap();
        let units: Vec<_> = queue
            .fetch(store.as_ref(), WorkStatus::Unprocessed, None, None)
            .await
            .unwrap()
            .into_iter()
            .filter(|u| u.id == 1)
            .collect();
        let stats = Runner::new(1).run(Arc::clone(&strategy), units, |_, _| {}).await;
        assert_eq!(stats.processed, 1);
    }

    assert_eq!(store.rows("cf_reports").len(), 1);
    assert_eq!(store.rows("cf_donations").len(), 2);
}

#[tokio::test]
async fn failed_extraction_leaves_no_scratch_files() {
    let server = MockServer::start().await;
    let store = setup(&server).await;
    let dir = tempfile::tempdir().unwrap();
    let queue = WorkQueue::report_pdfs();
    let units: Vec<_> = queue
        .fetch(store.as_ref(), WorkStatus::Unprocessed, None, None)
        .await
        .unwrap()
        .into_iter()
        .filter(|u| u.id == 1)
        .collect();

    let strategy = strategy_with(&store, &server, dir.path(), PartialExtractor);
    let stats = Runner::new(1).run(strategy, units, |_, _| {}).await;
    assert_eq!(stats.failed, 1);

    let pdfs = store.rows("cf_report_pdfs");
    assert_eq!(pdfs[0]["status"], json!("unprocessed"));
    assert!(pdfs[0]["last_error"]
        .as_str()
        .unwrap()
        .contains("unsupported layout"));
    assert!(store.rows("cf_reports").is_empty());
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}
