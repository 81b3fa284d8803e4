//! PDF-to-CSV extraction through an external `Rscript` wrapper.
//!
//! The wrapper is invoked as `Rscript <wrapper> <pdf> <csv>`. A zero exit
//! status with a written CSV is success; the CSV may hold only a header row,
//! which is a valid zero-row table and distinct from a failed extraction.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use crate::normalize::is_blank;

/// Errors from the extractor subprocess or its output.
#[derive(thiserror::Error, Debug)]
pub enum ExtractorError {
    #[error("failed to start extractor: {0}")]
    Spawn(#[source] io::Error),
    #[error("extractor exited with status {status}: {stderr}")]
    Exited { status: i32, stderr: String },
    #[error("extractor timed out after {0:?}")]
    TimedOut(Duration),
    #[error("extractor wrote no output at {0}")]
    MissingOutput(PathBuf),
    #[error("could not clear previous output {path}: {source}")]
    StaleOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unreadable extractor output: {0}")]
    Csv(#[from] csv::Error),
}

/// One CSV row keyed by column name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedRecord {
    fields: BTreeMap<String, String>,
}

impl ExtractedRecord {
    pub fn get(&self, field: &str) -> Option<&str> {
        self.fields.get(field).map(String::as_str)
    }

    /// The raw value, or `""` when the column is absent.
    pub fn value(&self, field: &str) -> &str {
        self.get(field).unwrap_or("")
    }

    /// The trimmed value unless it is empty or `NA`.
    pub fn present(&self, field: &str) -> Option<&str> {
        self.get(field).filter(|v| !is_blank(v)).map(str::trim)
    }

    pub fn set(&mut self, field: &str, value: String) {
        self.fields.insert(field.to_string(), value);
    }
}

impl FromIterator<(String, String)> for ExtractedRecord {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

/// Header list plus every record of one extractor run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedTable {
    pub headers: Vec<String>,
    pub records: Vec<ExtractedRecord>,
}

impl ExtractedTable {
    /// Parses CSV text. Ragged rows are padded or truncated to the header width.
    pub fn from_reader<R: io::Read>(reader: R) -> Result<Self, ExtractorError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(reader);
        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .map(|h| h.trim().trim_start_matches('\u{feff}').to_string())
            .collect();
        let mut records: Vec<ExtractedRecord> = Vec::new();
        for result in rdr.records() {
            let row = result?;
            if row.iter().all(|v| v.trim().is_empty()) {
                continue;
            }
            records.push(
                headers
                    .iter()
                    .enumerate()
                    .map(|(i, h)| (h.clone(), row.get(i).unwrap_or("").to_string()))
                    .collect(),
            );
        }
        Ok(Self { headers, records })
    }

    pub fn from_path(path: &Path) -> Result<Self, ExtractorError> {
        let file = std::fs::File::open(path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ExtractorError::MissingOutput(path.to_path_buf())
            } else {
                ExtractorError::Csv(csv::Error::from(e))
            }
        })?;
        Self::from_reader(file)
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The first record carries the report-level metadata.
    pub fn first(&self) -> Option<&ExtractedRecord> {
        self.records.first()
    }
}

/// Turns a PDF on disk into an [`ExtractedTable`].
pub trait Extractor: Send + Sync {
    fn extract(
        &self,
        pdf: &Path,
        csv_out: &Path,
    ) -> impl Future<Output = Result<ExtractedTable, ExtractorError>> + Send;
}

/// Runs the R wrapper script with escalating timeouts.
#[derive(Debug, Clone)]
pub struct RscriptExtractor {
    program: String,
    script: PathBuf,
    /// Budget per attempt; only timeouts move on to the next entry.
    timeouts: Vec<Duration>,
    pause: Duration,
}

impl RscriptExtractor {
    /// 60 s for the first attempt, then 90 s for each of two retries.
    pub fn new(script: impl Into<PathBuf>) -> Self {
        Self {
            program: "Rscript".to_string(),
            script: script.into(),
            timeouts: vec![
                Duration::from_secs(60),
                Duration::from_secs(90),
                Duration::from_secs(90),
            ],
            pause: Duration::from_secs(1),
        }
    }

    /// Interpreter to invoke instead of `Rscript`.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_string();
        self
    }

    pub fn with_timeouts(mut self, timeouts: Vec<Duration>, pause: Duration) -> Self {
        if !timeouts.is_empty() {
            self.timeouts = timeouts;
        }
        self.pause = pause;
        self
    }

    async fn run_once(
        &self,
        pdf: &Path,
        csv_out: &Path,
        budget: Duration,
    ) -> Result<(), ExtractorError> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.script)
            .arg(pdf)
            .arg(csv_out)
            .kill_on_drop(true);
        let output = match tokio::time::timeout(budget, cmd.output()).await {
            Ok(result) => result.map_err(ExtractorError::Spawn)?,
            Err(_) => return Err(ExtractorError::TimedOut(budget)),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return Err(ExtractorError::Exited {
                status: output.status.code().unwrap_or(-1),
                stderr: if stderr.is_empty() { stdout } else { stderr },
            });
        }
        Ok(())
    }
}

impl Extractor for RscriptExtractor {
    fn extract(
        &self,
        pdf: &Path,
        csv_out: &Path,
    ) -> impl Future<Output = Result<ExtractedTable, ExtractorError>> + Send {
        async move {
            let mut last_err = None;
            for (attempt, budget) in self.timeouts.iter().enumerate() {
                // A killed attempt may have left a partial CSV behind.
                clear_output(csv_out).await?;
                match self.run_once(pdf, csv_out, *budget).await {
                    Ok(()) => return ExtractedTable::from_path(csv_out),
                    Err(ExtractorError::TimedOut(d)) => {
                        tracing::warn!(
                            "extractor timed out on {} after {:?} (attempt {}/{})",
                            pdf.display(),
                            d,
                            attempt + 1,
                            self.timeouts.len()
                        );
                        last_err = Some(ExtractorError::TimedOut(d));
                        tokio::time::sleep(self.pause).await;
                    }
                    Err(e) => return Err(e),
                }
            }
            Err(last_err.unwrap_or(ExtractorError::TimedOut(Duration::ZERO)))
        }
    }
}

async fn clear_output(csv_out: &Path) -> Result<(), ExtractorError> {
    match tokio::fs::remove_file(csv_out).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(ExtractorError::StaleOutput {
            path: csv_out.to_path_buf(),
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
OrgNm,OrgEml,Donor_Name,Donation_Amt
Friends of Arizona,Phone: 555-0100,Jane Doe,\"$1,000.00\"
Friends of Arizona,Phone: 555-0100,John Roe,NA
";

    #[test]
    fn parses_records_by_header() {
        let table = ExtractedTable::from_reader(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.headers.len(), 4);
        assert_eq!(table.records.len(), 2);
        let first = table.first().unwrap();
        assert_eq!(first.value("Donation_Amt"), "$1,000.00");
        assert_eq!(table.records[1].present("Donation_Amt"), None);
        assert_eq!(first.value("Missing"), "");
    }

    #[test]
    fn header_only_is_valid_zero_row_table() {
        let table = ExtractedTable::from_reader("OrgNm,Donor_Name\n".as_bytes()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.headers, vec!["OrgNm", "Donor_Name"]);
    }

    #[test]
    fn empty_file_is_valid_zero_row_table() {
        let table = ExtractedTable::from_reader("".as_bytes()).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn ragged_rows_are_padded() {
        let table = ExtractedTable::from_reader("a,b,c\n1,2\n".as_bytes()).unwrap();
        assert_eq!(table.records[0].value("c"), "");
    }

    #[test]
    fn missing_output_file() {
        let err = ExtractedTable::from_path(Path::new("/nonexistent/out.csv")).unwrap_err();
        assert!(matches!(err, ExtractorError::MissingOutput(_)));
    }

    #[cfg(unix)]
    mod subprocess {
        use super::*;
        use std::io::Write;

        fn script(body: &str) -> tempfile::NamedTempFile {
            let mut f = tempfile::NamedTempFile::new().unwrap();
            f.write_all(body.as_bytes()).unwrap();
            f
        }

        #[tokio::test]
        async fn successful_run_parses_output() {
            let dir = tempfile::tempdir().unwrap();
            let s = script("printf 'Donor_Name,Donation_Amt\\nJane,10\\n' > \"$2\"\n");
            let ex = RscriptExtractor::new(s.path()).with_program("sh");
            let table = ex
                .extract(&dir.path().join("in.pdf"), &dir.path().join("out.csv"))
                .await
                .unwrap();
            assert_eq!(table.records.len(), 1);
        }

        #[tokio::test]
        async fn nonzero_exit_captures_stderr() {
            let dir = tempfile::tempdir().unwrap();
            let s = script("echo 'no scraper found' >&2\nexit 3\n");
            let ex = RscriptExtractor::new(s.path()).with_program("sh");
            let err = ex
                .extract(&dir.path().join("in.pdf"), &dir.path().join("out.csv"))
                .await
                .unwrap_err();
            match err {
                ExtractorError::Exited { status, stderr } => {
                    assert_eq!(status, 3);
                    assert!(stderr.contains("no scraper found"));
                }
                other => panic!("unexpected error: {:?}", other),
            }
        }

        #[tokio::test]
        async fn timeouts_escalate_then_fail() {
            let dir = tempfile::tempdir().unwrap();
            let s = script("sleep 5\n");
            let ex = RscriptExtractor::new(s.path())
                .with_program("sh")
                .with_timeouts(
                    vec![Duration::from_millis(50), Duration::from_millis(80)],
                    Duration::ZERO,
                );
            let err = ex
                .extract(&dir.path().join("in.pdf"), &dir.path().join("out.csv"))
                .await
                .unwrap_err();
            assert!(matches!(err, ExtractorError::TimedOut(d) if d == Duration::from_millis(80)));
        }

        #[tokio::test]
        async fn success_without_output_is_missing_output() {
            let dir = tempfile::tempdir().unwrap();
            let s = script("exit 0\n");
            let ex = RscriptExtractor::new(s.path()).with_program("sh");
            let err = ex
                .extract(&dir.path().join("in.pdf"), &dir.path().join("out.csv"))
                .await
                .unwrap_err();
            assert!(matches!(err, ExtractorError::MissingOutput(_)));
        }

        #[tokio::test]
        async fn rows_from_a_timed_out_attempt_are_not_reused() {
            let dir = tempfile::tempdir().unwrap();
            // First run writes rows and hangs; the retry exits cleanly without writing.
            let s = script(
                "if [ -f \"$2.ran\" ]; then exit 0; fi\n\
                 touch \"$2.ran\"\n\
                 printf 'Donor_Name,Donation_Amt\\nJane,10\\n' > \"$2\"\n\
                 sleep 5\n",
            );
            let ex = RscriptExtractor::new(s.path())
                .with_program("sh")
                .with_timeouts(
                    vec![Duration::from_millis(500), Duration::from_secs(3)],
                    Duration::ZERO,
                );
            let csv_out = dir.path().join("out.csv");
            let err = ex
                .extract(&dir.path().join("in.pdf"), &csv_out)
                .await
                .unwrap_err();
            assert!(matches!(err, ExtractorError::MissingOutput(_)));
            assert!(dir.path().join("out.csv.ran").exists());
            assert!(!csv_out.exists());
        }
    }
}
