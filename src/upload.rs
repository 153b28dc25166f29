//! The per-row upload loop.
//!
//! A batch runs on one background task. The foreground talks to it only
//! through the event stream, the shared [`BatchProgress`] counters and the
//! cancellation token; the worker never waits on the foreground.

use crate::client::ApiClient;
use crate::config::{ConfigError, UploadConfig, PAYLOAD_PREVIEW_CHARS};
use crate::events::EventSink;
use crate::ingest;
use crate::models::{CreatedItem, FieldMapping, ItemPayload, Row};
use crate::stats::{BatchProgress, ProgressSnapshot, RunState};
use crate::transform::transform;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the rows of a batch come from
#[derive(Debug, Clone)]
pub enum RowSource {
    Rows(Vec<Row>),
    /// Read inside the worker with the configured delimiter
    Csv(PathBuf),
}

/// Result of one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Created { item_id: Option<u64> },
    DryRun,
    /// The server answered with something other than 201
    Rejected { status: u16, body: String },
    /// No usable response (network error, or the row panicked)
    Failed { error: String },
}

impl RowOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RowOutcome::Created { .. } | RowOutcome::DryRun)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    Fatal(String),
}

/// Final counts of one batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchRun {
    pub total: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub outcome: RunOutcome,
}

impl BatchRun {
    fn fatal(reason: String) -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            outcome: RunOutcome::Fatal(reason),
        }
    }

    pub fn attempted(&self) -> u64 {
        self.succeeded + self.failed
    }

    pub fn not_attempted(&self) -> u64 {
        self.total.saturating_sub(self.attempted())
    }
}

/// State shared between the foreground and one batch run
#[derive(Clone, Default)]
pub struct RunControl {
    cancel: CancellationToken,
    progress: Arc<BatchProgress>,
}

impl RunControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes effect at the next row boundary; the row in flight completes.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn progress(&self) -> &BatchProgress {
        &self.progress
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.progress.snapshot()
    }
}

/// Configuration problems that must stop a batch before any row is read.
pub fn validate(mapping: &FieldMapping, config: &UploadConfig) -> Result<(), ConfigError> {
    config.validate()?;
    if mapping.is_empty() {
        return Err(ConfigError::EmptyMapping);
    }
    Ok(())
}

#[derive(Clone)]
pub struct Uploader {
    client: ApiClient,
    sink: EventSink,
}

impl Uploader {
    pub fn new(client: ApiClient, sink: EventSink) -> Self {
        Self { client, sink }
    }

    pub fn sink(&self) -> &EventSink {
        &self.sink
    }

    /// Runs a whole batch on the current task.
    pub async fn run_batch(
        &self,
        source: RowSource,
        mapping: &FieldMapping,
        config: &UploadConfig,
        control: &RunControl,
    ) -> Result<BatchRun, ConfigError> {
        validate(mapping, config)?;
        Ok(self.execute(source, mapping, config, control).await)
    }

    /// Validates, then runs the batch on a background task.
    pub fn spawn(
        &self,
        source: RowSource,
        mapping: FieldMapping,
        config: UploadConfig,
    ) -> Result<UploadHandle, ConfigError> {
        validate(&mapping, &config)?;

        let control = RunControl::new();
        let uploader = self.clone();
        let worker_control = control.clone();
        let task = tokio::spawn(async move {
            uploader
                .execute(source, &mapping, &config, &worker_control)
                .await
        });

        Ok(UploadHandle {
            control,
            sink: self.sink.clone(),
            task,
        })
    }

    /// Builds and (unless dry-run) sends the payload for one row, narrating
    /// each step. Used to check a mapping before committing to a batch.
    pub async fn run_single(
        &self,
        row: &Row,
        mapping: &FieldMapping,
        config: &UploadConfig,
    ) -> RowOutcome {
        self.sink.emit("Testing row payload construction...");
        let payload = transform(row, mapping, config);

        let json = serde_json::to_string(&payload)
            .unwrap_or_else(|e| format!("<payload not serializable: {e}>"));
        self.sink.emit(format!(
            "Payload preview: {}...",
            truncate_chars(&json, PAYLOAD_PREVIEW_CHARS)
        ));

        if config.dry_run {
            self.sink.emit("Dry run: payload looks good");
            return RowOutcome::DryRun;
        }

        self.sink.emit("Sending POST...");
        let outcome = self.send_payload(&payload).await;
        match &outcome {
            RowOutcome::Created { item_id } => self
                .sink
                .emit(format!("Success: created item ID {}", display_id(*item_id))),
            RowOutcome::Rejected { status, body } => {
                self.sink.emit(format!("Failed: HTTP {status} - {body}"))
            }
            RowOutcome::Failed { error } => self.sink.emit(format!("Error: {error}")),
            RowOutcome::DryRun => {}
        }
        outcome
    }

    async fn execute(
        &self,
        source: RowSource,
        mapping: &FieldMapping,
        config: &UploadConfig,
        control: &RunControl,
    ) -> BatchRun {
        let progress = control.progress();
        progress.set_state(RunState::Running);

        let rows = match load_rows(source, config).await {
            Ok(rows) => rows,
            Err(reason) => {
                error!(error = %reason, "Batch aborted before any row was attempted");
                self.sink.emit(format!("Fatal error: {reason}"));
                progress.set_state(RunState::Fatal);
                return BatchRun::fatal(reason);
            }
        };

        let run = self.process_rows(rows, mapping, config, control).await;
        progress.set_state(match run.outcome {
            RunOutcome::Completed => RunState::Completed,
            RunOutcome::Cancelled => RunState::Cancelled,
            RunOutcome::Fatal(_) => RunState::Fatal,
        });
        run
    }

    async fn process_rows(
        &self,
        mut rows: Vec<Row>,
        mapping: &FieldMapping,
        config: &UploadConfig,
        control: &RunControl,
    ) -> BatchRun {
        if config.limit > 0 {
            rows.truncate(config.limit);
        }

        let start = Instant::now();
        let total = rows.len() as u64;
        let progress = control.progress();
        progress.set_total(total);

        let delay = Duration::from_millis(config.delay_ms);
        let mut succeeded = 0u64;
        let mut failed = 0u64;
        let mut cancelled = false;

        info!(
            total,
            dry_run = config.dry_run,
            verified_mapping = mapping.is_verified(),
            "Starting batch"
        );
        if config.dry_run {
            self.sink.emit(format!("Starting batch: {total} items (dry run)"));
        } else {
            self.sink.emit(format!("Starting batch: {total} items"));
        }

        for (i, row) in rows.iter().enumerate() {
            if control.is_cancel_requested() {
                cancelled = true;
                break;
            }

            let n = i + 1;
            let outcome = AssertUnwindSafe(self.process_row(row, mapping, config))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| RowOutcome::Failed {
                    error: format!("unexpected error: {}", panic_message(panic.as_ref())),
                });

            if outcome.is_success() {
                succeeded += 1;
                progress.inc_succeeded();
            } else {
                failed += 1;
                progress.inc_failed();
            }
            debug!(row = n, ?outcome, "Row processed");
            self.sink.emit(describe_row(n, &outcome));

            if n < rows.len() && !delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = control.cancel.cancelled() => {}
                }
            }
        }

        let run = BatchRun {
            total,
            succeeded,
            failed,
            outcome: if cancelled {
                RunOutcome::Cancelled
            } else {
                RunOutcome::Completed
            },
        };

        let elapsed = start.elapsed().as_secs_f64();
        if cancelled {
            warn!(
                succeeded,
                failed,
                skipped = run.not_attempted(),
                duration_secs = elapsed,
                "Batch cancelled"
            );
            self.sink.emit(format!(
                "Batch cancelled: {succeeded} succeeded, {failed} failed, {} not attempted ({total} total)",
                run.not_attempted()
            ));
        } else {
            info!(succeeded, failed, duration_secs = elapsed, "Batch complete");
            self.sink.emit(format!(
                "Batch complete: {succeeded} succeeded, {failed} failed ({total} total)"
            ));
        }

        run
    }

    async fn process_row(
        &self,
        row: &Row,
        mapping: &FieldMapping,
        config: &UploadConfig,
    ) -> RowOutcome {
        #[cfg(test)]
        tests::fail_marked_row(row);

        let payload = transform(row, mapping, config);
        if config.dry_run {
            return RowOutcome::DryRun;
        }
        self.send_payload(&payload).await
    }

    async fn send_payload(&self, payload: &ItemPayload) -> RowOutcome {
        match self.client.post_json("items", payload, &[]).await {
            Ok(response) if response.status == 201 => RowOutcome::Created {
                item_id: response.json::<CreatedItem>().ok().and_then(|item| item.id),
            },
            Ok(response) => RowOutcome::Rejected {
                status: response.status,
                body: response.body,
            },
            Err(e) => RowOutcome::Failed {
                error: e.to_string(),
            },
        }
    }
}

/// Foreground handle to a spawned batch
pub struct UploadHandle {
    control: RunControl,
    sink: EventSink,
    task: JoinHandle<BatchRun>,
}

impl UploadHandle {
    pub fn request_cancel(&self) {
        if !self.control.is_cancel_requested() {
            self.sink.emit("Cancel requested...");
            self.control.request_cancel();
        }
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        self.control.snapshot()
    }

    /// False while the upload is in progress
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the worker. A worker that died still yields a report.
    pub async fn join(self) -> BatchRun {
        match self.task.await {
            Ok(run) => run,
            Err(e) => {
                error!(error = %e, "Upload worker terminated abnormally");
                let progress = self.control.progress();
                progress.set_state(RunState::Fatal);
                self.sink.emit(format!("Fatal error: upload worker failed: {e}"));
                BatchRun {
                    total: progress.total(),
                    succeeded: progress.succeeded(),
                    failed: progress.failed(),
                    outcome: RunOutcome::Fatal(e.to_string()),
                }
            }
        }
    }
}

async fn load_rows(source: RowSource, config: &UploadConfig) -> Result<Vec<Row>, String> {
    match source {
        RowSource::Rows(rows) => Ok(rows),
        RowSource::Csv(path) => {
            let delimiter = config.delimiter;
            tokio::task::spawn_blocking(move || ingest::read_rows(&path, delimiter))
                .await
                .map_err(|e| format!("CSV reader failed: {e}"))?
                .map_err(|e| format!("{e:#}"))
        }
    }
}

fn describe_row(n: usize, outcome: &RowOutcome) -> String {
    match outcome {
        RowOutcome::Created { item_id } => {
            format!("Item {n}: created (ID {})", display_id(*item_id))
        }
        RowOutcome::DryRun => format!("Item {n}: dry run OK"),
        RowOutcome::Rejected { status, .. } => format!("Item {n}: failed (HTTP {status})"),
        RowOutcome::Failed { error } => format!("Item {n}: error: {error}"),
    }
}

fn display_id(id: Option<u64>) -> String {
    id.map_or_else(|| "unknown".to_string(), |id| id.to_string())
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{self, EventStream};
    use crate::models::MappingSource;

    fn uploader() -> (Uploader, EventStream) {
        let (sink, stream) = events::channel();
        // Never contacted in dry-run tests.
        let client = ApiClient::new("http://127.0.0.1:9/api/", "k").unwrap();
        (Uploader::new(client, sink), stream)
    }

    fn dry_config() -> UploadConfig {
        UploadConfig {
            api_base: "http://127.0.0.1:9/api/".to_string(),
            dry_run: true,
            delay_ms: 0,
            ..UploadConfig::default()
        }
    }

    fn rows(n: usize) -> Vec<Row> {
        (0..n)
            .map(|i| [("Title", format!("Item {i}"))].into_iter().collect::<Row>())
            .collect()
    }

    const BROKEN_TITLE: &str = "<broken row>";

    /// Panics inside the loop body for rows titled [`BROKEN_TITLE`].
    pub(super) fn fail_marked_row(row: &Row) {
        if row.get("Title") == Some(BROKEN_TITLE) {
            panic!("row handler crashed");
        }
    }

    #[tokio::test]
    async fn crashing_row_does_not_abort_batch() {
        let (uploader, mut stream) = uploader();
        let mut batch = rows(3);
        batch[1] = [("Title", BROKEN_TITLE)].into_iter().collect();

        let control = RunControl::new();
        let run = uploader
            .run_batch(
                RowSource::Rows(batch),
                &FieldMapping::fallback(),
                &dry_config(),
                &control,
            )
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Completed);
        assert_eq!(run.total, 3);
        assert_eq!(run.succeeded, 2);
        assert_eq!(run.failed, 1);
        assert_eq!(control.snapshot().state, RunState::Completed);

        let messages: Vec<_> = stream.drain().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"Item 1: dry run OK".to_string()));
        assert!(messages
            .contains(&"Item 2: error: unexpected error: row handler crashed".to_string()));
        assert!(messages.contains(&"Item 3: dry run OK".to_string()));
        assert_eq!(
            messages.last().unwrap(),
            "Batch complete: 2 succeeded, 1 failed (3 total)"
        );
    }

    #[test]
    fn panic_payloads_are_described() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let owned: Box<dyn Any + Send> = Box::new(String::from("owned boom"));
        let other: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(literal.as_ref()), "boom");
        assert_eq!(panic_message(owned.as_ref()), "owned boom");
        assert_eq!(panic_message(other.as_ref()), "panic");
    }

    #[tokio::test]
    async fn dry_run_counts_every_row_as_success() {
        let (uploader, mut stream) = uploader();
        let control = RunControl::new();
        let run = uploader
            .run_batch(
                RowSource::Rows(rows(3)),
                &FieldMapping::fallback(),
                &dry_config(),
                &control,
            )
            .await
            .unwrap();

        assert_eq!(run.total, 3);
        assert_eq!(run.succeeded, 3);
        assert_eq!(run.failed, 0);
        assert_eq!(run.outcome, RunOutcome::Completed);
        assert_eq!(control.snapshot().state, RunState::Completed);
        assert_eq!(control.snapshot().percent(), 100.0);

        let messages: Vec<_> = stream.drain().into_iter().map(|e| e.message).collect();
        assert_eq!(messages.first().unwrap(), "Starting batch: 3 items (dry run)");
        assert!(messages.contains(&"Item 2: dry run OK".to_string()));
        assert!(messages.last().unwrap().starts_with("Batch complete"));
    }

    #[tokio::test]
    async fn limit_truncates_rows() {
        let (uploader, _stream) = uploader();
        let config = UploadConfig {
            limit: 2,
            ..dry_config()
        };
        let run = uploader
            .run_batch(
                RowSource::Rows(rows(5)),
                &FieldMapping::fallback(),
                &config,
                &RunControl::new(),
            )
            .await
            .unwrap();
        assert_eq!(run.total, 2);
        assert_eq!(run.succeeded, 2);
    }

    #[tokio::test]
    async fn cancel_before_start_attempts_nothing() {
        let (uploader, mut stream) = uploader();
        let control = RunControl::new();
        control.request_cancel();

        let run = uploader
            .run_batch(
                RowSource::Rows(rows(4)),
                &FieldMapping::fallback(),
                &dry_config(),
                &control,
            )
            .await
            .unwrap();

        assert_eq!(run.outcome, RunOutcome::Cancelled);
        assert_eq!(run.total, 4);
        assert_eq!(run.attempted(), 0);
        assert_eq!(run.not_attempted(), 4);
        let last = stream.drain().pop().unwrap();
        assert!(last.message.starts_with("Batch cancelled"));
    }

    #[tokio::test]
    async fn empty_mapping_is_rejected_up_front() {
        let (uploader, mut stream) = uploader();
        let result = uploader
            .run_batch(
                RowSource::Rows(rows(1)),
                &FieldMapping::new(MappingSource::Remote),
                &dry_config(),
                &RunControl::new(),
            )
            .await;
        assert_eq!(result, Err(ConfigError::EmptyMapping));
        assert!(stream.drain().is_empty());
    }

    #[tokio::test]
    async fn unreadable_csv_is_fatal() {
        let (uploader, mut stream) = uploader();
        let control = RunControl::new();
        let run = uploader
            .run_batch(
                RowSource::Csv(PathBuf::from("/no/such/file.csv")),
                &FieldMapping::fallback(),
                &dry_config(),
                &control,
            )
            .await
            .unwrap();

        assert!(matches!(run.outcome, RunOutcome::Fatal(_)));
        assert_eq!(run.total, 0);
        assert_eq!(control.snapshot().state, RunState::Fatal);
        let messages: Vec<_> = stream.drain().into_iter().map(|e| e.message).collect();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].starts_with("Fatal error"));
    }

    #[tokio::test]
    async fn spawned_run_reports_through_handle() {
        let (uploader, _stream) = uploader();
        let handle = uploader
            .spawn(
                RowSource::Rows(rows(2)),
                FieldMapping::fallback(),
                dry_config(),
            )
            .unwrap();
        let run = handle.join().await;
        assert_eq!(run.succeeded, 2);
        assert_eq!(run.outcome, RunOutcome::Completed);
    }

    #[tokio::test]
    async fn run_single_dry_run_previews_payload() {
        let (uploader, mut stream) = uploader();
        let row: Row = [("Title", "Mask")].into_iter().collect();
        let outcome = uploader
            .run_single(&row, &FieldMapping::fallback(), &dry_config())
            .await;
        assert_eq!(outcome, RowOutcome::DryRun);

        let messages: Vec<_> = stream.drain().into_iter().map(|e| e.message).collect();
        assert!(messages[1].starts_with("Payload preview: {\"public\":true"));
        assert_eq!(messages.last().unwrap(), "Dry run: payload looks good");
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("máscara", 2), "má");
        assert_eq!(truncate_chars("abc", 10), "abc");
    }

    #[test]
    fn row_descriptions() {
        assert_eq!(
            describe_row(3, &RowOutcome::Created { item_id: Some(42) }),
            "Item 3: created (ID 42)"
        );
        assert_eq!(
            describe_row(
                1,
                &RowOutcome::Rejected {
                    status: 422,
                    body: String::new()
                }
            ),
            "Item 1: failed (HTTP 422)"
        );
    }
}
