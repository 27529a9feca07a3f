//! Pipeline orchestrator
//!
//! Drives each dataset through `Pending → Loading → Extracting →
//! Transforming → Aggregating → Done`, or into `Failed(reason)` from any
//! non-terminal state. Datasets of a batch run in parallel on blocking
//! worker threads, bounded by a semaphore, and never affect each other.
//! The unsealed buffer of a dataset lives on the worker's stack for the
//! duration of its run and is zeroized when the run returns, whether it
//! finished, failed or was cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::aggregate::{AggregateResult, Aggregator, Rollup};
use crate::config::{PipelineConfig, VaultConfig};
use crate::error::{FailureReason, Result, VaultError};
use crate::extract::{ExtractStats, Extractor};
use crate::metrics::MetricsCollector;
use crate::model::{QuarantinedRow, RowOutcome};
use crate::store::SealedStore;
use crate::transform::Transformer;

/// Processing state of one dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum DatasetState {
    Pending,
    Loading,
    Extracting,
    Transforming,
    Aggregating,
    Done,
    Failed(FailureReason),
}

impl DatasetState {
    pub fn name(&self) -> &'static str {
        match self {
            DatasetState::Pending => "pending",
            DatasetState::Loading => "loading",
            DatasetState::Extracting => "extracting",
            DatasetState::Transforming => "transforming",
            DatasetState::Aggregating => "aggregating",
            DatasetState::Done => "done",
            DatasetState::Failed(_) => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DatasetState::Done | DatasetState::Failed(_))
    }
}

/// A state entered during a run, with its offset from the run start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub state: DatasetState,
    pub at_ms: u64,
}

/// A fatal error as reported outward: stage, classification and message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportedError {
    pub stage: String,
    pub reason: FailureReason,
    pub message: String,
}

/// Row accounting and errors of one dataset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingReport {
    pub dataset_id: String,
    pub rows_read: u64,
    pub validated: u64,
    pub quarantined: u64,
    pub transformed: u64,
    pub deduplicated_count: u64,
    pub negative_margin_rows: u64,
    pub zero_price_rows: u64,
    pub quarantine_by_reason: BTreeMap<String, u64>,
    pub quarantine: Vec<QuarantinedRow>,
    pub errors: Vec<ReportedError>,
}

impl ProcessingReport {
    fn new(dataset_id: &str) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            ..Self::default()
        }
    }

    fn record_extraction(&mut self, stats: ExtractStats) {
        self.rows_read = stats.rows_read;
        self.validated = stats.valid;
        self.quarantined = stats.quarantined;
    }

    fn quarantine_row(&mut self, row: QuarantinedRow) {
        *self.quarantine_by_reason.entry(row.reason.label()).or_insert(0) += 1;
        self.quarantine.push(row);
    }
}

/// Final state of one dataset run
#[derive(Debug, Clone, Serialize)]
pub struct DatasetOutcome {
    pub dataset_id: String,
    pub state: DatasetState,
    pub history: Vec<StageRecord>,
    pub report: ProcessingReport,

    /// Present only when `state` is `Done`
    pub result: Option<AggregateResult>,
    pub duration_ms: u64,

    #[serde(skip)]
    rollup: Option<Rollup>,
}

impl DatasetOutcome {
    pub fn is_done(&self) -> bool {
        self.state == DatasetState::Done
    }

    pub fn failure_reason(&self) -> Option<&FailureReason> {
        match &self.state {
            DatasetState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    /// Mergeable partial aggregate, present only when `Done`
    pub fn rollup(&self) -> Option<&Rollup> {
        self.rollup.as_ref()
    }

    /// Outcome of a worker that never reported back
    fn aborted(dataset_id: &str, reason: FailureReason, message: String) -> Self {
        let mut report = ProcessingReport::new(dataset_id);
        report.errors.push(ReportedError {
            stage: DatasetState::Pending.name().to_string(),
            reason: reason.clone(),
            message,
        });

        let state = DatasetState::Failed(reason);
        Self {
            dataset_id: dataset_id.to_string(),
            history: vec![
                StageRecord { state: DatasetState::Pending, at_ms: 0 },
                StageRecord { state: state.clone(), at_ms: 0 },
            ],
            state,
            report,
            result: None,
            duration_ms: 0,
            rollup: None,
        }
    }
}

/// Outcome of a batch run
#[derive(Debug, Clone, Serialize)]
pub struct BatchOutcome {
    pub batch_id: Uuid,

    /// Sorted by dataset id
    pub outcomes: Vec<DatasetOutcome>,

    /// Merge of the `Done` datasets, absent when none finished
    pub combined: Option<AggregateResult>,
    pub duration_ms: u64,
}

impl BatchOutcome {
    pub fn outcome(&self, dataset_id: &str) -> Option<&DatasetOutcome> {
        self.outcomes.iter().find(|o| o.dataset_id == dataset_id)
    }

    pub fn done_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_done()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.done_count()
    }
}

/// Mutable bookkeeping of one run
struct DatasetRun {
    state: DatasetState,
    history: Vec<StageRecord>,
    report: ProcessingReport,
    started: Instant,
}

impl DatasetRun {
    fn new(dataset_id: &str) -> Self {
        Self {
            state: DatasetState::Pending,
            history: vec![StageRecord { state: DatasetState::Pending, at_ms: 0 }],
            report: ProcessingReport::new(dataset_id),
            started: Instant::now(),
        }
    }

    fn elapsed_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    fn advance(&mut self, next: DatasetState) {
        tracing::debug!(from = self.state.name(), to = next.name(), "Stage transition");
        self.history.push(StageRecord { state: next.clone(), at_ms: self.elapsed_ms() });
        self.state = next;
    }
}

/// Sequences store, extractor, transformer and aggregator per dataset
#[derive(Clone)]
pub struct PipelineOrchestrator {
    store: Arc<SealedStore>,
    extractor: Extractor,
    transformer: Transformer,
    aggregator: Aggregator,
    config: PipelineConfig,
    metrics: Option<Arc<MetricsCollector>>,

    /// Called with the index of every row after it is handled
    #[cfg(test)]
    row_hook: Option<Arc<dyn Fn(usize) + Send + Sync>>,
}

impl PipelineOrchestrator {
    pub fn new(store: Arc<SealedStore>, config: &VaultConfig) -> Self {
        Self {
            store,
            extractor: Extractor::new(config.extraction.clone()),
            transformer: Transformer::new(config.transform.clone()),
            aggregator: Aggregator::new(&config.aggregation, &config.transform),
            config: config.pipeline.clone(),
            metrics: None,
            #[cfg(test)]
            row_hook: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn store(&self) -> &Arc<SealedStore> {
        &self.store
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Run one dataset to a terminal state on the calling thread
    pub fn run_dataset(&self, dataset_id: &str, cancel: &CancellationToken) -> DatasetOutcome {
        self.process(dataset_id, Uuid::new_v4(), cancel)
    }

    /// Run every sealed dataset
    pub async fn run_all(&self, cancel: CancellationToken) -> Result<BatchOutcome> {
        let dataset_ids = self.store.list_datasets()?;
        Ok(self.run_batch(&dataset_ids, cancel).await)
    }

    /// Run datasets in parallel, at most `max_workers` at a time
    pub async fn run_batch(&self, dataset_ids: &[String], cancel: CancellationToken) -> BatchOutcome {
        let batch_id = Uuid::new_v4();
        let started = Instant::now();

        let mut ids: Vec<String> = dataset_ids.to_vec();
        ids.sort();
        ids.dedup();

        tracing::info!(%batch_id, datasets = ids.len(), workers = self.config.max_workers, "Starting batch");

        let semaphore = Arc::new(Semaphore::new(self.config.max_workers.max(1)));
        let mut handles = Vec::with_capacity(ids.len());

        for dataset_id in &ids {
            let pipeline = self.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let id = dataset_id.clone();

            let handle = tokio::spawn(async move {
                let permit = semaphore.acquire_owned().await;
                tokio::task::spawn_blocking(move || {
                    let _permit = permit;
                    pipeline.process(&id, batch_id, &cancel)
                })
                .await
            });
            handles.push((dataset_id.clone(), handle));
        }

        let mut outcomes = Vec::with_capacity(handles.len());
        for (dataset_id, handle) in handles {
            let outcome = match handle.await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) | Err(e) => {
                    tracing::error!(dataset = %dataset_id, %batch_id, "Dataset worker aborted: {}", e);
                    DatasetOutcome::aborted(&dataset_id, FailureReason::Internal, "worker aborted".to_string())
                }
            };
            outcomes.push(outcome);
        }

        let combined = self.combine(&outcomes);
        let batch = BatchOutcome {
            batch_id,
            outcomes,
            combined,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            %batch_id,
            done = batch.done_count(),
            failed = batch.failed_count(),
            duration_ms = batch.duration_ms,
            "Batch finished"
        );
        batch
    }

    /// Merge the rollups of `Done` outcomes in dataset-id order
    pub fn combine(&self, outcomes: &[DatasetOutcome]) -> Option<AggregateResult> {
        let mut done: Vec<&DatasetOutcome> = outcomes.iter().filter(|o| o.is_done()).collect();
        if done.is_empty() {
            return None;
        }
        done.sort_by(|a, b| a.dataset_id.cmp(&b.dataset_id));
        Some(self.aggregator.combine(done.into_iter().filter_map(|o| o.rollup())))
    }

    fn process(&self, dataset_id: &str, batch_id: Uuid, cancel: &CancellationToken) -> DatasetOutcome {
        let span = tracing::info_span!("dataset", dataset = %dataset_id, %batch_id);
        let _entered = span.enter();

        let mut run = DatasetRun::new(dataset_id);
        let executed = self.execute(dataset_id, &mut run, cancel);
        let duration = run.started.elapsed();

        let (result, rollup) = match executed {
            Ok((result, rollup)) => {
                run.advance(DatasetState::Done);
                tracing::info!(
                    rows = run.report.rows_read,
                    quarantined = run.report.quarantined,
                    transformed = run.report.transformed,
                    "Dataset done"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_dataset_done(
                        duration,
                        run.report.rows_read,
                        run.report.quarantined,
                        run.report.deduplicated_count,
                    );
                }
                (Some(result), Some(rollup))
            }
            Err(error) => {
                let reason = error.failure_reason();
                let stage = run.state.name();
                if reason == FailureReason::Cancelled {
                    tracing::warn!(stage, "Dataset cancelled");
                } else {
                    tracing::error!(stage, reason = %reason, fatal = error.is_fatal(), "Dataset failed: {}", error);
                }

                run.report.errors.push(ReportedError {
                    stage: stage.to_string(),
                    reason: reason.clone(),
                    message: error.to_string(),
                });
                if let Some(metrics) = &self.metrics {
                    metrics.record_dataset_failed(&reason, duration);
                }
                run.advance(DatasetState::Failed(reason));
                (None, None)
            }
        };

        DatasetOutcome {
            dataset_id: dataset_id.to_string(),
            state: run.state,
            history: run.history,
            report: run.report,
            result,
            duration_ms: duration.as_millis() as u64,
            rollup,
        }
    }

    fn execute(
        &self,
        dataset_id: &str,
        run: &mut DatasetRun,
        cancel: &CancellationToken,
    ) -> Result<(AggregateResult, Rollup)> {
        check_cancelled(cancel)?;
        run.advance(DatasetState::Loading);
        let buffer = self.store.load(dataset_id)?;

        check_cancelled(cancel)?;
        run.advance(DatasetState::Extracting);
        let mut stream = self.extractor.parse(&buffer)?;

        let check_every = self.config.cancel_check_rows.max(1);
        let mut validated = Vec::new();
        let mut index = 0usize;
        loop {
            if index % check_every == 0 && cancel.is_cancelled() {
                run.report.record_extraction(stream.stats());
                return Err(VaultError::Cancelled);
            }
            let Some(outcome) = stream.next() else { break };
            match outcome {
                RowOutcome::Valid(record) => validated.push(record),
                RowOutcome::Quarantined(row) => run.report.quarantine_row(row),
            }

            #[cfg(test)]
            {
                if let Some(hook) = &self.row_hook {
                    hook(index);
                }
            }
            index += 1;
        }

        run.report.record_extraction(stream.stats());
        drop(stream);
        drop(buffer);

        if run.report.quarantined > 0 {
            tracing::warn!(
                quarantined = run.report.quarantined,
                reasons = ?run.report.quarantine_by_reason,
                "Rows quarantined"
            );
        }

        check_cancelled(cancel)?;
        run.advance(DatasetState::Transforming);
        let output = self.transformer.transform(dataset_id, validated);
        run.report.transformed = output.records.len() as u64;
        run.report.deduplicated_count = output.stats.duplicates_collapsed;
        run.report.negative_margin_rows = output.stats.negative_margin_rows;
        run.report.zero_price_rows = output.stats.zero_price_rows;

        check_cancelled(cancel)?;
        run.advance(DatasetState::Aggregating);
        let rollup = Rollup::from_records(&output.records);
        let result = self.aggregator.finalize(&rollup);

        Ok((result, rollup))
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(VaultError::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::key_provider::{EncryptionKey, KeyProvider};
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"sku;description;category;lab;quantity;unit_cost;unit_price;date\n\
A1;Ibuprofeno;ANALG;BAGO;10;5;8;2024-01-15\n\
A2;Paracetamol;ANALG;BAGO;0;3;3;2024-01-15\n\
A1;Ibuprofeno;ANALG;BAGO;10;5;8;2024-01-15\n";

    fn create_store(temp_dir: &TempDir, key_byte: u8) -> Arc<SealedStore> {
        let config = StorageConfig {
            sealed_dir: temp_dir.path().to_path_buf(),
            extension: "enc".to_string(),
        };
        let keys = Arc::new(KeyProvider::with_key(EncryptionKey::from_bytes(&[key_byte; 32]).unwrap()));
        Arc::new(SealedStore::new(config, keys).unwrap())
    }

    fn create_pipeline(store: Arc<SealedStore>) -> PipelineOrchestrator {
        let mut config = VaultConfig::default();
        config.pipeline.max_workers = 2;
        PipelineOrchestrator::new(store, &config)
    }

    #[test]
    fn test_run_dataset_end_to_end() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir, 1);
        store.store("enero", PAYLOAD).unwrap();

        let outcome = create_pipeline(store).run_dataset("enero", &CancellationToken::new());

        assert_eq!(outcome.state, DatasetState::Done);
        assert_eq!(outcome.result.as_ref().unwrap().kpi("revenue"), Some(80.0));
        assert_eq!(outcome.report.rows_read, 3);
        assert_eq!(outcome.report.quarantined, 1);
        assert_eq!(outcome.report.deduplicated_count, 1);
        assert_eq!(outcome.report.transformed, 1);
        assert_eq!(outcome.report.quarantine_by_reason.get("zero_quantity"), Some(&1));

        let states: Vec<&str> = outcome.history.iter().map(|s| s.state.name()).collect();
        assert_eq!(states, vec!["pending", "loading", "extracting", "transforming", "aggregating", "done"]);
    }

    #[test]
    fn test_missing_dataset_fails() {
        let temp_dir = TempDir::new().unwrap();
        let outcome = create_pipeline(create_store(&temp_dir, 1)).run_dataset("marzo", &CancellationToken::new());

        assert_eq!(outcome.state, DatasetState::Failed(FailureReason::DatasetNotFound));
        assert!(outcome.result.is_none());
        assert!(outcome.rollup().is_none());
        assert_eq!(outcome.report.errors[0].stage, "loading");
    }

    #[test]
    fn test_schema_invalid_produces_no_result() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir, 1);
        store
            .store("abril", b"sku;description;category;lab;quantity;unit_cost;date\nA1;x;c;l;1;2;2024-04-01\n")
            .unwrap();

        let outcome = create_pipeline(store).run_dataset("abril", &CancellationToken::new());
        assert_eq!(outcome.state, DatasetState::Failed(FailureReason::SchemaInvalid));
        assert_eq!(outcome.report.errors[0].stage, "extracting");
        assert!(outcome.result.is_none());
    }

    #[tokio::test]
    async fn test_batch_isolates_failures() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir, 1);
        store.store("enero", PAYLOAD).unwrap();
        store.store("marzo", PAYLOAD).unwrap();
        create_store(&temp_dir, 2).store("febrero", PAYLOAD).unwrap();

        let metrics = Arc::new(MetricsCollector::new().unwrap());
        let pipeline = create_pipeline(store).with_metrics(metrics.clone());
        let batch = pipeline.run_all(CancellationToken::new()).await.unwrap();

        let ids: Vec<&str> = batch.outcomes.iter().map(|o| o.dataset_id.as_str()).collect();
        assert_eq!(ids, vec!["enero", "febrero", "marzo"]);
        assert!(batch.outcome("enero").unwrap().is_done());
        assert!(batch.outcome("marzo").unwrap().is_done());
        assert_eq!(
            batch.outcome("febrero").unwrap().failure_reason(),
            Some(&FailureReason::AuthenticationFailed)
        );

        let combined = batch.combined.unwrap();
        assert_eq!(combined.kpi("revenue"), Some(160.0));
        assert_eq!(combined.kpi("unique_products"), Some(1.0));

        let stats = metrics.get_stats();
        assert_eq!(stats.datasets_done, 2);
        assert_eq!(stats.authentication_failures, 1);
    }

    #[tokio::test]
    async fn test_cancelled_batch() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir, 1);
        store.store("enero", PAYLOAD).unwrap();
        store.store("febrero", PAYLOAD).unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let batch = create_pipeline(store)
            .run_batch(&["febrero".to_string(), "enero".to_string()], cancel)
            .await;

        assert_eq!(batch.failed_count(), 2);
        assert!(batch.combined.is_none());
        for outcome in &batch.outcomes {
            assert_eq!(outcome.state, DatasetState::Failed(FailureReason::Cancelled));
            assert!(outcome.result.is_none());
        }
    }

    #[test]
    fn test_cancel_during_extraction() {
        let temp_dir = TempDir::new().unwrap();
        let store = create_store(&temp_dir, 1);

        let mut payload = String::from("sku;description;category;lab;quantity;unit_cost;unit_price;date\n");
        for i in 0..20 {
            payload.push_str(&format!("P{};Producto;ANALG;BAGO;{};5;8;2024-01-15\n", i, i + 1));
        }
        store.store("enero", payload.as_bytes()).unwrap();

        let mut config = VaultConfig::default();
        config.pipeline.cancel_check_rows = 1;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let mut pipeline = PipelineOrchestrator::new(store, &config);
        pipeline.row_hook = Some(Arc::new(move |index: usize| {
            if index == 4 {
                trigger.cancel();
            }
        }));

        let outcome = pipeline.run_dataset("enero", &cancel);

        assert_eq!(outcome.state, DatasetState::Failed(FailureReason::Cancelled));
        assert!(outcome.result.is_none());
        assert!(outcome.rollup().is_none());
        assert_eq!(outcome.report.rows_read, 5);
        assert_eq!(outcome.report.validated, 5);
        assert_eq!(outcome.report.errors[0].stage, "extracting");

        let states: Vec<&str> = outcome.history.iter().map(|s| s.state.name()).collect();
        assert_eq!(states, vec!["pending", "loading", "extracting", "failed"]);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&DatasetState::Failed(FailureReason::Cancelled)).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"cancelled"}"#);
        assert_eq!(serde_json::to_string(&DatasetState::Done).unwrap(), r#"{"state":"done"}"#);
        assert!(DatasetState::Done.is_terminal());
        assert!(!DatasetState::Loading.is_terminal());
    }
}
