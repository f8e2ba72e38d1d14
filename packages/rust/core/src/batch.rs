//! Batch runner: split pending rows across workers, checkpoint the output,
//! and summarise the run.
//!
//! Each worker owns one [`Resolver`] (and so its own browser session) and
//! works through a contiguous slice of rows sequentially. Workers share only
//! the progress counter, the checkpoint writer, and the postal cache handle.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};

use recordfill_cache::PostalCache;
use recordfill_shared::{
    ColumnsConfig, FieldKind, Provenance, RecordStatus, RecordfillError, ResolvedRecord,
    ResolverConfig, Result,
};

use crate::resolver::{Resolver, Sources};
use crate::table::{CheckpointWriter, InputRow, OutputLayout, read_done_hashes, read_input};

/// Builds the clients for one worker.
pub trait SourceFactory: Send + Sync {
    fn sources(&self, worker: usize) -> Result<Sources>;
}

impl<F> SourceFactory for F
where
    F: Fn(usize) -> Result<Sources> + Send + Sync,
{
    fn sources(&self, worker: usize) -> Result<Sources> {
        self(worker)
    }
}

/// Progress callback for reporting batch status.
pub trait BatchProgress: Send + Sync {
    /// Called once rows are loaded and resumed rows are known.
    fn started(&self, pending: usize, skipped: usize);
    /// Called after each record is written.
    fn record_done(&self, record: &ResolvedRecord, done: usize, total: usize);
    /// Called when the batch completes.
    fn finished(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn started(&self, _pending: usize, _skipped: usize) {}
    fn record_done(&self, _record: &ResolvedRecord, _done: usize, _total: usize) {}
    fn finished(&self, _summary: &RunSummary) {}
}

/// Totals for one run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: usize,
    /// Rows already present in the output from an earlier run.
    pub skipped: usize,
    /// Records that ended in a per-record failure.
    pub fatal: usize,
    pub by_status: BTreeMap<&'static str, usize>,
    /// Attributes filled by the pipeline (input values not counted).
    pub per_field: BTreeMap<FieldKind, usize>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn record(&mut self, record: &ResolvedRecord) {
        self.processed += 1;
        if record.status == RecordStatus::Failed {
            self.fatal += 1;
        }
        *self.by_status.entry(record.status.as_str()).or_default() += 1;
        for field in FieldKind::RESOLVABLE {
            if record
                .get(field)
                .is_some_and(|r| r.provenance != Provenance::Input)
            {
                *self.per_field.entry(field).or_default() += 1;
            }
        }
    }

    fn merge(&mut self, other: RunSummary) {
        self.processed += other.processed;
        self.fatal += other.fatal;
        for (status, n) in other.by_status {
            *self.by_status.entry(status).or_default() += n;
        }
        for (field, n) in other.per_field {
            *self.per_field.entry(field).or_default() += n;
        }
    }
}

/// State shared by all workers of one run.
struct Shared {
    writer: Mutex<CheckpointWriter>,
    layout: OutputLayout,
    cache: PostalCache,
    done: AtomicUsize,
    total: usize,
    progress: Arc<dyn BatchProgress>,
}

/// Resolve every pending row of `input` into `output`.
///
/// Rows whose hash is already in `output` are skipped. Per-record failures
/// are written as `failed` rows; only output or cache I/O errors end the run.
#[instrument(skip_all, fields(input = %input.display(), output = %output.display()))]
pub async fn run_batch(
    config: &ResolverConfig,
    columns: &ColumnsConfig,
    input: &Path,
    output: &Path,
    cache: PostalCache,
    factory: &dyn SourceFactory,
    progress: Arc<dyn BatchProgress>,
) -> Result<RunSummary> {
    let start = Instant::now();

    // --- Phase 1: Load and resume ---
    let table = read_input(input, columns)?;
    let done = read_done_hashes(output, columns)?;
    let layout = OutputLayout::new(&table.headers, columns);
    let total_rows = table.rows.len();
    let pending: Vec<InputRow> = table
        .rows
        .into_iter()
        .filter(|row| !done.contains(&row.hash))
        .collect();
    let skipped = total_rows - pending.len();
    info!(rows = total_rows, pending = pending.len(), skipped, "input loaded");
    progress.started(pending.len(), skipped);

    let writer = CheckpointWriter::open(output, &layout, config.checkpoint_every)?;
    let shared = Arc::new(Shared {
        writer: Mutex::new(writer),
        layout,
        cache: cache.clone(),
        done: AtomicUsize::new(0),
        total: pending.len(),
        progress: progress.clone(),
    });

    // --- Phase 2: Workers ---
    let workers = config.workers.max(1).min(pending.len().max(1));
    let chunk = pending.len().div_ceil(workers).max(1);
    let mut handles = Vec::with_capacity(workers);
    for (worker, rows) in pending.chunks(chunk).enumerate() {
        let resolver = Resolver::new(config.clone(), factory.sources(worker)?, cache.clone());
        let rows = rows.to_vec();
        let shared = shared.clone();
        handles.push(tokio::spawn(async move {
            run_worker(worker, resolver, rows, shared).await
        }));
    }

    let mut summary = RunSummary::default();
    let mut first_error = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(part)) => summary.merge(part),
            Ok(Err(e)) => {
                error!(error = %e, "worker stopped");
                first_error = first_error.or(Some(e));
            }
            Err(e) => {
                error!(error = %e, "worker task failed");
                first_error =
                    first_error.or(Some(RecordfillError::RecordFatal(e.to_string())));
            }
        }
    }

    // --- Phase 3: Final checkpoint ---
    shared.writer.lock().await.flush()?;
    cache.save().await?;
    if let Some(e) = first_error {
        return Err(e);
    }

    summary.skipped = skipped;
    summary.elapsed = start.elapsed();
    info!(
        processed = summary.processed,
        skipped = summary.skipped,
        fatal = summary.fatal,
        elapsed_ms = summary.elapsed.as_millis() as u64,
        "batch complete"
    );
    progress.finished(&summary);
    Ok(summary)
}

async fn run_worker(
    worker: usize,
    resolver: Resolver,
    rows: Vec<InputRow>,
    shared: Arc<Shared>,
) -> Result<RunSummary> {
    let mut summary = RunSummary::default();
    let result = process_rows(worker, &resolver, &rows, &shared, &mut summary).await;
    resolver.release().await;
    result.map(|()| summary)
}

async fn process_rows(
    worker: usize,
    resolver: &Resolver,
    rows: &[InputRow],
    shared: &Shared,
    summary: &mut RunSummary,
) -> Result<()> {
    for row in rows {
        let mut draft = ResolvedRecord::new(row.record.clone());
        let outcome = AssertUnwindSafe(resolver.resolve_into(&mut draft))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) if is_fatal_to_run(&e) => return Err(e),
            Ok(Err(e)) => {
                warn!(worker, row = row.record.row, error = %e, "record failed");
                draft.status = RecordStatus::Failed;
                resolver.release().await;
            }
            Err(_) => {
                warn!(worker, row = row.record.row, "record panicked, keeping partial result");
                draft.status = RecordStatus::Failed;
                resolver.release().await;
            }
        }

        {
            let mut writer = shared.writer.lock().await;
            let checkpointed = writer.write(&shared.layout.row(&draft, row))?;
            if checkpointed {
                shared.cache.save().await?;
                info!(written = writer.written(), "checkpoint");
            }
        }

        summary.record(&draft);
        let done = shared.done.fetch_add(1, Ordering::SeqCst) + 1;
        shared.progress.record_done(&draft, done, shared.total);
    }
    Ok(())
}

/// Output and cache failures stop the run; anything else stays with the record.
fn is_fatal_to_run(e: &RecordfillError) -> bool {
    matches!(
        e,
        RecordfillError::Cache(_) | RecordfillError::Io { .. } | RecordfillError::Table(_)
    )
}
