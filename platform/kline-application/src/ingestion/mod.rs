use crate::quality::QualityRegistry;
use crate::scheduler::{FetchScheduler, FetchedBatch, SchedulerEvent, SchedulerOutcome};
use chrono::Utc;
use kline_domain::errors::StoreError;
use kline_domain::repositories::artifacts::ReportWriter;
use kline_domain::repositories::candle_store::{AppendOutcome, CandleStore};
use kline_domain::repositories::dead_letter::DeadLetterSink;
use kline_domain::repositories::derived_store::DerivedCandleStore;
use kline_domain::services::normalizer::normalize_batch;
use kline_domain::services::resampler::{resample, resample_derived};
use kline_domain::services::validator::{validate_derived, validate_series, VenueProfile};
use kline_domain::services::window_plan::{last_closed_open, plan_windows};
use kline_domain::value_objects::candle::{Candle, DerivedCandle};
use kline_domain::value_objects::fetch_window::{DeadLetter, FetchWindow};
use kline_domain::value_objects::quality_report::{QualityReport, Severity};
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::{SeriesKey, TimeSeries};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

const EVENT_BUFFER: usize = 64;
const DEFAULT_WINDOW_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub run_id: String,
    pub keys: Vec<SeriesKey>,
    pub start: i64,
    pub end: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConflictRecord {
    pub key: SeriesKey,
    pub open_time: i64,
    pub existing: Candle,
    pub incoming: Candle,
}

#[derive(Debug, Default, Clone)]
pub struct IngestOutcome {
    pub windows_planned: usize,
    pub scheduler: SchedulerOutcome,
    pub records_fetched: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub out_of_order: usize,
    pub schema_rejects: usize,
    pub still_open: usize,
    pub backend_errors: usize,
    pub conflicts: Vec<ConflictRecord>,
    pub halted_keys: Vec<SeriesKey>,
    pub reports: Vec<Arc<QualityReport>>,
}

impl IngestOutcome {
    pub fn dead_letters(&self) -> &[DeadLetter] {
        &self.scheduler.dead_letters
    }

    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "windows": {
                "planned": self.windows_planned,
                "completed": self.scheduler.completed,
                "rate_limited": self.scheduler.rate_limited,
                "retried": self.scheduler.retried,
                "dead_lettered": self.scheduler.dead_letters.len(),
                "abandoned": self.scheduler.abandoned.len(),
            },
            "records": {
                "fetched": self.records_fetched,
                "inserted": self.inserted,
                "duplicates": self.duplicates,
                "out_of_order": self.out_of_order,
                "schema_rejects": self.schema_rejects,
                "still_open": self.still_open,
                "backend_errors": self.backend_errors,
            },
            "conflicts": self.conflicts,
            "halted_keys": self.halted_keys.iter().map(|k| k.to_string()).collect::<Vec<_>>(),
            "reports": self.reports.iter().map(|r| serde_json::json!({
                "key": r.key.to_string(),
                "severity": r.severity,
                "rows": r.rows,
                "gaps": r.gaps.len(),
                "missing_buckets": r.missing_buckets,
                "duplicates": r.duplicates.len(),
                "outliers": r.outliers.len(),
                "partial_buckets": r.partial_buckets.len(),
            })).collect::<Vec<_>>(),
        })
    }
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Drives scheduler → normalizer → store → resampler → validator for a run.
/// The sink loop is the only writer of base candles. Only closed buckets are
/// planned or stored; "closed" is judged against `clock` (epoch seconds).
pub struct IngestionPipeline {
    store: Arc<dyn CandleStore>,
    derived: Arc<dyn DerivedCandleStore>,
    quality: Arc<QualityRegistry>,
    dead_letters: Arc<dyn DeadLetterSink>,
    derived_resolutions: Vec<Resolution>,
    artifacts: Option<(Arc<dyn ReportWriter>, PathBuf)>,
    clock: Clock,
}

impl IngestionPipeline {
    pub fn new(
        store: Arc<dyn CandleStore>,
        derived: Arc<dyn DerivedCandleStore>,
        quality: Arc<QualityRegistry>,
        dead_letters: Arc<dyn DeadLetterSink>,
        derived_resolutions: Vec<Resolution>,
    ) -> Self {
        let mut derived_resolutions = derived_resolutions;
        derived_resolutions.sort_by_key(|r| r.seconds());
        derived_resolutions.dedup();
        Self {
            store,
            derived,
            quality,
            dead_letters,
            derived_resolutions,
            artifacts: None,
            clock: Arc::new(|| Utc::now().timestamp()),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Every published report is also written under `dir`.
    pub fn with_artifacts(mut self, writer: Arc<dyn ReportWriter>, dir: PathBuf) -> Self {
        self.artifacts = Some((writer, dir));
        self
    }

    /// Requested range clipped to the last closed bucket of the coarsest base key.
    pub fn effective_end(&self, request: &IngestRequest) -> i64 {
        let now = (self.clock)();
        request
            .keys
            .iter()
            .map(|key| last_closed_open(key.resolution, now))
            .fold(request.end, i64::min)
    }

    pub fn plan(&self, request: &IngestRequest, scheduler: &FetchScheduler) -> Vec<FetchWindow> {
        let now = (self.clock)();
        let mut windows = Vec::new();
        let mut next_id = 1u64;
        for key in &request.keys {
            let limit = scheduler
                .adapter(key.exchange)
                .map(|adapter| adapter.max_candles_per_request())
                .unwrap_or(DEFAULT_WINDOW_LIMIT);
            let end = request.end.min(last_closed_open(key.resolution, now));
            if end < request.end {
                info!(key = %key, requested_end = request.end, end, "range clipped to closed buckets");
            }
            let planned = plan_windows(key, request.start, end, limit, next_id);
            next_id += planned.len() as u64;
            windows.extend(planned);
        }
        windows
    }

    pub async fn run(
        &self,
        request: &IngestRequest,
        scheduler: &FetchScheduler,
        cancel: CancellationToken,
    ) -> IngestOutcome {
        let span = info_span!(
            "ingest",
            run_id = %request.run_id,
            keys = request.keys.len(),
            start = request.start,
            end = request.end
        );
        let windows = self.plan(request, scheduler);
        let end = self.effective_end(request);
        self.execute(windows, (request.start, end), scheduler, cancel)
            .instrument(span)
            .await
    }

    /// Re-runs dead-lettered windows with a fresh retry budget. Letters whose windows
    /// were attempted are removed from the sink; new failures are recorded again.
    pub async fn replay(
        &self,
        letters: Vec<DeadLetter>,
        scheduler: &FetchScheduler,
        cancel: CancellationToken,
    ) -> IngestOutcome {
        if letters.is_empty() {
            return IngestOutcome::default();
        }
        let next_id = letters.iter().map(|l| l.window.id).max().unwrap_or(0) + 1;
        let windows: Vec<FetchWindow> = letters
            .iter()
            .enumerate()
            .map(|(offset, letter)| letter.window.revived(next_id + offset as u64))
            .collect();
        let start = windows.iter().map(|w| w.start_time).min().unwrap_or(0);
        let end = windows.iter().map(|w| w.end_time).max().unwrap_or(0);

        let outcome = self
            .execute(windows, (start, end), scheduler, cancel)
            .instrument(info_span!("replay", letters = letters.len()))
            .await;

        let abandoned: BTreeSet<u64> = outcome.scheduler.abandoned.iter().map(|w| w.id).collect();
        let settled: Vec<DeadLetter> = letters
            .into_iter()
            .enumerate()
            .filter(|(offset, _)| !abandoned.contains(&(next_id + *offset as u64)))
            .map(|(_, letter)| letter)
            .collect();
        match self.dead_letters.remove(&settled) {
            Ok(removed) => info!(removed, "replayed dead letters cleared"),
            Err(err) => error!(error = %err, "failed to clear replayed dead letters"),
        }
        outcome
    }

    /// Recomputes derived series and reports for stored data without fetching.
    pub async fn revalidate(&self, keys: &[SeriesKey], start: i64, end: i64) -> IngestOutcome {
        let mut outcome = IngestOutcome::default();
        for key in keys {
            self.process_key(key, start, end, &mut outcome).await;
        }
        outcome
    }

    async fn execute(
        &self,
        windows: Vec<FetchWindow>,
        range: (i64, i64),
        scheduler: &FetchScheduler,
        cancel: CancellationToken,
    ) -> IngestOutcome {
        let mut outcome = IngestOutcome {
            windows_planned: windows.len(),
            ..IngestOutcome::default()
        };
        let all_keys: BTreeSet<SeriesKey> = windows.iter().map(|w| w.key.clone()).collect();
        info!(windows = windows.len(), keys = all_keys.len(), "fetch plan ready");

        let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
        let fetch = scheduler.run(windows, tx, cancel);
        let sink = async {
            let mut processed = BTreeSet::new();
            while let Some(event) = rx.recv().await {
                match event {
                    SchedulerEvent::Batch(batch) => self.ingest_batch(batch, &mut outcome).await,
                    SchedulerEvent::DeadLettered(letter) => {
                        if let Err(err) = self.dead_letters.record(&letter) {
                            error!(window = letter.window.id, error = %err, "failed to persist dead letter");
                        }
                    }
                    SchedulerEvent::KeyDrained(key) => {
                        self.process_key(&key, range.0, range.1, &mut outcome).await;
                        processed.insert(key);
                    }
                }
            }
            processed
        };
        let (scheduler_outcome, processed) = tokio::join!(fetch, sink);
        outcome.scheduler = scheduler_outcome;

        // keys interrupted by cancellation still get a report over what was stored
        for key in all_keys.difference(&processed) {
            self.process_key(key, range.0, range.1, &mut outcome).await;
        }

        info!(
            completed = outcome.scheduler.completed,
            dead_letters = outcome.scheduler.dead_letters.len(),
            abandoned = outcome.scheduler.abandoned.len(),
            inserted = outcome.inserted,
            conflicts = outcome.conflicts.len(),
            "ingest finished"
        );
        outcome
    }

    async fn ingest_batch(&self, batch: FetchedBatch, outcome: &mut IngestOutcome) {
        let key = batch.window.key.clone();
        outcome.records_fetched += batch.records.len();

        let normalized = normalize_batch(&batch.records, &key);
        for rejected in &normalized.rejected {
            warn!(key = %key, window = batch.window.id, index = rejected.index, error = %rejected.error, "record dropped by normalizer");
        }
        outcome.schema_rejects += normalized.rejected.len();
        metrics::counter!("kline.normalize.rejects", "exchange" => key.exchange.id())
            .increment(normalized.rejected.len() as u64);

        let now = (self.clock)();
        let (candles, open): (Vec<Candle>, Vec<Candle>) = normalized
            .candles
            .into_iter()
            .partition(|candle| candle.is_closed_at(now));
        if !open.is_empty() {
            warn!(key = %key, window = batch.window.id, skipped = open.len(), "venue returned buckets that have not closed yet");
            outcome.still_open += open.len();
        }
        if candles.is_empty() {
            return;
        }

        let store = self.store.clone();
        let started = Instant::now();
        let appended = tokio::task::spawn_blocking(move || {
            let results = store.append_batch(&candles);
            (candles, results)
        })
        .await;
        metrics::histogram!("kline.store.append_batch_ms")
            .record(started.elapsed().as_millis() as f64);

        let (candles, results) = match appended {
            Ok(pair) => pair,
            Err(err) => {
                error!(key = %key, error = %err, "append task failed");
                outcome.backend_errors += 1;
                return;
            }
        };

        for (candle, result) in candles.iter().zip(results) {
            let label = match &result {
                Ok(appended) => appended.as_str(),
                Err(StoreError::Conflict { .. }) => "conflict",
                Err(_) => "backend_error",
            };
            metrics::counter!("kline.store.appends", "exchange" => key.exchange.id(), "outcome" => label)
                .increment(1);
            match result {
                Ok(AppendOutcome::Inserted) => outcome.inserted += 1,
                Ok(AppendOutcome::DuplicateIgnored) => outcome.duplicates += 1,
                Ok(AppendOutcome::OutOfOrderRejected) => {
                    warn!(key = %key, open_time = candle.open_time, "store rejected misplaced candle");
                    outcome.out_of_order += 1;
                }
                Err(StoreError::Conflict {
                    key,
                    open_time,
                    existing,
                    incoming,
                }) => {
                    error!(key = %key, open_time, existing_close = existing.close, incoming_close = incoming.close, "conflicting candle; stored value kept");
                    metrics::counter!("kline.store.conflicts", "exchange" => key.exchange.id())
                        .increment(1);
                    outcome.conflicts.push(ConflictRecord {
                        key,
                        open_time,
                        existing: *existing,
                        incoming: *incoming,
                    });
                }
                Err(err) => {
                    error!(key = %key, open_time = candle.open_time, error = %err, "append failed");
                    outcome.backend_errors += 1;
                }
            }
        }
    }

    async fn process_key(&self, key: &SeriesKey, start: i64, end: i64, outcome: &mut IngestOutcome) {
        let span = info_span!("post_process", key = %key);
        async {
            let coarsest = self.derived_resolutions.last().copied().unwrap_or(key.resolution);
            let snapshot_start = coarsest.align(start).min(key.resolution.align(start));
            let store = self.store.clone();
            let query_key = key.clone();
            let snapshot = match tokio::task::spawn_blocking(move || {
                store.query(&query_key, snapshot_start, end)
            })
            .await
            {
                Ok(Ok(series)) => series,
                Ok(Err(err)) => {
                    error!(error = %err, "snapshot query failed; key skipped");
                    outcome.backend_errors += 1;
                    return;
                }
                Err(err) => {
                    error!(error = %err, "snapshot task failed; key skipped");
                    outcome.backend_errors += 1;
                    return;
                }
            };

            let profile = VenueProfile::for_exchange(key.exchange);
            let in_range = TimeSeries::new(
                key.clone(),
                snapshot
                    .candles
                    .iter()
                    .filter(|c| c.open_time >= start && c.open_time <= end)
                    .cloned()
                    .collect(),
            );
            let base_report = validate_series(&in_range, &profile);
            let fatal = base_report.severity == Severity::Fatal;
            self.publish(base_report, outcome);
            if fatal {
                error!("ordering violation in stored series; resampling halted for key");
                outcome.halted_keys.push(key.clone());
                return;
            }

            let mut computed: Vec<(Resolution, Vec<DerivedCandle>)> = Vec::new();
            for target in self.derived_resolutions.iter().copied() {
                if target == key.resolution || !key.resolution.divides(target) {
                    warn!(target = %target, "derived resolution incompatible with base; skipped");
                    continue;
                }
                let source = computed
                    .iter()
                    .rev()
                    .find(|(resolution, _)| resolution.divides(target) && *resolution != target);
                let derived = match source {
                    Some((resolution, candles)) => {
                        resample_derived(&key.with_resolution(*resolution), candles, target)
                    }
                    None => resample(&snapshot, target),
                };
                let derived = match derived {
                    Ok(derived) => derived,
                    Err(err) => {
                        error!(target = %target, error = %err, "resampling failed");
                        continue;
                    }
                };

                let target_key = key.with_resolution(target);
                let store = self.derived.clone();
                let upsert_key = target_key.clone();
                let rows = derived.clone();
                match tokio::task::spawn_blocking(move || store.upsert(&upsert_key, &rows)).await {
                    Ok(Ok(summary)) => info!(
                        target = %target,
                        buckets = derived.len(),
                        inserted = summary.inserted,
                        replaced = summary.replaced,
                        unchanged = summary.unchanged,
                        "derived series updated"
                    ),
                    Ok(Err(err)) => {
                        error!(target = %target, error = %err, "derived upsert failed");
                        outcome.backend_errors += 1;
                    }
                    Err(err) => {
                        error!(target = %target, error = %err, "derived upsert task failed");
                        outcome.backend_errors += 1;
                    }
                }

                // buckets straddling either edge of the range are stored but not judged
                let last_base = target.seconds() - key.resolution.seconds();
                let reported: Vec<DerivedCandle> = derived
                    .iter()
                    .filter(|c| c.open_time() >= start && c.open_time() + last_base <= end)
                    .cloned()
                    .collect();
                self.publish(validate_derived(&target_key, &reported, &profile), outcome);
                computed.push((target, derived));
            }
        }
        .instrument(span)
        .await
    }

    fn publish(&self, report: QualityReport, outcome: &mut IngestOutcome) {
        let key_label = report.key.to_string();
        metrics::gauge!("kline.validate.gaps", "key" => key_label.clone()).set(report.gaps.len() as f64);
        metrics::gauge!("kline.validate.missing_buckets", "key" => key_label.clone())
            .set(report.missing_buckets as f64);
        metrics::gauge!("kline.validate.outliers", "key" => key_label)
            .set(report.outliers.len() as f64);
        if report.severity != Severity::Ok {
            warn!(
                key = %report.key,
                severity = ?report.severity,
                gaps = report.gaps.len(),
                missing_buckets = report.missing_buckets,
                duplicates = report.duplicates.len(),
                outliers = report.outliers.len(),
                partial = report.partial_buckets.len(),
                "quality defects detected"
            );
        }

        let published = self.quality.publish(report.stamped(Utc::now()));
        if let Some((writer, dir)) = self.artifacts.as_ref() {
            if let Err(err) = writer.write_quality_report(dir, &published) {
                error!(key = %published.key, error = %err, "failed to write quality report");
            }
        }
        outcome.reports.push(published);
    }
}
