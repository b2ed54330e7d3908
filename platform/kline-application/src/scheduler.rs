use crate::rate_limiter::RateLimiter;
use chrono::Utc;
use kline_domain::errors::FetchError;
use kline_domain::repositories::exchange::ExchangeAdapter;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::fetch_window::{
    DeadLetter, FetchWindow, RetryPolicy, Transition, WindowStatus,
};
use kline_domain::value_objects::raw_record::RawRecord;
use kline_domain::value_objects::series::SeriesKey;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub window: FetchWindow,
    pub records: Vec<RawRecord>,
}

/// What the scheduler hands downstream, in per-key order.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    Batch(FetchedBatch),
    DeadLettered(DeadLetter),
    /// No window of this key is pending or in flight any more.
    KeyDrained(SeriesKey),
}

#[derive(Debug, Default, Clone)]
pub struct SchedulerOutcome {
    pub completed: usize,
    pub rate_limited: usize,
    pub retried: usize,
    pub dead_letters: Vec<DeadLetter>,
    pub abandoned: Vec<FetchWindow>,
}

impl SchedulerOutcome {
    fn merge(&mut self, other: SchedulerOutcome) {
        self.completed += other.completed;
        self.rate_limited += other.rate_limited;
        self.retried += other.retried;
        self.dead_letters.extend(other.dead_letters);
        self.abandoned.extend(other.abandoned);
    }
}

pub struct ExchangeLane {
    pub adapter: Arc<dyn ExchangeAdapter>,
    pub limiter: Arc<RateLimiter>,
    pub workers: usize,
}

pub struct FetchScheduler {
    lanes: HashMap<Exchange, ExchangeLane>,
    policy: RetryPolicy,
}

impl FetchScheduler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            lanes: HashMap::new(),
            policy,
        }
    }

    pub fn with_lane(mut self, lane: ExchangeLane) -> Self {
        self.lanes.insert(lane.adapter.exchange(), lane);
        self
    }

    pub fn adapter(&self, exchange: Exchange) -> Option<Arc<dyn ExchangeAdapter>> {
        self.lanes.get(&exchange).map(|lane| lane.adapter.clone())
    }

    /// Runs every window to completion, dead-letter or cancellation. Exchanges run
    /// as independent worker groups; events for one key arrive in window order.
    pub async fn run(
        &self,
        windows: Vec<FetchWindow>,
        events: mpsc::Sender<SchedulerEvent>,
        cancel: CancellationToken,
    ) -> SchedulerOutcome {
        let mut by_exchange: BTreeMap<Exchange, Vec<FetchWindow>> = BTreeMap::new();
        for window in windows {
            by_exchange.entry(window.key.exchange).or_default().push(window);
        }

        let mut outcome = SchedulerOutcome::default();
        let mut groups = JoinSet::new();
        for (exchange, windows) in by_exchange {
            let Some(lane) = self.lanes.get(&exchange) else {
                error!(exchange = %exchange, windows = windows.len(), "no adapter configured; dead-lettering windows");
                for window in windows {
                    let letter = dead_letter(
                        window,
                        &FetchError::Unsupported(format!("no adapter configured for {exchange}")),
                    );
                    let key = letter.window.key.clone();
                    let _ = events.send(SchedulerEvent::DeadLettered(letter.clone())).await;
                    let _ = events.send(SchedulerEvent::KeyDrained(key)).await;
                    outcome.dead_letters.push(letter);
                }
                continue;
            };

            let group = ExchangeGroup {
                exchange,
                adapter: lane.adapter.clone(),
                limiter: lane.limiter.clone(),
                policy: self.policy,
                queue: Mutex::new(WindowQueue::new(windows)),
                wake: Notify::new(),
                events: events.clone(),
                cancel: cancel.clone(),
                completed: AtomicUsize::new(0),
                rate_limited: AtomicUsize::new(0),
                retried: AtomicUsize::new(0),
                dead_letters: Mutex::new(Vec::new()),
            };
            let workers = lane.workers.max(1);
            groups.spawn(
                Arc::new(group)
                    .run(workers)
                    .instrument(info_span!("fetch_group", exchange = %exchange, workers)),
            );
        }

        while let Some(joined) = groups.join_next().await {
            match joined {
                Ok(group_outcome) => outcome.merge(group_outcome),
                Err(err) => error!(error = %err, "fetch group task failed"),
            }
        }
        outcome
    }
}

struct ExchangeGroup {
    exchange: Exchange,
    adapter: Arc<dyn ExchangeAdapter>,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    queue: Mutex<WindowQueue>,
    wake: Notify,
    events: mpsc::Sender<SchedulerEvent>,
    cancel: CancellationToken,
    completed: AtomicUsize,
    rate_limited: AtomicUsize,
    retried: AtomicUsize,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl ExchangeGroup {
    async fn run(self: Arc<Self>, workers: usize) -> SchedulerOutcome {
        let mut pool = JoinSet::new();
        for worker in 0..workers {
            let group = self.clone();
            pool.spawn(async move { group.work(worker).await });
        }
        while let Some(joined) = pool.join_next().await {
            if let Err(err) = joined {
                error!(exchange = %self.exchange, error = %err, "fetch worker panicked");
            }
        }

        let abandoned = self.queue.lock().drain_pending();
        if !abandoned.is_empty() {
            warn!(exchange = %self.exchange, windows = abandoned.len(), "windows left pending after cancellation");
        }
        SchedulerOutcome {
            completed: self.completed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_letters: std::mem::take(&mut *self.dead_letters.lock()),
            abandoned,
        }
    }

    async fn work(&self, worker: usize) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let woken = self.wake.notified();
            tokio::pin!(woken);
            woken.as_mut().enable();

            let next = self.queue.lock().next(Instant::now().into_std());
            match next {
                Next::Drained => {
                    self.wake.notify_waiters();
                    break;
                }
                Next::Wait(deadline) => {
                    let sleep = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(Instant::from_std(at)).await,
                            None => std::future::pending::<()>().await,
                        }
                    };
                    tokio::select! {
                        _ = &mut woken => {}
                        _ = sleep => {}
                        _ = self.cancel.cancelled() => break,
                    }
                }
                Next::Window(window) => self.attempt(worker, window).await,
            }
        }
    }

    async fn attempt(&self, worker: usize, mut window: FetchWindow) {
        if let Err(err) = window.begin_attempt() {
            error!(window = window.id, error = %err, "window handed out in wrong state");
            self.queue.lock().finish(&window.key);
            return;
        }
        let span = info_span!(
            "fetch_window",
            worker,
            window = window.id,
            key = %window.key,
            start = window.start_time,
            end = window.end_time,
            retries = window.retries
        );
        self.attempt_in_span(window).instrument(span).await;
        self.wake.notify_waiters();
    }

    async fn attempt_in_span(&self, mut window: FetchWindow) {
        let key = window.key.clone();
        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = async {
                self.limiter.acquire().await;
                let started = std::time::Instant::now();
                let result = self
                    .adapter
                    .fetch_candles(&key.symbol, key.resolution, window.start_time, window.end_time)
                    .await;
                metrics::histogram!("kline.fetch.request_ms", "exchange" => self.exchange.id())
                    .record(started.elapsed().as_millis() as f64);
                result
            } => Some(result),
        };

        let Some(result) = fetched else {
            if window.abandon().is_ok() {
                debug!("attempt abandoned by cancellation");
                self.queue.lock().requeue(window);
            }
            return;
        };

        match result {
            Ok(records) => {
                metrics::counter!("kline.fetch.attempts", "exchange" => self.exchange.id(), "result" => "ok")
                    .increment(1);
                if let Err(err) = window.complete() {
                    error!(error = %err, "failed to complete window");
                }
                debug!(records = records.len(), "window fetched");
                self.completed.fetch_add(1, Ordering::Relaxed);
                let batch = FetchedBatch {
                    window: window.clone(),
                    records,
                };
                if self.events.send(SchedulerEvent::Batch(batch)).await.is_err() {
                    warn!("event receiver closed; stopping fetch group");
                    self.cancel.cancel();
                }
                self.finish_window(&key).await;
            }
            Err(err) => {
                metrics::counter!("kline.fetch.attempts", "exchange" => self.exchange.id(), "result" => err.kind())
                    .increment(1);
                let now = Instant::now().into_std();
                match window.fail(&err, now, &self.policy) {
                    Ok(Transition::Rescheduled {
                        consumed_retry,
                        not_before,
                    }) => {
                        if consumed_retry {
                            self.retried.fetch_add(1, Ordering::Relaxed);
                            warn!(error = %err, retries = window.retries, delay_ms = not_before.saturating_duration_since(now).as_millis() as u64, "fetch failed; retrying with backoff");
                        } else {
                            self.rate_limited.fetch_add(1, Ordering::Relaxed);
                            info!(error = %err, "rate limited by venue; rescheduled");
                        }
                        self.queue.lock().requeue(window);
                    }
                    Ok(Transition::DeadLettered) => {
                        error!(error = %err, retries = window.retries, "window dead-lettered");
                        metrics::counter!("kline.fetch.dead_letters", "exchange" => self.exchange.id())
                            .increment(1);
                        let letter = dead_letter(window, &err);
                        self.dead_letters.lock().push(letter.clone());
                        let _ = self.events.send(SchedulerEvent::DeadLettered(letter)).await;
                        self.finish_window(&key).await;
                    }
                    Ok(Transition::Done) => {}
                    Err(transition) => error!(error = %transition, "invalid window transition"),
                }
            }
        }
    }

    async fn finish_window(&self, key: &SeriesKey) {
        let drained = self.queue.lock().finish(key);
        if drained {
            let _ = self.events.send(SchedulerEvent::KeyDrained(key.clone())).await;
        }
    }
}

fn dead_letter(mut window: FetchWindow, err: &FetchError) -> DeadLetter {
    window.status = WindowStatus::Failed;
    window.last_error = Some(err.to_string());
    DeadLetter {
        reason: err.to_string(),
        error_kind: err.kind().to_string(),
        failed_at: Utc::now(),
        window,
    }
}

enum Next {
    Window(FetchWindow),
    Wait(Option<StdInstant>),
    Drained,
}

/// Pending windows per key, each queue sorted by `start_time`. A key with a window
/// in flight is skipped until that window finishes or is requeued.
struct WindowQueue {
    pending: BTreeMap<SeriesKey, VecDeque<FetchWindow>>,
    in_flight: HashSet<SeriesKey>,
}

impl WindowQueue {
    fn new(windows: Vec<FetchWindow>) -> Self {
        let mut pending: BTreeMap<SeriesKey, VecDeque<FetchWindow>> = BTreeMap::new();
        for window in windows {
            pending.entry(window.key.clone()).or_default().push_back(window);
        }
        for queue in pending.values_mut() {
            queue.make_contiguous().sort_by_key(|w| (w.start_time, w.id));
        }
        Self {
            pending,
            in_flight: HashSet::new(),
        }
    }

    fn next(&mut self, now: StdInstant) -> Next {
        let mut earliest: Option<StdInstant> = None;
        let mut chosen: Option<SeriesKey> = None;
        for (key, queue) in &self.pending {
            if self.in_flight.contains(key) {
                continue;
            }
            let Some(front) = queue.front() else {
                continue;
            };
            if front.is_eligible(now) {
                chosen = Some(key.clone());
                break;
            }
            if let Some(at) = front.not_before {
                earliest = Some(earliest.map_or(at, |current| current.min(at)));
            }
        }

        if let Some(key) = chosen {
            if let Some(window) = self.pending.get_mut(&key).and_then(|q| q.pop_front()) {
                self.in_flight.insert(key);
                return Next::Window(window);
            }
        }
        if self.in_flight.is_empty() && self.pending.values().all(|q| q.is_empty()) {
            return Next::Drained;
        }
        Next::Wait(earliest)
    }

    /// Puts a rescheduled or abandoned window back at the head of its key.
    fn requeue(&mut self, window: FetchWindow) {
        self.in_flight.remove(&window.key);
        self.pending
            .entry(window.key.clone())
            .or_default()
            .push_front(window);
    }

    /// Marks the key's in-flight window as finished; true when the key has nothing left.
    fn finish(&mut self, key: &SeriesKey) -> bool {
        self.in_flight.remove(key);
        let empty = self.pending.get(key).map_or(true, |q| q.is_empty());
        if empty {
            self.pending.remove(key);
        }
        empty
    }

    fn drain_pending(&mut self) -> Vec<FetchWindow> {
        std::mem::take(&mut self.pending)
            .into_values()
            .flatten()
            .collect()
    }
}
