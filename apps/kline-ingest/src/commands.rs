use crate::bootstrap::{build_adapter, build_postgres, build_scheduler, Components};
use kline_application::config::{to_toml_pretty, Config};
use kline_application::ingestion::IngestOutcome;
use kline_application::validation::evaluate_reports;
use kline_domain::errors::FetchError;
use kline_domain::repositories::artifacts::ReportWriter;
use kline_domain::repositories::dead_letter::DeadLetterSink;
use kline_domain::value_objects::candle::Candle;
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::SeriesKey;
use kline_infrastructure::artifacts::FilesystemReportWriter;
use kline_infrastructure::persistence::JsonlDeadLetterSink;
use std::path::Path;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SeriesArgs {
    pub exchange: Exchange,
    pub symbol: String,
    pub resolution: Resolution,
    pub start: i64,
    pub end: i64,
    pub include_partial: bool,
}

/// Operator correction of one stored base candle.
#[derive(Debug, Clone)]
pub struct SupersedeArgs {
    pub exchange: Exchange,
    pub symbol: String,
    pub resolution: Resolution,
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub reason: String,
}

impl SupersedeArgs {
    fn candle(&self) -> Candle {
        Candle {
            exchange: self.exchange,
            symbol: self.symbol.trim().to_string(),
            resolution: self.resolution,
            open_time: self.open_time,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            source_seq: None,
        }
    }
}

pub async fn run_ingest(
    components: &Components,
    strict: bool,
    cancel: CancellationToken,
) -> Result<serde_json::Value, String> {
    let scheduler = build_scheduler(&components.config)?;
    let request = components.request()?;
    let outcome = components.pipeline.run(&request, &scheduler, cancel).await;
    finish(components, "run", &outcome, strict)
}

pub async fn replay_dead_letters(
    components: &Components,
    strict: bool,
    cancel: CancellationToken,
) -> Result<serde_json::Value, String> {
    let letters = components.dead_letters.list()?;
    if letters.is_empty() {
        return Ok(serde_json::json!({ "replayed": 0 }));
    }
    tracing::info!(letters = letters.len(), "replaying dead letters");
    let scheduler = build_scheduler(&components.config)?;
    let outcome = components.pipeline.replay(letters, &scheduler, cancel).await;
    finish(components, "replay", &outcome, strict)
}

/// Rebuilds derived series and quality reports from stored candles without fetching.
pub async fn validate_stored(
    components: &Components,
    strict: bool,
) -> Result<serde_json::Value, String> {
    let (start, end) = components.config.range()?;
    let keys = components.config.base_keys()?;
    let outcome = components.pipeline.revalidate(&keys, start, end).await;
    if outcome.backend_errors > 0 {
        return Err(format!(
            "validation incomplete: {} store errors",
            outcome.backend_errors
        ));
    }
    evaluate_reports(&outcome.reports, &components.config.quality_limits(), strict)
}

pub async fn query_series(
    components: &Components,
    args: SeriesArgs,
) -> Result<serde_json::Value, String> {
    let base = components.config.base_resolution()?;
    if args.resolution != base {
        let derived = components.config.derived_resolutions()?;
        if !derived.contains(&args.resolution) {
            return Err(format!(
                "resolution {} is neither the base ({base}) nor a configured derived resolution",
                args.resolution
            ));
        }
    }

    let query = components.query_service()?;
    if args.include_partial && args.resolution != base {
        let candles = tokio::task::spawn_blocking(move || {
            query.get_derived_series(
                args.exchange,
                &args.symbol,
                args.resolution,
                args.start,
                args.end,
            )
        })
        .await
        .map_err(|err| format!("derived query task failed: {err}"))?
        .map_err(|err| err.to_string())?;
        return serde_json::to_value(candles)
            .map_err(|err| format!("failed to serialize series: {err}"));
    }
    let series = tokio::task::spawn_blocking(move || {
        query.get_series(
            args.exchange,
            &args.symbol,
            args.resolution,
            args.start,
            args.end,
        )
    })
    .await
    .map_err(|err| format!("series query task failed: {err}"))?
    .map_err(|err| err.to_string())?;
    serde_json::to_value(series).map_err(|err| format!("failed to serialize series: {err}"))
}

/// Appends a new active revision for a stored bucket, which resolves a
/// conflict so that the corrected values dedup on the next ingest.
pub async fn supersede_candle(
    components: &Components,
    args: SupersedeArgs,
) -> Result<serde_json::Value, String> {
    if args.reason.trim().is_empty() {
        return Err("--reason must not be empty".to_string());
    }
    let candle = args.candle();
    candle
        .check_invariants()
        .map_err(|err| format!("invalid candle: {err}"))?;

    let store = components.store.clone();
    let key = candle.key();
    let open_time = candle.open_time;
    let history = tokio::task::spawn_blocking(move || {
        store.supersede(&candle, &args.reason)?;
        store.history(&candle.key(), candle.open_time)
    })
    .await
    .map_err(|err| format!("supersede task failed: {err}"))?
    .map_err(|err| err.to_string())?;

    metrics::counter!("kline.store.supersedes", "exchange" => key.exchange.id()).increment(1);
    Ok(serde_json::json!({
        "key": key.to_string(),
        "open_time": open_time,
        "revision": history.last().map(|row| row.revision),
        "history": history,
    }))
}

/// Every stored revision of one bucket, oldest first.
pub async fn candle_history(
    components: &Components,
    key: SeriesKey,
    open_time: i64,
) -> Result<serde_json::Value, String> {
    let store = components.store.clone();
    let lookup = key.clone();
    let history = tokio::task::spawn_blocking(move || store.history(&lookup, open_time))
        .await
        .map_err(|err| format!("history task failed: {err}"))?
        .map_err(|err| err.to_string())?;
    Ok(serde_json::json!({
        "key": key.to_string(),
        "open_time": open_time,
        "revisions": history.len(),
        "history": history,
    }))
}

/// Depth and funding for one market, for collaborators that want the raw book.
/// Venues without the capability report it instead of failing the command.
pub async fn market_snapshot(
    config: &Config,
    exchange: Exchange,
    symbol: &str,
) -> Result<serde_json::Value, String> {
    let adapter = build_adapter(config, exchange)?;
    let (depth, funding) = tokio::join!(
        adapter.fetch_orderbook_depth(symbol),
        adapter.fetch_funding_rate(symbol)
    );
    let depth = match depth {
        Ok(book) => serde_json::json!({
            "bid_volume": book.bid_volume(),
            "ask_volume": book.ask_volume(),
            "book": book,
        }),
        Err(FetchError::Unsupported(reason)) => serde_json::json!({ "unsupported": reason }),
        Err(err) => return Err(format!("orderbook depth fetch failed: {err}")),
    };
    let funding = match funding {
        Ok(rate) => serde_json::to_value(rate)
            .map_err(|err| format!("failed to serialize funding rate: {err}"))?,
        Err(FetchError::Unsupported(reason)) => serde_json::json!({ "unsupported": reason }),
        Err(err) => return Err(format!("funding rate fetch failed: {err}")),
    };
    Ok(serde_json::json!({
        "exchange": exchange,
        "symbol": symbol,
        "orderbook_depth": depth,
        "funding_rate": funding,
    }))
}

pub fn list_dead_letters(config: &Config) -> Result<serde_json::Value, String> {
    let sink = JsonlDeadLetterSink::new(config.dead_letter_path());
    let letters = sink.list()?;
    Ok(serde_json::json!({
        "path": sink.path().display().to_string(),
        "count": letters.len(),
        "letters": letters,
    }))
}

pub fn migrate(config: &Config, migrations_path: Option<&Path>) -> Result<serde_json::Value, String> {
    let store = build_postgres(config)?;
    match migrations_path {
        Some(path) => {
            let sql = std::fs::read_to_string(path).map_err(|err| {
                format!("failed to read migrations file {}: {}", path.display(), err)
            })?;
            store.execute_batch(&sql)?;
        }
        None => store.migrate()?,
    }
    let derived = store.derived_store(config.derived_table().to_string())?;
    derived.migrate()?;
    Ok(serde_json::json!({
        "migrated": true,
        "table": store.table,
        "derived_table": derived.table,
        "migrations_path": migrations_path.map(|p| p.display().to_string()),
    }))
}

fn finish(
    components: &Components,
    label: &str,
    outcome: &IngestOutcome,
    strict: bool,
) -> Result<serde_json::Value, String> {
    let config = &components.config;
    let quality = evaluate_reports(&outcome.reports, &config.quality_limits(), false)?;
    let mut summary = outcome.summary_json();
    summary["run_id"] = serde_json::json!(config.run.run_id);
    summary["mode"] = serde_json::json!(label);
    summary["quality"] = quality;
    summary["dead_letter_path"] = serde_json::json!(config.dead_letter_path().display().to_string());
    summary["finished_at"] = serde_json::json!(chrono::Utc::now().to_rfc3339());
    metrics::counter!("kline.app.runs_total", "mode" => label.to_string()).increment(1);

    let writer = FilesystemReportWriter::new();
    writer.ensure_dir(&config.out_dir())?;
    let snapshot = config
        .out_dir()
        .join(format!("{}_config_snapshot.toml", config.run.run_id));
    std::fs::write(&snapshot, to_toml_pretty(config)?)
        .map_err(|err| format!("failed to write {}: {}", snapshot.display(), err))?;

    let path = config
        .out_dir()
        .join(format!("{}_{}_summary.json", config.run.run_id, label));
    writer.write_run_summary(&path, &summary)?;
    tracing::info!(path = %path.display(), "run summary written");

    if !outcome.scheduler.abandoned.is_empty() {
        return Err(format!(
            "{label} cancelled with {} windows still pending (summary: {})",
            outcome.scheduler.abandoned.len(),
            path.display()
        ));
    }
    if strict {
        evaluate_reports(&outcome.reports, &config.quality_limits(), true)?;
    }
    Ok(summary)
}
