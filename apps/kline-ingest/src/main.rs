use clap::{Parser, Subcommand};
use kline_application::config::{self, parse_time_input, Config};
use kline_domain::value_objects::exchange::Exchange;
use kline_domain::value_objects::resolution::Resolution;
use kline_domain::value_objects::series::SeriesKey;
use kline_ingest::bootstrap::Components;
use kline_ingest::commands::{self, SeriesArgs, SupersedeArgs};
use kline_ingest::obs::{self, LogFormat};
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "kline-ingest")]
#[command(about = "Multi-venue K-line ingestion, resampling and validation.", version)]
struct Cli {
    /// Config file path (TOML).
    #[arg(long, global = true, env = "KLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when KLINE_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true, value_enum, default_value = "fmt")]
    log_format: LogFormat,

    /// Prometheus metrics listen addr (e.g. 127.0.0.1:9898). Optional.
    #[arg(long, global = true, env = "KLINE_METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill the configured range for every pair, then resample and validate.
    Run {
        /// Fail when data-quality limits are exceeded.
        #[arg(long)]
        strict: bool,
    },
    /// Rebuild derived series and quality reports from stored candles.
    Validate {
        #[arg(long)]
        strict: bool,
    },
    /// Create the base and derived candle tables (Postgres backend only).
    Migrate {
        /// Run this SQL file instead of the built-in schema.
        #[arg(long)]
        migrations_path: Option<PathBuf>,
    },
    /// Print one series as JSON.
    Series {
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        resolution: Resolution,
        /// Epoch seconds/ms or RFC3339; defaults to the configured range.
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        /// Include partial buckets of derived resolutions, with completeness.
        #[arg(long)]
        partial: bool,
    },
    /// Fetch orderbook depth and the latest funding rate for one market.
    Snapshot {
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        symbol: String,
    },
    /// Replace a stored base candle with corrected values; the old row is kept.
    Supersede {
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        resolution: Resolution,
        /// Epoch seconds/ms or RFC3339.
        #[arg(long)]
        open_time: String,
        #[arg(long)]
        open: f64,
        #[arg(long)]
        high: f64,
        #[arg(long)]
        low: f64,
        #[arg(long)]
        close: f64,
        #[arg(long)]
        volume: f64,
        #[arg(long)]
        reason: String,
    },
    /// Print every stored revision of one base candle.
    History {
        #[arg(long)]
        exchange: Exchange,
        #[arg(long)]
        symbol: String,
        #[arg(long, default_value = "1m")]
        resolution: Resolution,
        #[arg(long)]
        open_time: String,
    },
    /// List windows waiting for operator replay.
    DeadLetters,
    /// Re-fetch every dead-lettered window with a fresh retry budget.
    Replay {
        #[arg(long)]
        strict: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = obs::init_tracing(&cli.log_level, cli.log_format) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
    if let Err(err) = obs::init_metrics(cli.metrics_addr.as_deref()) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    match run(cli) {
        Ok(json) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&json)
                    .unwrap_or_else(|_| "{\"status\":\"error\",\"error\":\"json\"}".to_string())
            );
        }
        Err(err) => {
            let code = if err.contains("strict validation failed") {
                2
            } else {
                1
            };
            eprintln!("error: {err}");
            std::process::exit(code);
        }
    }
}

fn run(cli: Cli) -> Result<serde_json::Value, String> {
    let config_path = cli
        .config
        .ok_or_else(|| "missing --config and env KLINE_CONFIG is not set".to_string())?;
    let config = load(&config_path)?;

    match cli.command {
        Commands::Migrate { migrations_path } => {
            commands::migrate(&config, migrations_path.as_deref())
        }
        Commands::DeadLetters => commands::list_dead_letters(&config),
        Commands::Snapshot { exchange, symbol } => {
            config.validate()?;
            block_on(|_| async move {
                commands::market_snapshot(&config, exchange, &symbol).await
            })
        }
        Commands::Run { strict } => {
            let components = Components::build(config)?;
            let components = &components;
            block_on(move |cancel| async move {
                commands::run_ingest(components, strict, cancel).await
            })
        }
        Commands::Replay { strict } => {
            let components = Components::build(config)?;
            let components = &components;
            block_on(move |cancel| async move {
                commands::replay_dead_letters(components, strict, cancel).await
            })
        }
        Commands::Validate { strict } => {
            let components = Components::build(config)?;
            let components = &components;
            block_on(move |_| async move { commands::validate_stored(components, strict).await })
        }
        Commands::Supersede {
            exchange,
            symbol,
            resolution,
            open_time,
            open,
            high,
            low,
            close,
            volume,
            reason,
        } => {
            let args = SupersedeArgs {
                exchange,
                symbol,
                resolution,
                open_time: parse_time_input(&open_time)?.timestamp(),
                open,
                high,
                low,
                close,
                volume,
                reason,
            };
            let components = Components::build(config)?;
            let components = &components;
            block_on(move |_| async move { commands::supersede_candle(components, args).await })
        }
        Commands::History {
            exchange,
            symbol,
            resolution,
            open_time,
        } => {
            let open_time = parse_time_input(&open_time)?.timestamp();
            let key = SeriesKey::new(exchange, symbol.trim(), resolution);
            let components = Components::build(config)?;
            let components = &components;
            block_on(move |_| async move {
                commands::candle_history(components, key, open_time).await
            })
        }
        Commands::Series {
            exchange,
            symbol,
            resolution,
            start,
            end,
            partial,
        } => {
            let (default_start, default_end) = config.range()?;
            let start = start
                .as_deref()
                .map(|raw| parse_time_input(raw).map(|dt| dt.timestamp()))
                .transpose()?
                .unwrap_or(default_start);
            let end = end
                .as_deref()
                .map(|raw| parse_time_input(raw).map(|dt| dt.timestamp()))
                .transpose()?
                .unwrap_or(default_end);
            if start > end {
                return Err(format!("--start ({start}) must be <= --end ({end})"));
            }
            let components = Components::build(config)?;
            let args = SeriesArgs {
                exchange,
                symbol,
                resolution,
                start,
                end,
                include_partial: partial,
            };
            let components = &components;
            block_on(move |_| async move { commands::query_series(components, args).await })
        }
    }
}

fn load(path: &Path) -> Result<Config, String> {
    let config = config::load_config(path)?;
    tracing::debug!(path = %path.display(), run_id = %config.run.run_id, "config loaded");
    Ok(config)
}

/// Runs `task` on a fresh multi-thread runtime. Ctrl-C cancels the token; windows in
/// flight revert to pending and the command reports them. The runtime is gone before
/// the caller drops its components, so blocking clients never shut down inside it.
fn block_on<F, Fut>(task: F) -> Result<serde_json::Value, String>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<serde_json::Value, String>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| format!("unable to start async runtime: {err}"))?;
    let cancel = CancellationToken::new();
    runtime.block_on(async {
        let watcher = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received; cancelling after in-flight requests");
                watcher.cancel();
            }
        });
        task(cancel).await
    })
}
