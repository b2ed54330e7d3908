use kline_application::config::{Config, StoreBackend};
use kline_application::ingestion::{IngestRequest, IngestionPipeline};
use kline_application::quality::QualityRegistry;
use kline_application::query::QueryService;
use kline_application::rate_limiter::RateLimiter;
use kline_application::scheduler::{ExchangeLane, FetchScheduler};
use kline_domain::repositories::candle_store::CandleStore;
use kline_domain::repositories::derived_store::DerivedCandleStore;
use kline_domain::repositories::exchange::ExchangeAdapter;
use kline_domain::value_objects::exchange::Exchange;
use kline_infrastructure::artifacts::FilesystemReportWriter;
use kline_infrastructure::exchanges::http::HttpSettings;
use kline_infrastructure::exchanges::{BinanceFuturesAdapter, DydxAdapter};
use kline_infrastructure::persistence::{
    InMemoryCandleStore, InMemoryDerivedStore, JsonlDeadLetterSink, PostgresCandleStore,
};
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_POOL_MAX_SIZE: u32 = 8;

/// Everything a subcommand needs, wired from one validated config.
pub struct Components {
    pub config: Config,
    pub store: Arc<dyn CandleStore>,
    pub derived: Arc<dyn DerivedCandleStore>,
    pub quality: Arc<QualityRegistry>,
    pub dead_letters: Arc<JsonlDeadLetterSink>,
    pub pipeline: IngestionPipeline,
}

impl Components {
    pub fn build(config: Config) -> Result<Self, String> {
        config.validate()?;
        let (store, derived) = build_store(&config)?;
        let quality = Arc::new(QualityRegistry::new());
        let dead_letters = Arc::new(JsonlDeadLetterSink::new(config.dead_letter_path()));
        let pipeline = IngestionPipeline::new(
            store.clone(),
            derived.clone(),
            quality.clone(),
            dead_letters.clone(),
            config.derived_resolutions()?,
        )
        .with_artifacts(Arc::new(FilesystemReportWriter::new()), quality_dir(&config));
        Ok(Self {
            config,
            store,
            derived,
            quality,
            dead_letters,
            pipeline,
        })
    }

    pub fn query_service(&self) -> Result<QueryService, String> {
        Ok(QueryService::new(
            self.store.clone(),
            self.derived.clone(),
            self.quality.clone(),
            self.config.base_resolution()?,
        ))
    }

    pub fn request(&self) -> Result<IngestRequest, String> {
        let (start, end) = self.config.range()?;
        Ok(IngestRequest {
            run_id: self.config.run.run_id.clone(),
            keys: self.config.base_keys()?,
            start,
            end,
        })
    }
}

pub fn quality_dir(config: &Config) -> PathBuf {
    config.out_dir().join("quality")
}

/// Base and derived stores for the configured backend; postgres shares one pool.
pub fn build_store(
    config: &Config,
) -> Result<(Arc<dyn CandleStore>, Arc<dyn DerivedCandleStore>), String> {
    match config.store.backend {
        StoreBackend::Memory => {
            tracing::warn!("memory store selected; candles are dropped when the process exits");
            Ok((
                Arc::new(InMemoryCandleStore::new()),
                Arc::new(InMemoryDerivedStore::new()),
            ))
        }
        StoreBackend::Postgres => {
            let store = build_postgres(config)?;
            let derived = store.derived_store(config.derived_table().to_string())?;
            Ok((Arc::new(store), Arc::new(derived)))
        }
    }
}

pub fn build_postgres(config: &Config) -> Result<PostgresCandleStore, String> {
    let url = config
        .store
        .url
        .as_deref()
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| "store.url is required for the postgres backend".to_string())?;
    PostgresCandleStore::new(
        url,
        config.store_table().to_string(),
        config.store.pool_max_size.unwrap_or(DEFAULT_POOL_MAX_SIZE),
    )
}

pub fn build_adapter(config: &Config, exchange: Exchange) -> Result<Arc<dyn ExchangeAdapter>, String> {
    let settings = HttpSettings {
        base_url: config.base_url(exchange),
        timeout: config.http_timeout(),
        user_agent: config.user_agent(),
    };
    let adapter: Arc<dyn ExchangeAdapter> = match exchange {
        Exchange::BinanceFutures => Arc::new(BinanceFuturesAdapter::new(settings)?),
        Exchange::DydxV4 => Arc::new(DydxAdapter::new(settings)?),
    };
    Ok(adapter)
}

/// One lane per configured venue, each with its own token bucket.
pub fn build_scheduler(config: &Config) -> Result<FetchScheduler, String> {
    let mut scheduler = FetchScheduler::new(config.retry_policy());
    for exchange in config.exchanges() {
        let limit = config.rate_limit(exchange);
        scheduler = scheduler.with_lane(ExchangeLane {
            adapter: build_adapter(config, exchange)?,
            limiter: Arc::new(RateLimiter::new(exchange, limit.capacity, limit.refill_per_sec)),
            workers: limit.workers(),
        });
        tracing::debug!(
            exchange = %exchange,
            capacity = limit.capacity,
            refill_per_sec = limit.refill_per_sec,
            workers = limit.workers(),
            "exchange lane ready"
        );
    }
    Ok(scheduler)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(extra: &str) -> Config {
        let toml_str = format!(
            r#"
[run]
run_id = "unit"
start = "2024-03-01T00:00:00Z"
end = "2024-03-01T01:00:00Z"

[[pairs]]
exchange = "binance_futures"
symbol = "BTCUSDT"

[[pairs]]
exchange = "dydx_v4"
symbol = "BTC-USD"

[paths]
out_dir = "{}"
{extra}
"#,
            std::env::temp_dir().join("kline-bootstrap").display()
        );
        toml::from_str(&toml_str).expect("config should parse")
    }

    #[test]
    fn memory_backend_wires_every_venue() {
        let components = Components::build(config("[store]\nbackend = \"memory\"\n")).unwrap();
        let scheduler = build_scheduler(&components.config).unwrap();
        assert!(scheduler.adapter(Exchange::BinanceFutures).is_some());
        assert!(scheduler.adapter(Exchange::DydxV4).is_some());
        let request = components.request().unwrap();
        assert_eq!(request.keys.len(), 2);
        assert_eq!(request.end - request.start, 3600);
        assert!(components.derived.keys().unwrap().is_empty());
    }

    #[test]
    fn postgres_backend_requires_url() {
        let err = Components::build(config("[store]\nbackend = \"postgres\"\n"))
            .err()
            .expect("missing url must fail");
        assert!(err.contains("store.url"));
    }
}
