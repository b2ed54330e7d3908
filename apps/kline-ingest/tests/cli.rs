use std::fs;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

fn unique_dir(label: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let dir = std::env::temp_dir().join(format!("kline_cli_{label}_{}_{now}", std::process::id()));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Answers each request with the body of the first route whose path prefix matches.
struct MockVenueServer {
    base_url: String,
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MockVenueServer {
    fn start(routes: Vec<(&'static str, String)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock server");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();

        let handle = thread::spawn(move || {
            listener.set_nonblocking(true).expect("nonblocking");
            while !stop_clone.load(Ordering::Relaxed) {
                match listener.accept() {
                    Ok((mut stream, _)) => {
                        let _ = handle_connection(&mut stream, &routes);
                    }
                    Err(_) => thread::sleep(Duration::from_millis(10)),
                }
            }
        });

        Self {
            base_url,
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for MockVenueServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn handle_connection(
    stream: &mut TcpStream,
    routes: &[(&'static str, String)],
) -> Result<(), String> {
    stream.set_nonblocking(false).map_err(|e| e.to_string())?;
    stream
        .set_read_timeout(Some(Duration::from_secs(2)))
        .map_err(|e| e.to_string())?;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        let n = stream.read(&mut tmp).map_err(|e| e.to_string())?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&tmp[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() > 8192 {
            break;
        }
    }

    let request = String::from_utf8_lossy(&buf);
    let path = request.split_whitespace().nth(1).unwrap_or("/");
    let (status, body) = routes
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix))
        .map(|(_, body)| ("200 OK", body.as_bytes()))
        .unwrap_or(("404 Not Found", b"{}".as_slice()));
    let header = format!(
        "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );
    stream.write_all(header.as_bytes()).map_err(|e| e.to_string())?;
    stream.write_all(body).map_err(|e| e.to_string())?;
    Ok(())
}

// 00:00, 00:01 and 00:04 on 2024-01-01; the venue skipped 00:02 and 00:03.
fn klines_payload() -> String {
    r#"[
  [1704067200000,"100.0","102.0","99.0","101.0","10.0",1704067259999,"1000.0",5,"4.0","400.0","0"],
  [1704067260000,"101.0","103.0","100.0","100.5","11.0",1704067319999,"1100.0",6,"5.0","500.0","0"],
  [1704067440000,"100.5","104.0","100.2","102.0","12.0",1704067499999,"1200.0",7,"6.0","600.0","0"]
]"#
    .to_string()
}

fn write_config(dir: &Path, base_url: &str, extra: &str) -> PathBuf {
    let mut toml = String::new();
    toml.push_str("[run]\nrun_id = \"cli_e2e\"\n");
    toml.push_str("start = \"2024-01-01T00:00:00Z\"\nend = \"2024-01-01T00:05:00Z\"\n\n");
    toml.push_str("[[pairs]]\nexchange = \"binance_futures\"\nsymbol = \"BTCUSDT\"\n\n");
    toml.push_str("[resolutions]\nbase = \"1m\"\nderived = [\"5m\"]\n\n");
    toml.push_str("[retry]\nmax_retries = 1\nbase_delay_ms = 10\nmax_delay_ms = 20\n\n");
    toml.push_str(&format!(
        "[http]\ntimeout_ms = 2000\nbinance_base_url = \"{base_url}\"\ndydx_base_url = \"{base_url}\"\n\n"
    ));
    toml.push_str("[store]\nbackend = \"memory\"\n\n");
    toml.push_str(extra);
    toml.push_str(&format!("[paths]\nout_dir = \"{}\"\n", dir.display()));

    let path = dir.join("config.toml");
    fs::write(&path, toml).expect("write config");
    path
}

fn run_cli(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_kline-ingest"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("KLINE_LOG")
        .env_remove("KLINE_METRICS_ADDR")
        .env_remove("HTTP_PROXY")
        .env_remove("http_proxy")
        .env_remove("ALL_PROXY")
        .env_remove("all_proxy")
        .output()
        .expect("run cli")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not JSON ({err}): {}\nstderr: {}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn run_ingests_and_reports_gaps_without_strict() {
    let dir = unique_dir("run");
    let server = MockVenueServer::start(vec![("/fapi/v1/klines", klines_payload())]);
    let config = write_config(&dir, &server.base_url, "");

    let output = run_cli(&config, &["run"]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let summary = stdout_json(&output);
    assert_eq!(summary["run_id"], "cli_e2e");
    assert_eq!(summary["records"]["inserted"], 3);
    assert_eq!(summary["windows"]["dead_lettered"], 0);
    let base_report = summary["reports"]
        .as_array()
        .expect("reports")
        .iter()
        .find(|r| r["key"].as_str().is_some_and(|k| k.ends_with("1m")))
        .cloned()
        .expect("base report");
    assert_eq!(base_report["missing_buckets"], 2);

    assert!(dir.join("cli_e2e_run_summary.json").exists());
    assert!(dir.join("cli_e2e_config_snapshot.toml").exists());
    assert!(dir.join("quality").is_dir());
}

#[test]
fn strict_run_exits_with_quality_code() {
    let dir = unique_dir("strict");
    let server = MockVenueServer::start(vec![("/fapi/v1/klines", klines_payload())]);
    let config = write_config(&dir, &server.base_url, "[data_quality]\nmax_gaps = 0\n\n");

    let output = run_cli(&config, &["run", "--strict"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("strict validation failed"), "stderr: {stderr}");
}

#[test]
fn snapshot_reads_dydx_depth_and_funding() {
    let dir = unique_dir("snapshot");
    let book = r#"{"bids":[{"price":"64000","size":"1.5"},{"price":"63990","size":"0.5"}],"asks":[{"price":"64010","size":"2.0"}]}"#;
    let funding = r#"{"historicalFunding":[{"ticker":"BTC-USD","rate":"0.0000125","price":"64005","effectiveAtHeight":"1","effectiveAt":"2024-03-01T00:00:00.000Z"}]}"#;
    let server = MockVenueServer::start(vec![
        ("/v4/orderbooks/perpetualMarket/BTC-USD", book.to_string()),
        ("/v4/historicalFunding/BTC-USD", funding.to_string()),
    ]);
    let config = write_config(&dir, &server.base_url, "");

    let output = run_cli(
        &config,
        &["snapshot", "--exchange", "dydx_v4", "--symbol", "BTC-USD"],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let snapshot = stdout_json(&output);
    assert_eq!(snapshot["orderbook_depth"]["bid_volume"], 2.0);
    assert_eq!(snapshot["orderbook_depth"]["ask_volume"], 2.0);
    assert_eq!(snapshot["funding_rate"]["rate"], 0.0000125);
}

#[test]
fn snapshot_reports_unsupported_capabilities_for_binance() {
    let dir = unique_dir("snapshot_binance");
    let config = write_config(&dir, "http://127.0.0.1:9", "");

    let output = run_cli(
        &config,
        &["snapshot", "--exchange", "binance_futures", "--symbol", "BTCUSDT"],
    );
    assert!(output.status.success());
    let snapshot = stdout_json(&output);
    assert!(snapshot["orderbook_depth"]["unsupported"].is_string());
    assert!(snapshot["funding_rate"]["unsupported"].is_string());
}

#[test]
fn dead_letters_lists_empty_queue() {
    let dir = unique_dir("dlq");
    let config = write_config(&dir, "http://127.0.0.1:9", "");

    let output = run_cli(&config, &["dead-letters"]);
    assert!(output.status.success());
    let listing = stdout_json(&output);
    assert_eq!(listing["count"], 0);
}

#[test]
fn missing_config_file_exits_with_error() {
    let dir = unique_dir("missing");
    let output = run_cli(&dir.join("absent.toml"), &["run"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("failed to read config"));
}

#[test]
fn supersede_without_stored_candle_fails() {
    let dir = unique_dir("supersede");
    let config = write_config(&dir, "http://127.0.0.1:9", "");

    let output = run_cli(
        &config,
        &[
            "supersede",
            "--exchange",
            "binance_futures",
            "--symbol",
            "BTCUSDT",
            "--open-time",
            "2024-01-01T00:01:00Z",
            "--open",
            "101",
            "--high",
            "103",
            "--low",
            "100",
            "--close",
            "102.5",
            "--volume",
            "11",
            "--reason",
            "venue restated",
        ],
    );
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("no active candle"), "stderr: {stderr}");
}

#[test]
fn history_of_unknown_bucket_is_empty() {
    let dir = unique_dir("history");
    let config = write_config(&dir, "http://127.0.0.1:9", "");

    let output = run_cli(
        &config,
        &[
            "history",
            "--exchange",
            "binance_futures",
            "--symbol",
            "BTCUSDT",
            "--open-time",
            "1704067260",
        ],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let history = stdout_json(&output);
    assert_eq!(history["open_time"], 1_704_067_260);
    assert_eq!(history["revisions"], 0);
}
