mod routes;

use clap::Parser;
use ice_core::{LinuxProcessTable, SupervisorConfig, SupervisorRegistry};
use std::{
    fs::{self, File, OpenOptions},
    io,
    net::SocketAddr,
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{
    fmt::writer::{BoxMakeWriter, MakeWriterExt},
    EnvFilter,
};

#[derive(Clone, Debug)]
struct Config {
    addr: String,
    debug: bool,
    scan_interval: Duration,
    log_dir: String,
}

#[derive(Parser, Debug)]
#[command(name = "ice-server", about = "Supervises PTY processes and reports their ports")]
struct Args {
    #[arg(long, env = "ICE_ADDR", default_value = "0.0.0.0:3000")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, env = "ICE_SCAN_INTERVAL_MS", default_value_t = 2000)]
    scan_interval_ms: u64,
    #[arg(long, env = "ICE_LOG_DIR", default_value = "")]
    log_dir: String,
}

#[tokio::main]
async fn main() {
    let config = load_config();
    init_logging(&config);
    let addr: SocketAddr = match config.addr.parse() {
        Ok(value) => value,
        Err(err) => {
            error!(event = "invalid_addr", error = %err, addr = %config.addr);
            std::process::exit(1);
        }
    };

    let supervisor_config = match SupervisorConfig::capture() {
        Ok(value) => value.with_scan_interval(config.scan_interval),
        Err(err) => {
            error!(event = "config_error", error = %err);
            std::process::exit(1);
        }
    };
    let workdir = supervisor_config.workdir.clone();
    let registry = SupervisorRegistry::new(supervisor_config, Arc::new(LinuxProcessTable::new()));
    let app = routes::router(registry.clone());

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(value) => value,
        Err(err) => {
            error!(event = "server_error", error = %err, addr = %addr);
            std::process::exit(1);
        }
    };

    info!(
        event = "server_start",
        addr = %addr,
        workdir = %workdir.display(),
        scan_interval_ms = config.scan_interval.as_millis() as u64
    );

    if let Err(err) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(event = "server_error", error = %err);
    }

    registry.shutdown();
    info!(event = "server_stop");
}

async fn shutdown_signal() {
    let mut streams = Vec::new();
    for kind in [SignalKind::interrupt(), SignalKind::terminate(), SignalKind::quit()] {
        match signal(kind) {
            Ok(stream) => streams.push(stream),
            Err(err) => warn!(event = "signal_handler_error", error = %err),
        }
    }
    if streams.is_empty() {
        let _ = tokio::signal::ctrl_c().await;
        return;
    }
    let waits = streams.iter_mut().map(|stream| Box::pin(stream.recv()));
    futures_util::future::select_all(waits).await;
    info!(event = "shutdown_requested");
}

fn load_config() -> Config {
    let args = Args::parse();
    let debug = args.debug || env_true("ICE_DEBUG");
    Config {
        addr: args.addr,
        debug,
        scan_interval: Duration::from_millis(args.scan_interval_ms),
        log_dir: args.log_dir,
    }
}

fn init_logging(config: &Config) {
    let level = log_level(config.debug, std::env::var("ICE_LOG_LEVEL").ok());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let writer = match open_log_file(&config.log_dir) {
        Ok(Some(file)) => BoxMakeWriter::new(io::stdout.and(Arc::new(file))),
        Ok(None) => BoxMakeWriter::new(io::stdout),
        Err(err) => {
            eprintln!("log_file_error: {err}");
            BoxMakeWriter::new(io::stdout)
        }
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .try_init();
}

fn log_level(debug: bool, configured: Option<String>) -> String {
    match configured {
        _ if debug => "debug".to_string(),
        Some(level) if !level.trim().is_empty() => level,
        _ => "info".to_string(),
    }
}

/// Opens `<log_dir>/ice-server.log` for appending. An empty `log_dir` means
/// stdout only.
fn open_log_file(log_dir: &str) -> io::Result<Option<File>> {
    if log_dir.trim().is_empty() {
        return Ok(None);
    }
    let dir = Path::new(log_dir);
    fs::create_dir_all(dir)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join("ice-server.log"))?;
    Ok(Some(file))
}

fn env_true(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| flag_enabled(&value))
}

fn flag_enabled(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_flag_overrides_configured_level() {
        assert_eq!(log_level(true, Some("warn".to_string())), "debug");
        assert_eq!(log_level(false, Some("warn".to_string())), "warn");
        assert_eq!(log_level(false, Some("  ".to_string())), "info");
        assert_eq!(log_level(false, None), "info");
    }

    #[test]
    fn log_file_is_created_under_log_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("logs");
        let file = open_log_file(&nested.to_string_lossy()).expect("open log file");
        assert!(file.is_some());
        assert!(nested.join("ice-server.log").is_file());
    }

    #[test]
    fn empty_log_dir_means_stdout_only() {
        assert!(open_log_file("").expect("no log dir").is_none());
        assert!(open_log_file("   ").expect("blank log dir").is_none());
    }

    #[test]
    fn flag_values() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(flag_enabled(value), "{value}");
        }
        for value in ["0", "false", "", "enabled"] {
            assert!(!flag_enabled(value), "{value}");
        }
    }
}
