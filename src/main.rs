mod backup;
mod calc;
mod config;
mod db;
mod gradebook;
mod ipc;
mod remote;
mod sync;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use config::Config;
use tracing::{info, warn};

fn main() {
    // Optional global config path as the first argument; workspaces can add their own.
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let (config, config_error) = match config_path.as_deref().map(Config::load) {
        Some(Ok(c)) => (c, None),
        Some(Err(e)) => (Config::default(), Some(format!("{e:#}"))),
        None => (Config::default(), None),
    };
    let config = config.with_env_overrides();

    // stdout carries the protocol, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();

    info!("rapord v{} starting", env!("CARGO_PKG_VERSION"));
    if let Some(e) = config_error {
        warn!(error = %e, "config file ignored, using defaults");
    }

    let mut state = ipc::AppState::new(config);

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(v) => v,
            Err(_) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let req: ipc::Request = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                // Can't reply without id.
                let resp = serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                });
                let _ = writeln!(stdout, "{}", resp);
                let _ = stdout.flush();
                continue;
            }
        };

        let resp = ipc::handle_request(&mut state, req);
        let _ = writeln!(
            stdout,
            "{}",
            serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
        );
        let _ = stdout.flush();
    }
    info!("stdin closed, shutting down");
}
