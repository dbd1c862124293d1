//! Tracing subscriber setup for the binary (foreground commands and the detached reaper).
use once_cell::sync::OnceCell;
use std::env;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "SLASH_LOG";

static INIT: OnceCell<()> = OnceCell::new();

/// Filter directive: `SLASH_LOG` wins, otherwise `info` (or `debug` when verbose).
pub fn filter_directive(verbose: bool) -> String {
    match env::var(LOG_ENV) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ if verbose => "debug".to_string(),
        _ => "info".to_string(),
    }
}

/// Install the global fmt subscriber writing to stderr. Idempotent.
pub fn init(verbose: bool, ansi: bool) {
    if INIT.get().is_some() {
        return;
    }
    let env_filter = tracing_subscriber::EnvFilter::new(filter_directive(verbose));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false);
    if tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .is_err()
    {
        eprintln!("slash: logging init skipped (global subscriber already set)");
    }
    let _ = INIT.set(());
}
