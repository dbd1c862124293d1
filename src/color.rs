#![allow(clippy::module_name_repetitions)]
//! Colour policy for the CLI's stderr one-liners and the tracing subscriber.
//!
//! Precedence: `NO_COLOR` disables, then `--color`, then `SLASH_COLOR`, then TTY detection.
//! Status tables and JSON on stdout are never painted.

use clap::ValueEnum;
use once_cell::sync::OnceCell;

pub const COLOR_ENV: &str = "SLASH_COLOR";

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum ColorMode {
    Auto,
    Always,
    Never,
}

static COLOR_MODE: OnceCell<ColorMode> = OnceCell::new();

pub fn set_color_mode(mode: ColorMode) {
    let _ = COLOR_MODE.set(mode);
}

fn parse_color_mode(s: &str) -> Option<ColorMode> {
    match s.trim().to_ascii_lowercase().as_str() {
        "auto" => Some(ColorMode::Auto),
        "always" | "on" | "true" | "yes" => Some(ColorMode::Always),
        "never" | "off" | "false" | "no" => Some(ColorMode::Never),
        _ => None,
    }
}

fn resolve(no_color: bool, cli: Option<ColorMode>, env: Option<&str>, is_tty: bool) -> bool {
    if no_color {
        return false;
    }
    let mode = cli.or_else(|| env.and_then(parse_color_mode));
    match mode {
        Some(ColorMode::Always) => true,
        Some(ColorMode::Never) => false,
        Some(ColorMode::Auto) | None => is_tty,
    }
}

fn color_enabled_for(is_tty: bool) -> bool {
    // https://no-color.org/
    let no_color = std::env::var_os("NO_COLOR").is_some();
    let env = std::env::var(COLOR_ENV).ok();
    resolve(no_color, COLOR_MODE.get().copied(), env.as_deref(), is_tty)
}

pub fn color_enabled_stderr() -> bool {
    color_enabled_for(atty::is(atty::Stream::Stderr))
}

/// Wrap `s` in an ANSI sequence when enabled.
pub fn paint(enabled: bool, code: &str, s: &str) -> String {
    if enabled {
        format!("{code}{s}\x1b[0m")
    } else {
        s.to_string()
    }
}

pub fn log_info_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[36;1m", msg));
}

pub fn log_warn_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[33m", msg));
}

pub fn log_error_stderr(use_color: bool, msg: &str) {
    eprintln!("{}", paint(use_color, "\x1b[31;1m", msg));
}
