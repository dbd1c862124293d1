#![allow(clippy::module_name_repetitions)]
//! Tunables for the supervisor: defaults, optional `settings.yaml`, then `SLASH_*` env overrides.
//!
//! Durations accept humantime syntax (`5s`, `250ms`, `1m 30s`). Invalid environment values are
//! reported with a warning and ignored so a typo never blocks a shell from activating.
use serde::Deserialize;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{Result, SlashError};

pub const SETTINGS_FILE: &str = "settings.yaml";
pub const DEFAULT_PORT_RANGE: Range<u16> = 20000..30000;
pub const DEFAULT_PROBE_URL: &str = "https://www.baidu.com";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port_range: Range<u16>,
    /// None retries forever (operator-visible choice).
    pub port_deadline: Option<Duration>,
    pub port_backoff: Duration,
    pub launch_retries: u32,
    pub launch_interval: Duration,
    /// Extra wait after the first successful readiness probe.
    pub launch_settle: Duration,
    pub stop_timeout: Duration,
    pub stop_poll: Duration,
    pub reaper_interval: Duration,
    pub reaper_stop_timeout: Duration,
    pub probe_url: String,
    pub tcp_probe_timeout: Duration,
    pub http_probe_timeout: Duration,
    pub controller: bool,
    pub controller_local_only: bool,
    pub controller_ui: Option<PathBuf>,
    pub proxy_bin: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            port_range: DEFAULT_PORT_RANGE,
            port_deadline: None,
            port_backoff: Duration::from_millis(10),
            launch_retries: 30,
            launch_interval: Duration::from_secs(5),
            launch_settle: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(30),
            stop_poll: Duration::from_millis(200),
            reaper_interval: Duration::from_secs(60),
            reaper_stop_timeout: Duration::from_secs(30),
            probe_url: DEFAULT_PROBE_URL.to_string(),
            tcp_probe_timeout: Duration::from_secs(3),
            http_probe_timeout: Duration::from_secs(5),
            controller: true,
            controller_local_only: true,
            controller_ui: None,
            proxy_bin: None,
        }
    }
}

/// On-disk shape of `settings.yaml`; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct SettingsFile {
    port_range: Option<String>,
    port_deadline: Option<String>,
    launch_retries: Option<u32>,
    launch_interval: Option<String>,
    launch_settle: Option<String>,
    stop_timeout: Option<String>,
    reaper_interval: Option<String>,
    reaper_stop_timeout: Option<String>,
    probe_url: Option<String>,
    tcp_probe_timeout: Option<String>,
    http_probe_timeout: Option<String>,
    controller: Option<bool>,
    controller_local_only: Option<bool>,
    controller_ui: Option<PathBuf>,
    proxy_bin: Option<PathBuf>,
}

impl Settings {
    /// Defaults, then `<work_dir>/settings.yaml` if present, then process environment.
    pub fn load(work_dir: &Path) -> Result<Settings> {
        let mut s = Settings::default();
        let path = work_dir.join(SETTINGS_FILE);
        if path.exists() {
            let text = fs::read_to_string(&path)?;
            s.apply_yaml(&text)?;
        }
        s.apply_env_from(|k| std::env::var(k).ok());
        Ok(s)
    }

    fn apply_yaml(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Ok(());
        }
        let f: SettingsFile = serde_yaml::from_str(text)?;
        let dur = |key: &str, v: &Option<String>| -> Result<Option<Duration>> {
            match v {
                Some(raw) => parse_duration(raw)
                    .map(Some)
                    .ok_or_else(|| SlashError::Message(format!("{SETTINGS_FILE}: invalid duration for {key}: {raw}"))),
                None => Ok(None),
            }
        };
        if let Some(raw) = &f.port_range {
            self.port_range = parse_port_range(raw).ok_or_else(|| {
                SlashError::Message(format!("{SETTINGS_FILE}: invalid port-range: {raw}"))
            })?;
        }
        if let Some(d) = dur("port-deadline", &f.port_deadline)? {
            self.port_deadline = Some(d);
        }
        if let Some(n) = f.launch_retries {
            self.launch_retries = n.max(1);
        }
        if let Some(d) = dur("launch-interval", &f.launch_interval)? {
            self.launch_interval = d;
        }
        if let Some(d) = dur("launch-settle", &f.launch_settle)? {
            self.launch_settle = d;
        }
        if let Some(d) = dur("stop-timeout", &f.stop_timeout)? {
            self.stop_timeout = d;
        }
        if let Some(d) = dur("reaper-interval", &f.reaper_interval)? {
            self.reaper_interval = d;
        }
        if let Some(d) = dur("reaper-stop-timeout", &f.reaper_stop_timeout)? {
            self.reaper_stop_timeout = d;
        }
        if let Some(u) = f.probe_url {
            self.probe_url = u;
        }
        if let Some(d) = dur("tcp-probe-timeout", &f.tcp_probe_timeout)? {
            self.tcp_probe_timeout = d;
        }
        if let Some(d) = dur("http-probe-timeout", &f.http_probe_timeout)? {
            self.http_probe_timeout = d;
        }
        if let Some(b) = f.controller {
            self.controller = b;
        }
        if let Some(b) = f.controller_local_only {
            self.controller_local_only = b;
        }
        if f.controller_ui.is_some() {
            self.controller_ui = f.controller_ui;
        }
        if f.proxy_bin.is_some() {
            self.proxy_bin = f.proxy_bin;
        }
        Ok(())
    }

    /// Apply `SLASH_*` overrides through a lookup function (the process env in production).
    pub fn apply_env_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let dur = |k: &str| -> Option<Duration> {
            let raw = get(k)?;
            let d = parse_duration(&raw);
            if d.is_none() {
                tracing::warn!("ignoring {k}={raw}: not a duration");
            }
            d
        };

        if let Some(raw) = get("SLASH_PORT_RANGE") {
            match parse_port_range(&raw) {
                Some(r) => self.port_range = r,
                None => tracing::warn!("ignoring SLASH_PORT_RANGE={raw}: expected <start>-<end>"),
            }
        }
        if let Some(raw) = get("SLASH_PORT_DEADLINE") {
            if raw == "none" || raw == "0" {
                self.port_deadline = None;
            } else if let Some(d) = dur("SLASH_PORT_DEADLINE") {
                self.port_deadline = Some(d);
            }
        }
        if let Some(raw) = get("SLASH_LAUNCH_RETRIES") {
            match raw.parse::<u32>() {
                Ok(n) => self.launch_retries = n.max(1),
                Err(_) => tracing::warn!("ignoring SLASH_LAUNCH_RETRIES={raw}: not a number"),
            }
        }
        if let Some(d) = dur("SLASH_LAUNCH_INTERVAL") {
            self.launch_interval = d;
        }
        if let Some(d) = dur("SLASH_LAUNCH_SETTLE") {
            self.launch_settle = d;
        }
        if let Some(d) = dur("SLASH_STOP_TIMEOUT") {
            self.stop_timeout = d;
        }
        if let Some(d) = dur("SLASH_REAPER_INTERVAL") {
            self.reaper_interval = d;
        }
        if let Some(d) = dur("SLASH_REAPER_STOP_TIMEOUT") {
            self.reaper_stop_timeout = d;
        }
        if let Some(u) = get("SLASH_PROBE_URL") {
            self.probe_url = u;
        }
        if let Some(raw) = get("SLASH_CONTROLLER") {
            self.controller = raw != "0";
        }
        if let Some(p) = get("SLASH_PROXY_BIN") {
            self.proxy_bin = Some(PathBuf::from(p));
        }
    }
}

pub fn parse_duration(raw: &str) -> Option<Duration> {
    humantime::parse_duration(raw.trim()).ok()
}

/// Parse `20000-30000` (end exclusive) into a non-empty range.
pub fn parse_port_range(raw: &str) -> Option<Range<u16>> {
    let (a, b) = raw.trim().split_once('-')?;
    let start: u16 = a.trim().parse().ok()?;
    let end: u16 = b.trim().parse().ok()?;
    if start == 0 || start >= end {
        return None;
    }
    Some(start..end)
}
