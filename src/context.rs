//! Explicit runtime context: paths, host identity, settings and the two external collaborators.
//!
//! Built once per invocation and passed by reference into every component.
use std::env;
use std::net::{IpAddr, Ipv4Addr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Settings;
use crate::errors::{Result, SlashError};
use crate::process::{Launcher, ProxyLauncher};
use crate::probe::{NetProbe, Probe};

pub const HOME_ENV: &str = "SLASH_HOME";
pub const ENVS_DIR: &str = "envs";
pub const LOCKS_DIR: &str = "locks";

pub struct Context {
    work_dir: PathBuf,
    hostname: String,
    pub settings: Settings,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn Probe>,
    reaper_exe: PathBuf,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("work_dir", &self.work_dir)
            .field("hostname", &self.hostname)
            .field("settings", &self.settings)
            .field("launcher", &self.launcher.describe())
            .field("reaper_exe", &self.reaper_exe)
            .finish()
    }
}

/// `$SLASH_HOME`, else `~/.cache/slash`.
pub fn default_work_dir() -> Result<PathBuf> {
    if let Ok(v) = env::var(HOME_ENV) {
        if !v.trim().is_empty() {
            return Ok(PathBuf::from(v.trim()));
        }
    }
    let home = home::home_dir().ok_or_else(|| SlashError::NotFound("home directory".into()))?;
    Ok(home.join(".cache").join("slash"))
}

pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// First address `host` resolves to, preferring IPv4.
pub fn resolve_host(host: &str) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = (host, 0).to_socket_addrs().ok()?.map(|a| a.ip()).collect();
    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}

impl Context {
    /// Production context: default work dir, settings from disk and env, real collaborators.
    pub fn from_env() -> Result<Context> {
        let work_dir = default_work_dir()?;
        let settings = Settings::load(&work_dir)?;
        Ok(ContextBuilder::new(work_dir).settings(settings).build())
    }

    pub fn builder(work_dir: impl Into<PathBuf>) -> ContextBuilder {
        ContextBuilder::new(work_dir.into())
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn envs_dir(&self) -> PathBuf {
        self.work_dir.join(ENVS_DIR)
    }

    /// Directory holding per-port allocation locks.
    pub fn lock_dir(&self) -> PathBuf {
        self.work_dir.join(LOCKS_DIR)
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Hosts the controller dashboard is reachable on: loopback, then this host's address.
    pub fn dashboard_hosts(&self) -> Vec<String> {
        let mut hosts = vec![Ipv4Addr::LOCALHOST.to_string()];
        if let Some(ip) = resolve_host(&self.hostname) {
            if !ip.is_loopback() {
                hosts.push(ip.to_string());
            }
        }
        hosts
    }

    pub fn launcher(&self) -> &dyn Launcher {
        self.launcher.as_ref()
    }

    pub fn probe(&self) -> &dyn Probe {
        self.probe.as_ref()
    }

    /// Executable re-invoked as `<exe> reaper run ...` for the detached reaper.
    pub fn reaper_exe(&self) -> &Path {
        &self.reaper_exe
    }
}

pub struct ContextBuilder {
    work_dir: PathBuf,
    hostname: Option<String>,
    settings: Option<Settings>,
    launcher: Option<Arc<dyn Launcher>>,
    probe: Option<Arc<dyn Probe>>,
    reaper_exe: Option<PathBuf>,
}

impl ContextBuilder {
    fn new(work_dir: PathBuf) -> Self {
        ContextBuilder {
            work_dir,
            hostname: None,
            settings: None,
            launcher: None,
            probe: None,
            reaper_exe: None,
        }
    }

    pub fn hostname(mut self, host: impl Into<String>) -> Self {
        self.hostname = Some(host.into());
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn reaper_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.reaper_exe = Some(exe.into());
        self
    }

    pub fn build(self) -> Context {
        let settings = self.settings.unwrap_or_default();
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProxyLauncher::new(settings.proxy_bin.clone())));
        let probe = self.probe.unwrap_or_else(|| {
            Arc::new(NetProbe::new(
                settings.probe_url.clone(),
                settings.tcp_probe_timeout,
                settings.http_probe_timeout,
            ))
        });
        let reaper_exe = self
            .reaper_exe
            .or_else(|| env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("slash"));
        Context {
            work_dir: self.work_dir,
            hostname: self.hostname.unwrap_or_else(local_hostname),
            settings,
            launcher,
            probe,
            reaper_exe,
        }
    }
}
