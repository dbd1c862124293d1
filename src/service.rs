//! One supervised proxy process for one environment on this host.
//!
//! `Service::launch` is the only place a proxy is started. It never returns while a
//! half-started process is still running: every failure path (early exit, readiness budget
//! exhausted, caller interrupted, error while polling) terminates the child first.
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use crate::context::Context;
use crate::env::Environment;
use crate::errors::{Result, SlashError};
use crate::interrupt::InterruptGuard;
use crate::port::PortAllocator;
use crate::process;
use crate::registry::{Controller, Registry, RegistryGuard, ServiceRecord};

pub const SERVICE_LOG: &str = "service.log";

/// Slice used while waiting between readiness probes so interruption is noticed quickly.
const POLL_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    env_dir: PathBuf,
    record: ServiceRecord,
    state: ServiceState,
}

/// Kills the half-started proxy unless disarmed.
struct LaunchGuard<'a> {
    ctx: &'a Context,
    pid: u32,
    armed: bool,
}

impl Drop for LaunchGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("terminating half-started proxy pid {}", self.pid);
        if let Err(e) = process::terminate(self.pid) {
            warn!("failed to terminate pid {}: {e}", self.pid);
        }
        let s = &self.ctx.settings;
        if !process::wait_gone(self.pid, s.stop_timeout, s.stop_poll) {
            let _ = process::force_kill(self.pid);
            if !process::wait_gone(self.pid, s.stop_timeout, s.stop_poll) {
                warn!("pid {} survived SIGKILL", self.pid);
            }
        }
    }
}

enum Wait {
    Running,
    Exited(Option<ExitStatus>),
    Interrupted,
}

/// Wait up to `total` for the child to exit, checking the interrupt flag every slice.
fn wait_slice(child: &mut Child, total: Duration, interrupt: &InterruptGuard) -> Wait {
    let deadline = Instant::now() + total;
    loop {
        if interrupt.interrupted() {
            return Wait::Interrupted;
        }
        let now = Instant::now();
        if now >= deadline {
            return Wait::Running;
        }
        match child.wait_timeout(POLL_SLICE.min(deadline - now)) {
            Ok(Some(status)) => return Wait::Exited(Some(status)),
            Ok(None) => {}
            // the child may already have been reaped by a liveness probe
            Err(_) if !process::pid_alive(child.id()) => return Wait::Exited(None),
            Err(e) => {
                debug!("wait on pid {} failed: {e}", child.id());
                thread::sleep(POLL_SLICE.min(deadline.saturating_duration_since(Instant::now())));
            }
        }
    }
}

impl Service {
    /// Allocate ports, configure `env`, spawn the proxy and wait until it is operational.
    #[instrument(skip(ctx, env), fields(env = env.name()), err)]
    pub fn launch(ctx: &Context, env: &mut dyn Environment, job: &str) -> Result<Service> {
        let s = &ctx.settings;
        let alloc = PortAllocator::new(ctx.lock_dir(), s.port_backoff);
        let data = alloc.acquire(s.port_range.clone(), s.port_deadline)?;
        let ctl_lease = if s.controller {
            Some(alloc.acquire(s.port_range.clone(), s.port_deadline)?)
        } else {
            None
        };

        env.set_port(data.port())?;
        let ctl = match &ctl_lease {
            Some(lease) => {
                let secret = env.set_controller(
                    lease.port(),
                    s.controller_ui.as_deref(),
                    s.controller_local_only,
                )?;
                Some(Controller {
                    port: lease.port(),
                    secret,
                })
            }
            None => None,
        };

        let interrupt = InterruptGuard::install();
        let log = env.workdir().join(SERVICE_LOG);
        let mut child = ctx.launcher().spawn(env.workdir(), &log)?;
        let pid = child.id();
        let mut guard = LaunchGuard {
            ctx,
            pid,
            armed: true,
        };
        let port = data.release();
        drop(ctl_lease);
        info!(
            "proxy for environment {} spawned: pid {pid}, port {port}",
            env.name()
        );

        let mut svc = Service {
            env_dir: env.workdir().to_path_buf(),
            record: ServiceRecord {
                pid,
                port,
                ctl,
                jobs: BTreeSet::from([job.to_string()]),
                started: process::process_start_time(pid),
            },
            state: ServiceState::Starting,
        };

        for attempt in 1..=s.launch_retries.max(1) {
            if interrupt.interrupted() {
                return Err(SlashError::Interrupted);
            }
            if svc.is_operational(ctx) {
                guard.armed = false;
                svc.state = ServiceState::Running;
                info!("service established after {attempt} probe(s)");
                if !s.launch_settle.is_zero() {
                    thread::sleep(s.launch_settle);
                }
                return Ok(svc);
            }
            debug!("proxy pid {pid} not operational yet (attempt {attempt})");
            if attempt == s.launch_retries.max(1) {
                break;
            }
            match wait_slice(&mut child, s.launch_interval, &interrupt) {
                Wait::Running => {}
                Wait::Interrupted => return Err(SlashError::Interrupted),
                Wait::Exited(status) => {
                    let how = status.map_or_else(|| "exited".to_string(), |st| format!("exited ({st})"));
                    return Err(SlashError::LaunchFailed(format!(
                        "proxy pid {pid} {how} during startup; see {}",
                        log.display()
                    )));
                }
            }
        }
        Err(SlashError::LaunchFailed(format!(
            "proxy pid {pid} not operational after {} attempts; see {}",
            s.launch_retries.max(1),
            log.display()
        )))
    }

    /// Lock-free read of this host's record; a dead or recycled pid reads as absent.
    pub fn load(ctx: &Context, env_dir: &Path) -> Result<Option<Service>> {
        let record = Registry::new(env_dir).snapshot()?.remove(ctx.hostname());
        Ok(record
            .map(|record| Service::running(env_dir, record))
            .filter(Service::is_alive))
    }

    /// Read under the registry lock, deleting a stale entry on the way.
    pub fn load_locked(ctx: &Context, guard: &RegistryGuard<'_>, env_dir: &Path) -> Result<Option<Service>> {
        let Some(record) = guard.get(ctx.hostname())? else {
            return Ok(None);
        };
        let svc = Service::running(env_dir, record);
        if svc.is_alive() {
            return Ok(Some(svc));
        }
        debug!("dropping stale record for pid {}", svc.pid());
        guard.remove(ctx.hostname())?;
        Ok(None)
    }

    pub fn save(&self, ctx: &Context, guard: &RegistryGuard<'_>) -> Result<()> {
        guard.put(ctx.hostname(), &self.record)
    }

    fn running(env_dir: &Path, record: ServiceRecord) -> Service {
        Service {
            env_dir: env_dir.to_path_buf(),
            record,
            state: ServiceState::Running,
        }
    }

    /// The recorded pid is in the process table and, when known, has the recorded start time.
    pub fn is_alive(&self) -> bool {
        let pid = self.record.pid;
        if !process::pid_alive(pid) {
            return false;
        }
        match (self.record.started, process::process_start_time(pid)) {
            (Some(want), Some(now)) => want == now,
            _ => true,
        }
    }

    pub fn is_operational(&self, ctx: &Context) -> bool {
        self.is_alive()
            && ctx.probe().tcp_reachable(self.record.port)
            && ctx.probe().http_via_proxy(self.record.port)
    }

    /// SIGTERM, then a bounded wait for the pid to disappear.
    #[instrument(skip(self, ctx), fields(pid = self.record.pid), err)]
    pub fn stop(&mut self, ctx: &Context) -> Result<()> {
        if !self.is_alive() {
            self.state = ServiceState::Stopped;
            return Ok(());
        }
        self.state = ServiceState::Stopping;
        let pid = self.record.pid;
        process::terminate(pid)?;
        let s = &ctx.settings;
        if !process::wait_gone(pid, s.stop_timeout, s.stop_poll) {
            return Err(SlashError::StopTimeout {
                pid,
                waited: s.stop_timeout,
            });
        }
        self.state = ServiceState::Stopped;
        info!("service pid {pid} stopped");
        Ok(())
    }

    /// Returns whether the job was newly added.
    pub fn add_job(&mut self, job: &str) -> bool {
        self.record.jobs.insert(job.to_string())
    }

    /// Returns whether the job was present.
    pub fn remove_job(&mut self, job: &str) -> bool {
        self.record.jobs.remove(job)
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub fn port(&self) -> u16 {
        self.record.port
    }

    pub fn controller(&self) -> Option<&Controller> {
        self.record.ctl.as_ref()
    }

    pub fn jobs(&self) -> &BTreeSet<String> {
        &self.record.jobs
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    pub fn state(&self) -> ServiceState {
        self.state
    }

    pub fn env_dir(&self) -> &Path {
        &self.env_dir
    }

    /// `http://127.0.0.1:<port>`, suitable for `http_proxy`/`https_proxy`.
    pub fn proxy_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.record.port)
    }

    /// Dashboard URLs for each host address; empty when no controller is configured.
    pub fn controller_urls(&self, hosts: &[&str]) -> Vec<String> {
        let Some(ctl) = &self.record.ctl else {
            return Vec::new();
        };
        hosts
            .iter()
            .map(|host| {
                format!(
                    "http://{host}:{port}/ui/?hostname={host}&port={port}&secret={secret}",
                    port = ctl.port,
                    secret = urlencoding::encode(&ctl.secret)
                )
            })
            .collect()
    }
}
