//! Detached reaper: evicts jobs whose owning client disappeared without detaching.
//!
//! There is no permanent control process. The first caller that finds no reaper running
//! starts one (check-and-set under `<work_dir>/reaper.lock`); the reaper waits until that
//! caller is gone, then sweeps every interval until a sweep finds no job it understands.
//! `<work_dir>/reaper.json` maps policy name to the pid of its reaper.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, instrument, warn};

use crate::context::{Context, HOME_ENV};
use crate::errors::{Result, SlashError};
use crate::interrupt::InterruptGuard;
use crate::job::{parse_pid_job, TAG_SHELL};
use crate::lock::{lock_path_for, FileLock};
use crate::manager::ServiceManager;
use crate::process;
use crate::registry::{read_json, write_json};

pub const REAPER_FILE: &str = "reaper.json";
pub const REAPER_LOG: &str = "reaper.log";

/// Longest single sleep while waiting, so SIGTERM is honoured promptly.
const WAKE_SLICE: Duration = Duration::from_secs(1);

/// How a reaper recognises the jobs it owns and decides whether their owner is gone.
pub trait ReaperPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Owner id encoded in `job`, or `None` when the job follows another convention.
    fn extract_owner_id(&self, job: &str) -> Option<u32>;

    fn is_owner_alive(&self, owner: u32) -> bool;
}

/// Jobs named `__pid_<pid>_<tag>__`, owned by the process `<pid>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessPolicy;

impl ReaperPolicy for ProcessPolicy {
    fn name(&self) -> &'static str {
        "pid"
    }

    fn extract_owner_id(&self, job: &str) -> Option<u32> {
        parse_pid_job(job).map(|(pid, _)| pid)
    }

    fn is_owner_alive(&self, owner: u32) -> bool {
        process::pid_alive(owner)
    }
}

static POLICIES: &[&dyn ReaperPolicy] = &[&ProcessPolicy];

pub fn policies() -> &'static [&'static dyn ReaperPolicy] {
    POLICIES
}

pub fn policy_by_name(name: &str) -> Option<&'static dyn ReaperPolicy> {
    POLICIES.iter().copied().find(|p| p.name() == name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaperState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl std::fmt::Display for ReaperState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReaperState::NotStarted => "not started",
            ReaperState::Starting => "starting",
            ReaperState::Running => "running",
            ReaperState::Stopping => "stopping",
            ReaperState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

type ReaperMap = BTreeMap<String, u32>;

fn descriptor_path(ctx: &Context) -> PathBuf {
    ctx.work_dir().join(REAPER_FILE)
}

fn lock_descriptor(ctx: &Context) -> Result<FileLock> {
    Ok(FileLock::acquire(&lock_path_for(&descriptor_path(ctx)))?)
}

/// Outcome of one sweep over all environments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs this policy recognised.
    pub matched: usize,
    /// Recognised jobs whose owner was gone and that were detached.
    pub evicted: usize,
}

/// The loop run inside the detached reaper process.
pub struct Reaper<'a> {
    ctx: &'a Context,
    policy: &'static dyn ReaperPolicy,
    state: ReaperState,
}

impl<'a> Reaper<'a> {
    pub fn new(ctx: &'a Context, policy: &'static dyn ReaperPolicy) -> Self {
        Reaper {
            ctx,
            policy,
            state: ReaperState::NotStarted,
        }
    }

    pub fn state(&self) -> ReaperState {
        self.state
    }

    /// Record our pid, wait for `owner` to exit, then sweep until nothing is left to watch.
    pub fn run(&mut self, owner: u32) -> Result<()> {
        let interrupt = InterruptGuard::install();
        let me = std::process::id();
        self.state = ReaperState::Starting;
        {
            let _lock = lock_descriptor(self.ctx)?;
            let mut map: ReaperMap = read_json(&descriptor_path(self.ctx))?;
            map.insert(self.policy.name().to_string(), me);
            write_json(&descriptor_path(self.ctx), &map)?;
        }
        self.state = ReaperState::Running;
        info!(
            "reaper '{}' running as pid {me}, waiting for pid {owner} to exit",
            self.policy.name()
        );

        let interval = self.ctx.settings.reaper_interval;
        let mut stop = false;
        while process::pid_alive(owner) {
            if !sleep_unless_interrupted(interval.min(WAKE_SLICE), &interrupt) {
                stop = true;
                break;
            }
        }

        while !stop {
            match self.sweep() {
                Ok(report) if report.matched == 0 => {
                    info!("no jobs left to monitor, reaper exits");
                    break;
                }
                Ok(report) => info!(
                    "sweep done: {} job(s) monitored, {} evicted",
                    report.matched, report.evicted
                ),
                Err(e) => error!("sweep failed: {e}"),
            }
            stop = !sleep_unless_interrupted(interval, &interrupt);
        }
        if stop {
            info!("reaper interrupted");
        }

        self.state = ReaperState::Stopping;
        self.clear_own_record(me)?;
        self.state = ReaperState::Stopped;
        Ok(())
    }

    /// One pass over all services: detach every recognised job whose owner is gone.
    #[instrument(skip(self), fields(policy = self.policy.name()))]
    pub fn sweep(&self) -> Result<SweepReport> {
        let mgr = ServiceManager::new(self.ctx);
        let mut report = SweepReport::default();
        for (env_name, svc) in mgr.services()? {
            for job in svc.jobs() {
                let Some(owner) = self.policy.extract_owner_id(job) else {
                    continue;
                };
                report.matched += 1;
                if self.policy.is_owner_alive(owner) {
                    continue;
                }
                if matches!(parse_pid_job(job), Some((_, TAG_SHELL))) {
                    warn!(
                        "shell pid {owner} exited while holding environment {env_name}. \
                         Forgot to run `slash stop` in other shells?"
                    );
                }
                info!("evicting job {job} from environment {env_name}: owner {owner} is gone");
                match mgr.stop_by_name(&env_name, job) {
                    Ok(()) => report.evicted += 1,
                    Err(e) => error!("failed to evict job {job} from {env_name}: {e}"),
                }
            }
        }
        Ok(report)
    }

    fn clear_own_record(&self, me: u32) -> Result<()> {
        let _lock = lock_descriptor(self.ctx)?;
        let path = descriptor_path(self.ctx);
        let mut map: ReaperMap = read_json(&path)?;
        if map.get(self.policy.name()) == Some(&me) {
            map.remove(self.policy.name());
            write_json(&path, &map)?;
        }
        Ok(())
    }
}

/// False when interrupted before `total` elapsed.
fn sleep_unless_interrupted(total: Duration, interrupt: &InterruptGuard) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if interrupt.interrupted() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep(WAKE_SLICE.min(deadline - now));
    }
}

/// Client-side handle: start, stop and inspect the reaper of one policy.
pub struct ReaperSupervisor<'a> {
    ctx: &'a Context,
    policy: &'static dyn ReaperPolicy,
}

impl<'a> ReaperSupervisor<'a> {
    pub fn new(ctx: &'a Context, policy: &'static dyn ReaperPolicy) -> Self {
        ReaperSupervisor { ctx, policy }
    }

    /// Live reaper pid, if one is recorded.
    pub fn pid(&self) -> Result<Option<u32>> {
        let map: ReaperMap = read_json(&descriptor_path(self.ctx))?;
        Ok(map
            .get(self.policy.name())
            .copied()
            .filter(|pid| process::pid_alive(*pid)))
    }

    pub fn state(&self) -> Result<ReaperState> {
        Ok(match self.pid()? {
            Some(_) => ReaperState::Running,
            None => ReaperState::NotStarted,
        })
    }

    /// Start a reaper unless a live one is recorded; returns the reaper pid either way.
    ///
    /// The check, the spawn and the record happen under the descriptor lock, so concurrent
    /// callers cannot both spawn.
    #[instrument(skip(self), fields(policy = self.policy.name()), err)]
    pub fn start(&self) -> Result<u32> {
        let _lock = lock_descriptor(self.ctx)?;
        let path = descriptor_path(self.ctx);
        let mut map: ReaperMap = read_json(&path)?;
        if let Some(pid) = map.get(self.policy.name()).copied() {
            if process::pid_alive(pid) {
                return Ok(pid);
            }
        }

        let owner = std::process::id();
        let mut cmd = Command::new(self.ctx.reaper_exe());
        cmd.arg("reaper")
            .arg("run")
            .arg("--policy")
            .arg(self.policy.name())
            .arg("--owner")
            .arg(owner.to_string())
            .env(HOME_ENV, self.ctx.work_dir());
        let child = process::spawn_detached(cmd, &self.ctx.work_dir().join(REAPER_LOG))
            .map_err(|e| {
                SlashError::Message(format!(
                    "failed to spawn reaper {}: {e}",
                    self.ctx.reaper_exe().display()
                ))
            })?;
        let pid = child.id();
        map.insert(self.policy.name().to_string(), pid);
        write_json(&path, &map)?;
        info!("reaper '{}' started as pid {pid}", self.policy.name());
        Ok(pid)
    }

    /// SIGTERM the recorded reaper and wait (bounded) for it to go away.
    #[instrument(skip(self), fields(policy = self.policy.name()), err)]
    pub fn stop(&self) -> Result<()> {
        let Some(pid) = self.pid()? else {
            self.clear_record(None)?;
            return Ok(());
        };
        process::terminate(pid)?;
        let s = &self.ctx.settings;
        if !process::wait_gone(pid, s.reaper_stop_timeout, s.stop_poll) {
            return Err(SlashError::StopTimeout {
                pid,
                waited: s.reaper_stop_timeout,
            });
        }
        // a reaper killed before it could clean up leaves its record behind
        self.clear_record(Some(pid))?;
        info!("reaper '{}' (pid {pid}) stopped", self.policy.name());
        Ok(())
    }

    /// Remove the record if it names `pid` (any dead pid when `None`).
    fn clear_record(&self, pid: Option<u32>) -> Result<()> {
        let _lock = lock_descriptor(self.ctx)?;
        let path = descriptor_path(self.ctx);
        let mut map: ReaperMap = read_json(&path)?;
        let Some(recorded) = map.get(self.policy.name()).copied() else {
            return Ok(());
        };
        let clear = match pid {
            Some(p) => p == recorded,
            None => !process::pid_alive(recorded),
        };
        if clear {
            map.remove(self.policy.name());
            write_json(&path, &map)?;
        }
        Ok(())
    }
}
