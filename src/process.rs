//! OS process helpers: detached spawn, liveness, start-time tokens and bounded termination.
//!
//! Liveness is a process-table probe (`kill(pid, 0)`). A pid that belongs to one of our own
//! exited children would linger as a zombie and still answer the probe, so it is reaped first.
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Executable names looked up on PATH when no explicit proxy binary is configured.
pub const PROXY_CANDIDATES: &[&str] = &["mihomo", "clash-meta", "clash"];

/// Spawn `cmd` in its own session with stdin closed and stdout/stderr appended to `log`.
pub fn spawn_detached(mut cmd: Command, log: &Path) -> io::Result<Child> {
    if let Some(parent) = log.parent() {
        fs::create_dir_all(parent)?;
    }
    let out = OpenOptions::new().create(true).append(true).open(log)?;
    let err = out.try_clone()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(out))
        .stderr(Stdio::from(err));
    // SAFETY: setsid is async-signal-safe and touches no parent state.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(io::Error::from)?;
            Ok(())
        });
    }
    cmd.spawn()
}

/// Reap `pid` if it is an exited child of this process; no-op for foreign pids.
fn reap_if_child(pid: u32) {
    let _ = waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG));
}

/// True iff the process table still reports `pid`.
pub fn pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    reap_if_child(pid);
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => !is_zombie(pid),
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Foreign zombies (children of someone else that were not reaped yet) are gone for our purposes.
fn is_zombie(pid: u32) -> bool {
    proc_stat_fields(pid)
        .and_then(|f| f.first().map(|s| s == "Z"))
        .unwrap_or(false)
}

/// Fields of `/proc/<pid>/stat` after the parenthesised command name (state is index 0).
fn proc_stat_fields(pid: u32) -> Option<Vec<String>> {
    let raw = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let rest = &raw[raw.rfind(')')? + 1..];
    Some(rest.split_whitespace().map(str::to_string).collect())
}

/// Process start time in clock ticks since boot (field 22 of `/proc/<pid>/stat`).
/// Used as a generation token so a recycled pid is not mistaken for the recorded process.
pub fn process_start_time(pid: u32) -> Option<u64> {
    // field 22 overall == index 19 after the command name (fields 3.. map to 0..)
    proc_stat_fields(pid)?.get(19)?.parse().ok()
}

/// Send SIGTERM; a pid that is already gone is not an error.
pub fn terminate(pid: u32) -> io::Result<()> {
    signal(pid, Signal::SIGTERM)
}

pub fn force_kill(pid: u32) -> io::Result<()> {
    signal(pid, Signal::SIGKILL)
}

fn signal(pid: u32, sig: Signal) -> io::Result<()> {
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(io::Error::from(e)),
    }
}

/// Poll until `pid` disappears. Returns false when `timeout` elapsed first.
pub fn wait_gone(pid: u32, timeout: Duration, poll: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if !pid_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(poll);
    }
}

/// Process-launch collaborator: starts the proxy executable for one environment directory.
pub trait Launcher: Send + Sync {
    fn spawn(&self, workdir: &Path, log: &Path) -> io::Result<Child>;

    /// Human-readable description for diagnostics.
    fn describe(&self) -> String;
}

/// Production launcher: `<executable> -d <env_dir>`, detached.
#[derive(Debug, Clone)]
pub struct ProxyLauncher {
    executable: Option<PathBuf>,
}

impl ProxyLauncher {
    pub fn new(configured: Option<PathBuf>) -> Self {
        ProxyLauncher {
            executable: configured,
        }
    }

    /// Resolve the proxy executable: configured path, baked-in default, then PATH lookup.
    pub fn executable(&self) -> io::Result<PathBuf> {
        if let Some(p) = &self.executable {
            return if p.exists() {
                Ok(p.clone())
            } else {
                which::which(p).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("proxy executable not found: {}", p.display()),
                    )
                })
            };
        }
        if let Some(p) = option_env!("SLASH_DEFAULT_PROXY_BIN") {
            let p = PathBuf::from(p);
            if p.exists() {
                return Ok(p);
            }
        }
        for name in PROXY_CANDIDATES {
            if let Ok(p) = which::which(name) {
                return Ok(p);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "proxy executable not found (looked for {} on PATH; set SLASH_PROXY_BIN)",
                PROXY_CANDIDATES.join(", ")
            ),
        ))
    }
}

impl Launcher for ProxyLauncher {
    fn spawn(&self, workdir: &Path, log: &Path) -> io::Result<Child> {
        let exe = self.executable()?;
        let mut cmd = Command::new(exe);
        cmd.arg("-d").arg(workdir).current_dir(workdir);
        spawn_detached(cmd, log)
    }

    fn describe(&self) -> String {
        match self.executable() {
            Ok(p) => p.display().to_string(),
            Err(e) => format!("unavailable ({e})"),
        }
    }
}
