/*!
Test support helpers shared across integration tests.

- SleepLauncher: stands in for the proxy with a detached `sleep`, recording spawned pids
- FixedProbe: health probe that always (or never) reports the port as healthy
- fast_settings()/context(): a Context rooted in a temp dir with short waits
- create_env(): a fresh environment with the default config
- dead_pid(): a pid that certainly belonged to a process that has exited
*/

use std::io;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use slash::process::spawn_detached;
use slash::{Context, Env, EnvsManager, Launcher, Probe, Settings};

/// Launcher that spawns `sleep 3600` detached and remembers every pid.
#[allow(dead_code)]
#[derive(Default)]
pub struct SleepLauncher {
    pub spawned: Mutex<Vec<u32>>,
    /// Program to run instead of `sleep 3600` (e.g. `true` to simulate an early exit).
    pub program: Option<&'static str>,
    /// Arguments passed to `program`.
    pub args: &'static [&'static str],
}

impl Launcher for SleepLauncher {
    fn spawn(&self, _workdir: &Path, log: &Path) -> io::Result<Child> {
        let cmd = match self.program {
            Some(p) => {
                let mut c = Command::new(p);
                c.args(self.args);
                c
            }
            None => {
                let mut c = Command::new("sleep");
                c.arg("3600");
                c
            }
        };
        let child = spawn_detached(cmd, log)?;
        self.spawned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(child.id());
        Ok(child)
    }

    fn describe(&self) -> String {
        "sleep (test)".to_string()
    }
}

#[allow(dead_code)]
impl SleepLauncher {
    pub fn pids(&self) -> Vec<u32> {
        self.spawned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Probe with a fixed verdict.
#[allow(dead_code)]
pub struct FixedProbe(pub bool);

impl Probe for FixedProbe {
    fn tcp_reachable(&self, _port: u16) -> bool {
        self.0
    }

    fn http_via_proxy(&self, _port: u16) -> bool {
        self.0
    }
}

/// Settings with short waits so failure paths finish quickly.
#[allow(dead_code)]
pub fn fast_settings() -> Settings {
    Settings {
        launch_settle: Duration::ZERO,
        port_deadline: Some(Duration::from_secs(10)),
        launch_retries: 3,
        launch_interval: Duration::from_millis(50),
        stop_timeout: Duration::from_secs(5),
        stop_poll: Duration::from_millis(20),
        reaper_interval: Duration::from_millis(100),
        reaper_stop_timeout: Duration::from_secs(10),
        ..Settings::default()
    }
}

#[allow(dead_code)]
pub fn context_with(
    work_dir: &Path,
    launcher: Arc<dyn Launcher>,
    probe: Arc<dyn Probe>,
) -> Context {
    Context::builder(work_dir)
        .hostname("test-host")
        .settings(fast_settings())
        .launcher(launcher)
        .probe(probe)
        .build()
}

/// Healthy context: sleep launcher plus an always-up probe.
#[allow(dead_code)]
pub fn context(work_dir: &Path) -> (Context, Arc<SleepLauncher>) {
    let launcher = Arc::new(SleepLauncher::default());
    let ctx = context_with(work_dir, launcher.clone(), Arc::new(FixedProbe(true)));
    (ctx, launcher)
}

#[allow(dead_code)]
pub fn create_env(ctx: &Context, name: &str) -> Env {
    let mut envs = EnvsManager::load(ctx).expect("load envs");
    if envs.get(name).is_none() {
        envs.create(name, Vec::new()).expect("create env");
    }
    envs.require(name).expect("env exists")
}

/// Pid of a child that has exited and been reaped.
#[allow(dead_code)]
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().expect("spawn true");
    let pid = child.id();
    child.wait().expect("wait true");
    pid
}

/// Best-effort SIGKILL for cleanup after a failed assertion.
#[allow(dead_code)]
pub fn kill_quietly(pid: u32) {
    let _ = slash::process::force_kill(pid);
    let _ = slash::process::wait_gone(pid, Duration::from_secs(5), Duration::from_millis(20));
}
