mod support;

use std::fs;
use std::io;
use std::path::Path;
use std::process::{Child, Command};
use std::sync::{Arc, Mutex};

use slash::process::{pid_alive, spawn_detached};
use slash::registry::REGISTRY_FILE;
use slash::{Launcher, ServiceManager};
use support::FixedProbe;

/// Starts `sleep 3600`, then makes the registry file unwritable by turning it into a directory.
#[derive(Default)]
struct BrokenRegistryLauncher {
    spawned: Mutex<Vec<u32>>,
}

impl Launcher for BrokenRegistryLauncher {
    fn spawn(&self, workdir: &Path, log: &Path) -> io::Result<Child> {
        fs::create_dir(workdir.join(REGISTRY_FILE))?;
        let mut cmd = Command::new("sleep");
        cmd.arg("3600");
        let child = spawn_detached(cmd, log)?;
        self.spawned
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(child.id());
        Ok(child)
    }

    fn describe(&self) -> String {
        "sleep with broken registry (test)".to_string()
    }
}

#[test]
fn int_launch_that_cannot_be_recorded_stops_the_process() {
    let td = tempfile::tempdir().expect("tmpdir");
    let launcher = Arc::new(BrokenRegistryLauncher::default());
    let ctx = support::context_with(td.path(), launcher.clone(), Arc::new(FixedProbe(true)));
    let mut env = support::create_env(&ctx, "prod");

    let res = ServiceManager::new(&ctx).launch(&mut env, "job");

    let pids = launcher
        .spawned
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    assert_eq!(pids.len(), 1);
    let alive = pid_alive(pids[0]);
    if alive {
        support::kill_quietly(pids[0]);
    }
    assert!(res.is_err(), "saving into a directory must fail");
    assert!(!alive, "unrecorded process must not outlive the failed launch");
}
