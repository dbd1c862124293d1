//! Reference counting over services: one registry per environment, one process per
//! (environment, host), kept alive while at least one job refers to it.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::env::Environment;
use crate::errors::Result;
use crate::process;
use crate::registry::Registry;
use crate::service::Service;

pub struct ServiceManager<'a> {
    ctx: &'a Context,
}

impl<'a> ServiceManager<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        ServiceManager { ctx }
    }

    /// Attach `job` to the live service of `env`, starting one if there is none.
    ///
    /// The registry lock is held across the launch, so a thundering herd of callers for the
    /// same environment starts exactly one process and all of them end up attached to it.
    #[instrument(skip(self, env), fields(env = env.name()), err)]
    pub fn launch(&self, env: &mut dyn Environment, job: &str) -> Result<Service> {
        let env_dir = env.workdir().to_path_buf();
        let registry = Registry::new(&env_dir);
        let guard = registry.lock()?;
        if let Some(mut svc) = Service::load_locked(self.ctx, &guard, &env_dir)? {
            if svc.add_job(job) {
                svc.save(self.ctx, &guard)?;
            }
            info!(
                "job {job} attached to running service pid {} of environment {}",
                svc.pid(),
                env.name()
            );
            return Ok(svc);
        }
        let mut svc = Service::launch(self.ctx, env, job)?;
        if let Err(e) = svc.save(self.ctx, &guard) {
            // an unrecorded process would never be stopped by anyone
            warn!("failed to record service pid {}: {e}; stopping it", svc.pid());
            if let Err(stop_err) = svc.stop(self.ctx) {
                warn!("stop of unrecorded pid {} failed: {stop_err}; killing", svc.pid());
                let _ = process::force_kill(svc.pid());
                let s = &self.ctx.settings;
                let _ = process::wait_gone(svc.pid(), s.stop_timeout, s.stop_poll);
            }
            return Err(e);
        }
        Ok(svc)
    }

    /// Detach `job`; the last job out stops the process and deletes the record.
    /// An unknown environment, a missing service or a job that is not attached is logged and
    /// otherwise ignored.
    pub fn stop(&self, env: &dyn Environment, job: &str) -> Result<()> {
        self.stop_in(env.name(), env.workdir(), job)
    }

    /// Same as [`ServiceManager::stop`], resolving the environment directory by name.
    pub fn stop_by_name(&self, env_name: &str, job: &str) -> Result<()> {
        let dir = self.ctx.envs_dir().join(env_name);
        self.stop_in(env_name, &dir, job)
    }

    #[instrument(skip(self, env_dir), err)]
    fn stop_in(&self, env_name: &str, env_dir: &Path, job: &str) -> Result<()> {
        if !env_dir.is_dir() {
            warn!("environment {env_name} does not exist; nothing to stop");
            return Ok(());
        }
        let registry = Registry::new(env_dir);
        let guard = registry.lock()?;
        let Some(mut svc) = Service::load_locked(self.ctx, &guard, env_dir)? else {
            warn!("service of environment {env_name} is not running");
            return Ok(());
        };
        if !svc.remove_job(job) {
            warn!("job {job} is not attached to the service of environment {env_name}");
            return Ok(());
        }
        if svc.jobs().is_empty() {
            // on failure the record keeps its last job: a live process is never orphaned
            svc.stop(self.ctx)?;
            guard.remove(self.ctx.hostname())?;
            info!("service of environment {env_name} stopped");
        } else {
            svc.save(self.ctx, &guard)?;
            info!(
                "job {job} detached; {} job(s) still hold environment {env_name}",
                svc.jobs().len()
            );
        }
        Ok(())
    }

    /// Live services on this host keyed by environment name, recomputed from disk.
    pub fn services(&self) -> Result<BTreeMap<String, Service>> {
        let mut out = BTreeMap::new();
        let dir = self.ctx.envs_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(svc) = Service::load(self.ctx, &entry.path())? {
                out.insert(name, svc);
            }
        }
        Ok(out)
    }

    /// Live service of a single environment, if any.
    pub fn service(&self, env_name: &str) -> Result<Option<Service>> {
        Service::load(self.ctx, &self.ctx.envs_dir().join(env_name))
    }
}
