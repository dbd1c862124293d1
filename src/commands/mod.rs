use std::collections::BTreeMap;
use std::process::{Command, ExitCode};

use anyhow::Context as _;
use serde::Serialize;
use slash::interrupt::InterruptGuard;
use slash::{
    parse_pid_job, pid_job, policy_by_name, Context, Environment, EnvsManager, ReaperPolicy,
    ReaperSupervisor, Reaper, Service, ServiceManager, SlashError, TAG_SHELL, TAG_WITH,
};

use crate::cli::{EnvCmd, ReaperCmd};

/// Proxy variables exported to `slash run` children.
const PROXY_VARS: &[&str] = &[
    "http_proxy",
    "https_proxy",
    "all_proxy",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "ALL_PROXY",
];

fn policy(name: &str) -> slash::Result<&'static dyn ReaperPolicy> {
    policy_by_name(name).ok_or_else(|| SlashError::NotFound(format!("reaper policy '{name}'")))
}

fn ensure_reaper(ctx: &Context, job: &str) -> slash::Result<()> {
    if parse_pid_job(job).is_some() {
        ReaperSupervisor::new(ctx, policy("pid")?).start()?;
    }
    Ok(())
}

fn describe_service(ctx: &Context, name: &str, svc: &Service) {
    let use_err = slash::color_enabled_stderr();
    slash::log_info_stderr(
        use_err,
        &format!(
            "slash: environment {name} served by pid {} on port {}",
            svc.pid(),
            svc.port()
        ),
    );
    let hosts = ctx.dashboard_hosts();
    let hosts: Vec<&str> = hosts.iter().map(String::as_str).collect();
    for url in svc.controller_urls(&hosts) {
        eprintln!("  dashboard: {url}");
    }
    eprintln!("  jobs: {}", join_jobs(svc));
    eprintln!("  host: {}", ctx.hostname());
}

fn join_jobs(svc: &Service) -> String {
    svc.jobs().iter().cloned().collect::<Vec<_>>().join(", ")
}

pub(crate) fn run_launch(ctx: &Context, env_name: &str, job: Option<String>) -> slash::Result<ExitCode> {
    let envs = EnvsManager::load(ctx)?;
    let mut env = envs.require(env_name)?;
    let job = job.unwrap_or_else(|| pid_job(nix::unistd::getppid().as_raw() as u32, TAG_SHELL));
    let svc = ServiceManager::new(ctx).launch(&mut env, &job)?;
    ensure_reaper(ctx, &job)?;
    describe_service(ctx, env.name(), &svc);
    // stdout carries only the proxy URL so shells can capture it
    println!("{}", svc.proxy_url());
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_stop(ctx: &Context, env_name: &str, job: &str) -> slash::Result<ExitCode> {
    ServiceManager::new(ctx).stop_by_name(env_name, job)?;
    Ok(ExitCode::SUCCESS)
}

#[derive(Serialize)]
struct StatusJson<'a> {
    host: &'a str,
    reaper: Option<u32>,
    services: BTreeMap<String, &'a slash::ServiceRecord>,
}

pub(crate) fn run_status(ctx: &Context, json: bool) -> slash::Result<ExitCode> {
    let services = ServiceManager::new(ctx).services()?;
    let reaper = ReaperSupervisor::new(ctx, policy("pid")?).pid()?;
    if json {
        let doc = StatusJson {
            host: ctx.hostname(),
            reaper,
            services: services
                .iter()
                .map(|(k, v)| (k.clone(), v.record()))
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(ExitCode::SUCCESS);
    }
    if services.is_empty() {
        println!("no running services on {}", ctx.hostname());
    } else {
        println!("{:<16} {:>8} {:>6} {:>6}  JOBS", "ENV", "PID", "PORT", "CTL");
        for (name, svc) in &services {
            let ctl = svc
                .controller()
                .map_or_else(|| "-".to_string(), |c| c.port.to_string());
            println!(
                "{:<16} {:>8} {:>6} {:>6}  {}",
                name,
                svc.pid(),
                svc.port(),
                ctl,
                join_jobs(svc)
            );
        }
    }
    match reaper {
        Some(pid) => println!("reaper: running (pid {pid})"),
        None => println!("reaper: not running"),
    }
    Ok(ExitCode::SUCCESS)
}

/// Spawn the user's command with proxy variables set; returns its exit code.
fn run_child(cmd: &[String], proxy_url: &str) -> anyhow::Result<i32> {
    let (prog, args) = cmd
        .split_first()
        .context("no command given")?;
    let mut child = Command::new(prog);
    child.args(args);
    for var in PROXY_VARS {
        child.env(var, proxy_url);
    }
    let status = child
        .status()
        .with_context(|| format!("failed to run {prog}"))?;
    // killed by a signal: 128 + signo, like a shell
    Ok(status.code().unwrap_or_else(|| {
        use std::os::unix::process::ExitStatusExt;
        128 + status.signal().unwrap_or(1)
    }))
}

pub(crate) fn run_run(ctx: &Context, env_name: &str, cmd: &[String]) -> slash::Result<ExitCode> {
    let envs = EnvsManager::load(ctx)?;
    let mut env = envs.require(env_name)?;
    let job = pid_job(std::process::id(), TAG_WITH);
    let mgr = ServiceManager::new(ctx);
    let svc = mgr.launch(&mut env, &job)?;
    ensure_reaper(ctx, &job)?;

    // Ctrl-C reaches the child; we only need to survive it long enough to detach.
    let code = {
        let _guard = InterruptGuard::install();
        run_child(cmd, &svc.proxy_url())
    };
    mgr.stop(&env, &job)?;
    match code {
        Ok(c) => Ok(ExitCode::from(c.clamp(0, 255) as u8)),
        Err(e) => {
            slash::log_error_stderr(slash::color_enabled_stderr(), &format!("slash: {e:#}"));
            let not_found = e
                .root_cause()
                .downcast_ref::<std::io::Error>()
                .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound);
            Ok(ExitCode::from(if not_found { 127 } else { 1 }))
        }
    }
}

pub(crate) fn run_env(ctx: &Context, cmd: &EnvCmd) -> slash::Result<ExitCode> {
    let mut envs = EnvsManager::load(ctx)?;
    let mgr = ServiceManager::new(ctx);
    match cmd {
        EnvCmd::List => {
            for (name, env) in envs.envs() {
                let state = match mgr.service(name)? {
                    Some(svc) => format!("running (pid {}, port {})", svc.pid(), svc.port()),
                    None => "idle".to_string(),
                };
                println!(
                    "{name:<16} {state:<28} updated {}",
                    env.last_updated().unwrap_or("never")
                );
            }
        }
        EnvCmd::Create {
            name,
            subscriptions,
        } => {
            let env = envs.create(name, subscriptions.clone())?;
            println!("{}", env.workdir().display());
        }
        EnvCmd::Remove { name } => envs.remove(name)?,
        EnvCmd::Info { name } => {
            let env = envs.require(name)?;
            println!("name:          {}", env.name());
            println!("location:      {}", env.workdir().display());
            println!("last updated:  {}", env.last_updated().unwrap_or("never"));
            for sub in env.subscriptions() {
                println!("subscription:  {sub}");
            }
            if let Some(svc) = mgr.service(name)? {
                describe_service(ctx, name, &svc);
            }
        }
        EnvCmd::Update { name } => {
            let env = envs
                .get_mut(name)
                .ok_or_else(|| SlashError::NotFound(format!("environment '{name}'")))?;
            if !env.update()? {
                return Err(SlashError::Message(format!(
                    "failed to update environment '{name}'"
                )));
            }
            if mgr.service(name)?.is_some() {
                slash::log_warn_stderr(
                    slash::color_enabled_stderr(),
                    "slash: the running proxy keeps its old config until every job detaches",
                );
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn run_reaper(ctx: &Context, cmd: &ReaperCmd) -> slash::Result<ExitCode> {
    match cmd {
        ReaperCmd::Start { policy: name } => {
            let pid = ReaperSupervisor::new(ctx, policy(name)?).start()?;
            println!("{pid}");
        }
        ReaperCmd::Stop { policy: name } => ReaperSupervisor::new(ctx, policy(name)?).stop()?,
        ReaperCmd::Status { policy: name } => {
            let sup = ReaperSupervisor::new(ctx, policy(name)?);
            match sup.pid()? {
                Some(pid) => println!("{}: {} (pid {pid})", name, sup.state()?),
                None => println!("{}: {}", name, sup.state()?),
            }
        }
        ReaperCmd::Run {
            policy: name,
            owner,
        } => Reaper::new(ctx, policy(name)?).run(*owner)?,
    }
    Ok(ExitCode::SUCCESS)
}
