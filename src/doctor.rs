use std::process::Command;

use slash::process::ProxyLauncher;
use slash::{Context, ReaperSupervisor};

fn highlight(s: &str) -> String {
    slash::paint(slash::color_enabled_stderr(), "\x1b[34;1m", s)
}

pub fn run_doctor(ctx: &Context, verbose: bool) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("slash doctor");
    eprintln!();
    eprintln!("  version: v{}", version);
    eprintln!(
        "  build:   {} ({}, {}, rustc {})",
        env!("SLASH_BUILD_DATE"),
        env!("SLASH_BUILD_TARGET"),
        env!("SLASH_BUILD_PROFILE"),
        env!("SLASH_BUILD_RUSTC")
    );
    eprintln!(
        "  host:    {} ({} / {})",
        ctx.hostname(),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    eprintln!();

    eprintln!("  work dir: {}", highlight(&ctx.work_dir().display().to_string()));
    eprintln!("  envs:     {}", ctx.envs_dir().display());
    eprintln!("  locks:    {}", ctx.lock_dir().display());
    eprintln!();

    let launcher = ProxyLauncher::new(ctx.settings.proxy_bin.clone());
    match launcher.executable() {
        Ok(p) => {
            eprintln!("  proxy:    {}", highlight(&p.display().to_string()));
            if let Ok(out) = Command::new(&p).arg("-v").output() {
                let s = String::from_utf8_lossy(&out.stdout).trim().to_string();
                if let Some(first) = s.lines().next() {
                    eprintln!("  proxy -v: {first}");
                }
            }
        }
        Err(e) => eprintln!("  proxy:    {}", highlight(&format!("not found ({e})"))),
    }

    match slash::policy_by_name("pid").map(|p| ReaperSupervisor::new(ctx, p).pid()) {
        Some(Ok(Some(pid))) => eprintln!("  reaper:   running (pid {pid})"),
        Some(Ok(None)) => eprintln!("  reaper:   not running"),
        Some(Err(e)) => eprintln!("  reaper:   unknown ({e})"),
        None => eprintln!("  reaper:   no policy"),
    }

    if verbose {
        let s = &ctx.settings;
        eprintln!();
        eprintln!("  port range:      {}-{}", s.port_range.start, s.port_range.end);
        eprintln!(
            "  launch budget:   {} x {}",
            s.launch_retries,
            humantime::format_duration(s.launch_interval)
        );
        eprintln!("  stop timeout:    {}", humantime::format_duration(s.stop_timeout));
        eprintln!("  reaper interval: {}", humantime::format_duration(s.reaper_interval));
        eprintln!("  probe url:       {}", s.probe_url);
    }

    eprintln!();
    eprintln!("doctor: completed diagnostics.");
}
