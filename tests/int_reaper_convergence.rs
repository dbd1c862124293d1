mod support;

use slash::process::pid_alive;
use slash::{pid_job, ProcessPolicy, Reaper, ServiceManager, SweepReport, TAG_SHELL, TAG_WITH};

#[test]
fn int_sweep_evicts_dead_owner_and_keeps_live_owner() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, _launcher) = support::context(td.path());
    let mut orphaned = support::create_env(&ctx, "orphaned");
    let mut held = support::create_env(&ctx, "held");
    let mgr = ServiceManager::new(&ctx);

    let dead_job = pid_job(support::dead_pid(), TAG_SHELL);
    let live_job = pid_job(std::process::id(), TAG_WITH);
    let gone = mgr.launch(&mut orphaned, &dead_job).expect("launch orphaned");
    let kept = mgr.launch(&mut held, &live_job).expect("launch held");
    // jobs outside the pid convention belong to someone else
    mgr.launch(&mut held, "manual").expect("attach manual");

    let report = Reaper::new(&ctx, &ProcessPolicy).sweep().expect("sweep");
    assert_eq!(
        report,
        SweepReport {
            matched: 2,
            evicted: 1
        }
    );

    assert!(!pid_alive(gone.pid()), "orphaned service must be stopped");
    assert!(mgr.service("orphaned").expect("read").is_none());

    let still = mgr.service("held").expect("read").expect("held running");
    assert_eq!(still.pid(), kept.pid());
    assert_eq!(still.jobs().len(), 2);

    // a second sweep is a no-op for what was already evicted
    let again = Reaper::new(&ctx, &ProcessPolicy).sweep().expect("sweep");
    assert_eq!(again, SweepReport { matched: 1, evicted: 0 });

    mgr.stop(&held, &live_job).expect("stop live");
    mgr.stop(&held, "manual").expect("stop manual");
    assert!(!pid_alive(kept.pid()));
}

#[test]
fn int_sweep_keeps_service_while_other_jobs_remain() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, _launcher) = support::context(td.path());
    let mut env = support::create_env(&ctx, "shared");
    let mgr = ServiceManager::new(&ctx);

    let dead_job = pid_job(support::dead_pid(), TAG_SHELL);
    let svc = mgr.launch(&mut env, &dead_job).expect("launch");
    mgr.launch(&mut env, "manual").expect("attach");

    let report = Reaper::new(&ctx, &ProcessPolicy).sweep().expect("sweep");
    assert_eq!(report.evicted, 1);
    let after = mgr.service("shared").expect("read").expect("running");
    assert_eq!(after.pid(), svc.pid());
    assert_eq!(
        after.jobs().iter().cloned().collect::<Vec<_>>(),
        vec!["manual".to_string()]
    );

    mgr.stop(&env, "manual").expect("stop");
}
