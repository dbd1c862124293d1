mod support;

use std::collections::BTreeSet;

use slash::process::pid_alive;
use slash::{Env, ServiceManager};

#[test]
fn int_concurrent_launches_start_exactly_one_process() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, launcher) = support::context(td.path());
    support::create_env(&ctx, "prod");
    let envs_dir = ctx.envs_dir();
    const CALLERS: usize = 6;

    let pids: Vec<u32> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..CALLERS)
            .map(|i| {
                let ctx = &ctx;
                let envs_dir = &envs_dir;
                s.spawn(move || {
                    let mut env = Env::load(envs_dir, "prod").expect("load env");
                    ServiceManager::new(ctx)
                        .launch(&mut env, &format!("job-{i}"))
                        .expect("launch")
                        .pid()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let distinct: BTreeSet<u32> = pids.iter().copied().collect();
    assert_eq!(distinct.len(), 1, "all callers must share one pid: {pids:?}");
    assert_eq!(launcher.pids().len(), 1, "exactly one spawn");

    let mgr = ServiceManager::new(&ctx);
    let svc = mgr.service("prod").expect("read").expect("running");
    assert_eq!(svc.jobs().len(), CALLERS, "every job attached: {:?}", svc.jobs());

    let env = Env::load(&envs_dir, "prod").expect("load env");
    for i in 0..CALLERS {
        mgr.stop(&env, &format!("job-{i}")).expect("stop");
    }
    assert!(!pid_alive(svc.pid()));
}
