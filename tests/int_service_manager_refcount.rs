mod support;

use slash::process::pid_alive;
use slash::{Environment, Registry, ServiceManager};

#[test]
fn int_two_jobs_share_one_process_until_last_detaches() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, launcher) = support::context(td.path());
    let mut env = support::create_env(&ctx, "prod");
    let mgr = ServiceManager::new(&ctx);

    let first = mgr
        .launch(&mut env, "__pid_111_shell__")
        .expect("first launch");
    assert!(pid_alive(first.pid()), "service should be alive after launch");
    assert!(
        (20000..30000).contains(&first.port()),
        "port {} outside default range",
        first.port()
    );

    let second = mgr
        .launch(&mut env, "__pid_222_with__")
        .expect("second launch");
    assert_eq!(second.pid(), first.pid(), "second launch must attach, not spawn");
    assert_eq!(second.port(), first.port());
    assert_eq!(
        second.jobs().iter().cloned().collect::<Vec<_>>(),
        vec!["__pid_111_shell__".to_string(), "__pid_222_with__".to_string()]
    );
    assert_eq!(launcher.pids().len(), 1, "exactly one process started");

    mgr.stop(&env, "__pid_111_shell__").expect("stop first job");
    let svc = mgr
        .service("prod")
        .expect("read")
        .expect("service still running");
    assert_eq!(
        svc.jobs().iter().cloned().collect::<Vec<_>>(),
        vec!["__pid_222_with__".to_string()]
    );
    assert!(pid_alive(first.pid()));

    mgr.stop(&env, "__pid_222_with__").expect("stop last job");
    assert!(!pid_alive(first.pid()), "last stop must terminate the process");
    assert!(mgr.service("prod").expect("read").is_none());
    let snap = Registry::new(env.workdir()).snapshot().expect("snapshot");
    assert!(
        !snap.contains_key("test-host"),
        "record must be removed: {snap:?}"
    );
}

#[test]
fn int_stop_is_idempotent_and_leaves_other_jobs_alone() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, _launcher) = support::context(td.path());
    let mut env = support::create_env(&ctx, "dev");
    let mgr = ServiceManager::new(&ctx);

    let svc = mgr.launch(&mut env, "job-a").expect("launch a");
    mgr.launch(&mut env, "job-b").expect("launch b");

    mgr.stop(&env, "job-a").expect("stop a");
    mgr.stop(&env, "job-a").expect("second stop of a is not an error");
    mgr.stop(&env, "never-attached").expect("unknown job is not an error");

    let after = mgr.service("dev").expect("read").expect("still running");
    assert_eq!(after.pid(), svc.pid());
    assert_eq!(
        after.jobs().iter().cloned().collect::<Vec<_>>(),
        vec!["job-b".to_string()]
    );

    mgr.stop(&env, "job-b").expect("stop b");
    mgr.stop(&env, "job-b")
        .expect("stopping a stopped service is not an error");
    assert!(!pid_alive(svc.pid()));
}

#[test]
fn int_stop_unknown_environment_is_logged_not_fatal() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, _launcher) = support::context(td.path());
    let mgr = ServiceManager::new(&ctx);
    mgr.stop_by_name("nowhere", "__pid_1_shell__")
        .expect("unknown environment must not fail");
    assert!(
        !ctx.envs_dir().join("nowhere").exists(),
        "stop must not create directories"
    );
}

#[test]
fn int_launch_writes_ports_into_environment_config() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, _launcher) = support::context(td.path());
    let mut env = support::create_env(&ctx, "cfg");
    let mgr = ServiceManager::new(&ctx);

    let svc = mgr.launch(&mut env, "job").expect("launch");
    let cfg = env.config().expect("config");
    assert_eq!(
        cfg.get("mixed-port").and_then(|v| v.as_u64()),
        Some(u64::from(svc.port()))
    );
    let ctl = svc.controller().expect("controller enabled by default");
    assert_ne!(ctl.port, svc.port(), "data and controller ports must differ");
    assert_eq!(
        cfg.get("external-controller").and_then(|v| v.as_str()),
        Some(format!("127.0.0.1:{}", ctl.port).as_str())
    );
    assert_eq!(
        cfg.get("secret").and_then(|v| v.as_str()),
        Some(ctl.secret.as_str())
    );
    assert!(env.workdir().join("service.log").exists());

    mgr.stop(&env, "job").expect("stop");
}

#[test]
fn int_services_lists_only_live_environments() {
    let td = tempfile::tempdir().expect("tmpdir");
    let (ctx, _launcher) = support::context(td.path());
    let mut a = support::create_env(&ctx, "a");
    support::create_env(&ctx, "b");
    let mgr = ServiceManager::new(&ctx);

    let svc = mgr.launch(&mut a, "job").expect("launch");
    let all = mgr.services().expect("services");
    assert_eq!(all.keys().cloned().collect::<Vec<_>>(), vec!["a".to_string()]);
    assert_eq!(all["a"].pid(), svc.pid());

    mgr.stop(&a, "job").expect("stop");
    assert!(mgr.services().expect("services").is_empty());
}
