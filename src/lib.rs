//! slash: leaderless supervisor for per-environment proxy processes.
//!
//! Every client invocation is short-lived. Coordination happens only through advisory
//! file locks, JSON descriptors under the work directory, the OS process table and port
//! reachability; a detached reaper evicts jobs whose owner vanished.
//!
//! Entry points: [`ServiceManager`] to attach/detach jobs, [`ReaperSupervisor`] to keep a
//! reaper running, [`EnvsManager`] for environment bookkeeping. All of them take a
//! [`Context`] built once per invocation.

pub mod color;
pub mod config;
pub mod context;
pub mod env;
pub mod errors;
pub mod interrupt;
pub mod job;
pub mod lock;
pub mod logging;
pub mod manager;
pub mod port;
pub mod probe;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod service;

pub use color::{
    color_enabled_stderr, log_error_stderr, log_info_stderr, log_warn_stderr, paint,
    set_color_mode, ColorMode,
};
pub use config::Settings;
pub use context::Context;
pub use env::{Env, Environment, EnvsManager, BASE_ENV};
pub use errors::{exit_code_for_error, Result, SlashError};
pub use job::{parse_pid_job, pid_job, TAG_SHELL, TAG_WITH};
pub use manager::ServiceManager;
pub use port::{PortAllocator, PortLease};
pub use probe::{NetProbe, Probe};
pub use process::{Launcher, ProxyLauncher};
pub use reaper::{
    policy_by_name, ProcessPolicy, Reaper, ReaperPolicy, ReaperState, ReaperSupervisor,
    SweepReport,
};
pub use registry::{Controller, Registry, ServiceRecord};
pub use service::{Service, ServiceState};
