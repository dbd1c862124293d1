//! Job tokens. A job is an opaque claim on a running service; the process reaper additionally
//! understands the `__pid_<pid>_<tag>__` convention, where `<tag>` is one or more word
//! characters (`[A-Za-z0-9_]`).

pub const PID_JOB_PREFIX: &str = "__pid_";
pub const PID_JOB_SUFFIX: &str = "__";

/// Tag used by interactive shells (activate/deactivate).
pub const TAG_SHELL: &str = "shell";
/// Tag used by one-off command wrappers (`slash run`).
pub const TAG_WITH: &str = "with";

pub fn pid_job(pid: u32, tag: &str) -> String {
    format!("{PID_JOB_PREFIX}{pid}_{tag}{PID_JOB_SUFFIX}")
}

/// Parse `__pid_<pid>_<tag>__` into `(pid, tag)`; anything else is `None`.
pub fn parse_pid_job(job: &str) -> Option<(u32, &str)> {
    let body = job
        .strip_prefix(PID_JOB_PREFIX)?
        .strip_suffix(PID_JOB_SUFFIX)?;
    let (pid, tag) = body.split_once('_')?;
    if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if tag.is_empty() || !tag.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let pid = pid.parse().ok()?;
    Some((pid, tag))
}
