//! Environments: a named proxy profile owning `<envs_dir>/<name>/` with `env.json`,
//! `config.yaml` and the service registry.
//!
//! The supervisor core only needs the directory and the two config writes (data port and
//! controller); everything else here is bookkeeping for the CLI.
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{info, warn};

use crate::context::Context;
use crate::errors::{Result, SlashError};

pub const ENV_FILE: &str = "env.json";
pub const CONFIG_FILE: &str = "config.yaml";
pub const BASE_ENV: &str = "base";

/// Keys superseded by `mixed-port` when the data port is injected.
const LEGACY_PORT_KEYS: &[&str] = &["port", "socks-port", "redir-port", "tproxy-port"];

/// What the supervisor needs from an environment.
pub trait Environment {
    fn name(&self) -> &str;

    fn workdir(&self) -> &Path;

    /// Inject the data port the proxy must listen on.
    fn set_port(&mut self, port: u16) -> Result<()>;

    /// Inject the controller port; returns the secret the controller will require.
    fn set_controller(&mut self, port: u16, ui_dir: Option<&Path>, local_only: bool)
        -> Result<String>;

    /// Refresh the environment's config from its sources; false when the refresh failed.
    fn update(&mut self) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct EnvMeta {
    name: String,
    #[serde(default)]
    subscriptions: Vec<String>,
    #[serde(default)]
    last_updated: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Env {
    meta: EnvMeta,
    workdir: PathBuf,
}

impl Env {
    pub fn new(envs_dir: &Path, name: &str, subscriptions: Vec<String>) -> Result<Env> {
        validate_env_name(name)?;
        Ok(Env {
            meta: EnvMeta {
                name: name.to_string(),
                subscriptions,
                last_updated: None,
            },
            workdir: envs_dir.join(name),
        })
    }

    pub fn load(envs_dir: &Path, name: &str) -> Result<Env> {
        validate_env_name(name)?;
        let workdir = envs_dir.join(name);
        let text = fs::read_to_string(workdir.join(ENV_FILE)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SlashError::NotFound(format!("environment '{name}'"))
            } else {
                e.into()
            }
        })?;
        let meta: EnvMeta = serde_json::from_str(&text)?;
        Ok(Env { meta, workdir })
    }

    pub fn save(&self) -> Result<()> {
        fs::create_dir_all(&self.workdir)?;
        let text = serde_json::to_string_pretty(&self.meta)?;
        fs::write(self.workdir.join(ENV_FILE), text)?;
        Ok(())
    }

    pub fn subscriptions(&self) -> &[String] {
        &self.meta.subscriptions
    }

    pub fn last_updated(&self) -> Option<&str> {
        self.meta.last_updated.as_deref()
    }

    pub fn config_path(&self) -> PathBuf {
        self.workdir.join(CONFIG_FILE)
    }

    /// Parsed `config.yaml`; fetched through `update()` first when missing.
    pub fn config(&mut self) -> Result<Mapping> {
        let path = self.config_path();
        if !path.exists() && !self.update()? {
            return Err(SlashError::NotFound(format!(
                "config file of environment '{}'",
                self.meta.name
            )));
        }
        let text = fs::read_to_string(&path)?;
        if text.trim().is_empty() {
            return Ok(Mapping::new());
        }
        match serde_yaml::from_str::<Value>(&text)? {
            Value::Mapping(m) => Ok(m),
            Value::Null => Ok(Mapping::new()),
            _ => Err(SlashError::Message(format!(
                "{} is not a YAML mapping",
                path.display()
            ))),
        }
    }

    pub fn set_config(&self, config: &Mapping) -> Result<()> {
        fs::create_dir_all(&self.workdir)?;
        fs::write(self.config_path(), serde_yaml::to_string(config)?)?;
        Ok(())
    }

    fn fetch_subscription(source: &str) -> Result<String> {
        if source.starts_with("http://") || source.starts_with("https://") {
            let url = url::Url::parse(source)
                .map_err(|e| SlashError::Message(format!("invalid subscription url {source}: {e}")))?;
            let resp = reqwest::blocking::Client::builder()
                .timeout(std::time::Duration::from_secs(180))
                .connect_timeout(std::time::Duration::from_secs(15))
                .build()?
                .get(url)
                .send()?
                .error_for_status()?;
            Ok(resp.text()?)
        } else {
            Ok(fs::read_to_string(source)?)
        }
    }
}

impl Environment for Env {
    fn name(&self) -> &str {
        &self.meta.name
    }

    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn set_port(&mut self, port: u16) -> Result<()> {
        let mut config = self.config()?;
        for key in LEGACY_PORT_KEYS {
            config.remove(*key);
        }
        config.insert("mixed-port".into(), Value::from(u64::from(port)));
        self.set_config(&config)
    }

    fn set_controller(
        &mut self,
        port: u16,
        ui_dir: Option<&Path>,
        local_only: bool,
    ) -> Result<String> {
        let mut config = self.config()?;
        let secret = random_secret()?;
        let host = if local_only { "127.0.0.1" } else { "0.0.0.0" };
        config.insert(
            "external-controller".into(),
            Value::from(format!("{host}:{port}")),
        );
        config.insert("secret".into(), Value::from(secret.clone()));
        match ui_dir {
            Some(dir) => {
                config.insert(
                    "external-ui".into(),
                    Value::from(dir.display().to_string()),
                );
            }
            None => {
                config.remove("external-ui");
            }
        }
        self.set_config(&config)?;
        Ok(secret)
    }

    fn update(&mut self) -> Result<bool> {
        fs::create_dir_all(&self.workdir)?;
        let content = if self.meta.subscriptions.is_empty() {
            default_config_text()?
        } else {
            let mut fetched = None;
            for src in &self.meta.subscriptions {
                match Env::fetch_subscription(src) {
                    Ok(text) => {
                        fetched = Some(text);
                        break;
                    }
                    Err(e) => warn!("failed to fetch subscription {src}: {e}"),
                }
            }
            match fetched {
                Some(t) => t,
                None => {
                    warn!(
                        "failed to update the config file of environment {}: all subscriptions failed",
                        self.meta.name
                    );
                    return Ok(false);
                }
            }
        };
        let tmp = self.workdir.join(format!("{CONFIG_FILE}.tmp"));
        fs::write(&tmp, content)?;
        fs::rename(&tmp, self.config_path())?;
        self.meta.last_updated = Some(humantime::format_rfc3339_seconds(SystemTime::now()).to_string());
        self.save()?;
        Ok(true)
    }
}

/// Minimal config: a single selector routing everything direct.
fn default_config_text() -> Result<String> {
    let mut group = Mapping::new();
    group.insert("name".into(), "Select".into());
    group.insert("type".into(), "select".into());
    group.insert("proxies".into(), Value::Sequence(vec!["DIRECT".into()]));
    let mut root = Mapping::new();
    root.insert(
        "proxy-groups".into(),
        Value::Sequence(vec![Value::Mapping(group)]),
    );
    root.insert(
        "rules".into(),
        Value::Sequence(vec!["MATCH,Select".into()]),
    );
    Ok(serde_yaml::to_string(&root)?)
}

/// 16 random bytes as lowercase hex.
pub fn random_secret() -> Result<String> {
    let mut buf = [0u8; 16];
    getrandom::getrandom(&mut buf)
        .map_err(|e| SlashError::Message(format!("failed to generate secret: {e}")))?;
    Ok(buf.iter().map(|b| format!("{b:02x}")).collect())
}

pub fn validate_env_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if ok {
        Ok(())
    } else {
        Err(SlashError::Message(format!(
            "invalid environment name '{name}' (use letters, digits, '-', '_' and '.')"
        )))
    }
}

/// All environments under the context's envs directory.
pub struct EnvsManager<'a> {
    ctx: &'a Context,
    envs: BTreeMap<String, Env>,
}

impl<'a> EnvsManager<'a> {
    /// Scan the envs directory; the `base` environment is created when missing.
    pub fn load(ctx: &'a Context) -> Result<EnvsManager<'a>> {
        let dir = ctx.envs_dir();
        fs::create_dir_all(&dir)?;
        let mut envs = BTreeMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if !entry.path().join(ENV_FILE).exists() {
                continue;
            }
            match Env::load(&dir, &name) {
                Ok(env) => {
                    envs.insert(name, env);
                }
                Err(e) => warn!("skipping environment {name}: {e}"),
            }
        }
        let mut mgr = EnvsManager { ctx, envs };
        if !mgr.envs.contains_key(BASE_ENV) {
            mgr.create(BASE_ENV, Vec::new())?;
        }
        Ok(mgr)
    }

    pub fn envs(&self) -> &BTreeMap<String, Env> {
        &self.envs
    }

    pub fn get(&self, name: &str) -> Option<&Env> {
        self.envs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Env> {
        self.envs.get_mut(name)
    }

    pub fn require(&self, name: &str) -> Result<Env> {
        self.get(name)
            .cloned()
            .ok_or_else(|| SlashError::NotFound(format!("environment '{name}'")))
    }

    pub fn create(&mut self, name: &str, subscriptions: Vec<String>) -> Result<&Env> {
        if self.envs.contains_key(name) {
            return Err(SlashError::Message(format!(
                "environment '{name}' already exists"
            )));
        }
        let mut env = Env::new(&self.ctx.envs_dir(), name, subscriptions)?;
        env.save()?;
        if !env.update()? {
            warn!("environment '{name}' created without a config; it will be fetched on first use");
        }
        info!("environment location: {}", env.workdir().display());
        Ok(self.envs.entry(name.to_string()).or_insert(env))
    }

    /// Delete an environment directory. Refused for `base` and while a live service runs.
    pub fn remove(&mut self, name: &str) -> Result<()> {
        if name == BASE_ENV {
            return Err(SlashError::Message(format!(
                "cannot remove the default environment '{name}'"
            )));
        }
        let env = self.require(name)?;
        if let Some(svc) = crate::service::Service::load(self.ctx, env.workdir())? {
            return Err(SlashError::Message(format!(
                "environment '{name}' is in use by pid {} (jobs: {})",
                svc.pid(),
                svc.jobs().iter().cloned().collect::<Vec<_>>().join(", ")
            )));
        }
        fs::remove_dir_all(env.workdir())?;
        self.envs.remove(name);
        info!("environment '{name}' has been removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(td: &tempfile::TempDir) -> Context {
        Context::builder(td.path()).hostname("test-host").build()
    }

    #[test]
    fn test_update_without_subscriptions_writes_default_config() {
        let td = tempfile::tempdir().expect("tmpdir");
        let mut env = Env::new(td.path(), "e1", Vec::new()).expect("env");
        assert!(env.update().expect("update"));
        let cfg = env.config().expect("config");
        let groups = cfg.get("proxy-groups").and_then(Value::as_sequence).expect("groups");
        assert_eq!(groups[0].get("name").and_then(Value::as_str), Some("Select"));
        let rules = cfg.get("rules").and_then(Value::as_sequence).expect("rules");
        assert_eq!(rules[0].as_str(), Some("MATCH,Select"));
        assert!(env.last_updated().is_some());
        assert!(env.workdir().join(ENV_FILE).exists());
    }

    #[test]
    fn test_update_copies_local_subscription_and_falls_through_failures() {
        let td = tempfile::tempdir().expect("tmpdir");
        let sub = td.path().join("sub.yaml");
        fs::write(&sub, "mode: rule\nport: 7890\n").expect("write sub");
        let mut env = Env::new(
            &td.path().join("envs"),
            "e2",
            vec![
                td.path().join("missing.yaml").display().to_string(),
                sub.display().to_string(),
            ],
        )
        .expect("env");
        assert!(env.update().expect("update"));
        let cfg = env.config().expect("config");
        assert_eq!(cfg.get("mode").and_then(Value::as_str), Some("rule"));
        assert!(!env.workdir().join("config.yaml.tmp").exists());
    }

    #[test]
    fn test_update_reports_failure_when_every_subscription_fails() {
        let td = tempfile::tempdir().expect("tmpdir");
        let mut env = Env::new(
            td.path(),
            "e3",
            vec![td.path().join("nope.yaml").display().to_string()],
        )
        .expect("env");
        assert!(!env.update().expect("update"));
        assert!(env.last_updated().is_none());
        assert!(matches!(env.config(), Err(SlashError::NotFound(_))));
    }

    #[test]
    fn test_set_port_replaces_legacy_port_keys() {
        let td = tempfile::tempdir().expect("tmpdir");
        let mut env = Env::new(td.path(), "p", Vec::new()).expect("env");
        env.update().expect("update");
        let mut cfg = env.config().expect("cfg");
        for k in ["port", "socks-port", "redir-port", "tproxy-port"] {
            cfg.insert(k.into(), Value::from(1u64));
        }
        env.set_config(&cfg).expect("set");

        env.set_port(23456).expect("set_port");
        let cfg = env.config().expect("cfg");
        assert_eq!(cfg.get("mixed-port").and_then(Value::as_u64), Some(23456));
        for k in ["port", "socks-port", "redir-port", "tproxy-port"] {
            assert!(cfg.get(k).is_none(), "{k} should be removed");
        }
    }

    #[test]
    fn test_set_controller_local_and_external() {
        let td = tempfile::tempdir().expect("tmpdir");
        let mut env = Env::new(td.path(), "c", Vec::new()).expect("env");
        let secret = env.set_controller(5678, None, true).expect("ctl");
        assert_eq!(secret.len(), 32);
        let cfg = env.config().expect("cfg");
        assert_eq!(
            cfg.get("external-controller").and_then(Value::as_str),
            Some("127.0.0.1:5678")
        );
        assert_eq!(cfg.get("secret").and_then(Value::as_str), Some(secret.as_str()));
        assert!(cfg.get("external-ui").is_none());

        let ui = td.path().join("ui");
        let secret2 = env.set_controller(23142, Some(&ui), false).expect("ctl");
        assert_ne!(secret, secret2);
        let cfg = env.config().expect("cfg");
        assert_eq!(
            cfg.get("external-controller").and_then(Value::as_str),
            Some("0.0.0.0:23142")
        );
        assert_eq!(
            cfg.get("external-ui").and_then(Value::as_str),
            Some(ui.display().to_string().as_str())
        );
    }

    #[test]
    fn test_env_names_are_validated() {
        assert!(validate_env_name("prod").is_ok());
        assert!(validate_env_name("my-env_2.x").is_ok());
        for bad in ["", "..", ".hidden", "a/b", "with space"] {
            assert!(validate_env_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_manager_creates_base_and_manages_envs() {
        let td = tempfile::tempdir().expect("tmpdir");
        let ctx = ctx(&td);
        let mut mgr = EnvsManager::load(&ctx).expect("load");
        assert!(mgr.get(BASE_ENV).is_some());

        mgr.create("prod", Vec::new()).expect("create");
        assert!(mgr.create("prod", Vec::new()).is_err(), "duplicate create");

        let reloaded = EnvsManager::load(&ctx).expect("reload");
        assert_eq!(
            reloaded.envs().keys().cloned().collect::<Vec<_>>(),
            vec!["base".to_string(), "prod".to_string()]
        );

        assert!(mgr.remove(BASE_ENV).is_err());
        mgr.remove("prod").expect("remove");
        assert!(!ctx.envs_dir().join("prod").exists());
        assert!(matches!(mgr.require("prod"), Err(SlashError::NotFound(_))));
    }
}
