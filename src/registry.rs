#![allow(clippy::module_name_repetitions)]
//! Lock-guarded per-environment registry: `<env_dir>/service.json` maps hostname to the
//! record of the proxy running for that environment on that host.
//!
//! Every mutation happens while holding `<env_dir>/service.lock` and is written through a
//! temp file + rename, so lock-free readers never observe a torn file. Lock-free reads are
//! allowed because stale records are healed on read (a dead pid is treated as absent).
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::errors::Result;
use crate::lock::{lock_path_for, FileLock};

pub const REGISTRY_FILE: &str = "service.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Controller {
    pub port: u16,
    pub secret: String,
}

/// Persisted descriptor of one supervised proxy. On disk `ctl` is `[port, secret]` or null.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub pid: u32,
    pub port: u16,
    #[serde(default, with = "ctl_tuple")]
    pub ctl: Option<Controller>,
    pub jobs: BTreeSet<String>,
    /// Process start time (clock ticks since boot) guarding against pid reuse.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started: Option<u64>,
}

mod ctl_tuple {
    use super::Controller;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Option<Controller>, s: S) -> Result<S::Ok, S::Error> {
        v.as_ref()
            .map(|c| (c.port, c.secret.as_str()))
            .serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Controller>, D::Error> {
        let raw: Option<(u16, String)> = Option::deserialize(d)?;
        Ok(raw.map(|(port, secret)| Controller { port, secret }))
    }
}

pub type RegistryMap = BTreeMap<String, ServiceRecord>;

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    pub fn new(env_dir: &Path) -> Self {
        Registry {
            path: env_dir.join(REGISTRY_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        lock_path_for(&self.path)
    }

    /// Take the registry lock; all mutations go through the returned guard.
    pub fn lock(&self) -> Result<RegistryGuard<'_>> {
        let lock = FileLock::acquire(&self.lock_path())?;
        Ok(RegistryGuard {
            registry: self,
            _lock: lock,
        })
    }

    /// Point-in-time read without the lock.
    pub fn snapshot(&self) -> Result<RegistryMap> {
        read_map(&self.path)
    }
}

pub struct RegistryGuard<'a> {
    registry: &'a Registry,
    _lock: FileLock,
}

impl RegistryGuard<'_> {
    pub fn read(&self) -> Result<RegistryMap> {
        read_map(&self.registry.path)
    }

    pub fn write(&self, map: &RegistryMap) -> Result<()> {
        write_map(&self.registry.path, map)
    }

    pub fn get(&self, host: &str) -> Result<Option<ServiceRecord>> {
        Ok(self.read()?.remove(host))
    }

    pub fn put(&self, host: &str, record: &ServiceRecord) -> Result<()> {
        let mut map = self.read()?;
        map.insert(host.to_string(), record.clone());
        self.write(&map)
    }

    /// Drop the entry for `host`; returns whether one existed.
    pub fn remove(&self, host: &str) -> Result<bool> {
        let mut map = self.read()?;
        let existed = map.remove(host).is_some();
        if existed {
            self.write(&map)?;
        }
        Ok(existed)
    }
}

fn read_map(path: &Path) -> Result<RegistryMap> {
    read_json(path)
}

fn write_map(path: &Path, map: &RegistryMap) -> Result<()> {
    write_json(path, map)
}

/// Missing or empty files read as `T::default()`.
pub(crate) fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(T::default()),
        Err(e) => return Err(e.into()),
    };
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    Ok(serde_json::from_str(&text)?)
}

/// Write through a temp file in the same directory and rename over `path`.
pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
