//! On-disk state: one `active.json` index plus an `instances/<id>/` directory
//! per run holding `meta.json` and `log.txt`.
//!
//! There is no locking. Every mutation of the index reads the whole record,
//! edits it, and rewrites it, so two invocations racing on the same name lose
//! one update (last writer wins). Single-actor behaviour is the contract.

use std::{
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use anyhow::Context;
use bg_instance::{ActiveMap, InstanceId, InstanceMeta};

const ACTIVE_FILE: &str = "active.json";
const INSTANCES_DIR: &str = "instances";
const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.txt";

#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
}

impl StateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn active_path(&self) -> PathBuf {
        self.root.join(ACTIVE_FILE)
    }

    fn instances_dir(&self) -> PathBuf {
        self.root.join(INSTANCES_DIR)
    }

    pub fn instance_dir(&self, id: &InstanceId) -> PathBuf {
        self.instances_dir().join(id.as_str())
    }

    pub fn meta_path(&self, id: &InstanceId) -> PathBuf {
        self.instance_dir(id).join(META_FILE)
    }

    pub fn log_path(&self, id: &InstanceId) -> PathBuf {
        self.instance_dir(id).join(LOG_FILE)
    }

    /// Ids come back from files a user can edit; keep them to a single path
    /// component under `instances/`.
    fn is_safe_id(id: &InstanceId) -> bool {
        let s = id.as_str();
        !s.is_empty() && s != "." && s != ".." && !s.contains(['/', '\\'])
    }

    pub fn ensure_dirs(&self) -> anyhow::Result<()> {
        fs::create_dir_all(self.instances_dir())
            .with_context(|| format!("create {}", self.instances_dir().display()))
    }

    /// Never fails: a missing or unparsable index reads as empty.
    pub fn load_active_map(&self) -> ActiveMap {
        let path = self.active_path();
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return ActiveMap::new(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "active index unreadable; treating as empty");
                return ActiveMap::new();
            }
        };
        match serde_json::from_slice::<ActiveMap>(&raw) {
            Ok(map) => map,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "active index corrupt; treating as empty");
                ActiveMap::new()
            }
        }
    }

    pub fn save_active_map(&self, map: &ActiveMap) -> anyhow::Result<()> {
        write_json_atomic(&self.active_path(), map).context("persist active index")
    }

    pub fn active_id(&self, name: &str) -> Option<InstanceId> {
        self.load_active_map().get(name).cloned()
    }

    pub fn set_active(&self, name: &str, id: &InstanceId) -> anyhow::Result<()> {
        let mut map = self.load_active_map();
        map.insert(name.to_string(), id.clone());
        self.save_active_map(&map)
    }

    pub fn clear_active(&self, name: &str) -> anyhow::Result<()> {
        let mut map = self.load_active_map();
        if map.remove(name).is_none() {
            return Ok(());
        }
        self.save_active_map(&map)
    }

    /// `None` covers both "never written" and "unreadable"; callers treat the
    /// instance as stale either way.
    pub fn read_meta(&self, id: &InstanceId) -> Option<InstanceMeta> {
        if !Self::is_safe_id(id) {
            tracing::warn!(instance_id = %id, "refusing to resolve unsafe instance id");
            return None;
        }
        let path = self.meta_path(id);
        let raw = fs::read(&path).ok()?;
        match serde_json::from_slice::<InstanceMeta>(&raw) {
            Ok(meta) => Some(meta),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "instance metadata corrupt");
                None
            }
        }
    }

    pub fn write_meta(&self, meta: &InstanceMeta) -> anyhow::Result<()> {
        let id = &meta.instance_id;
        if !Self::is_safe_id(id) {
            anyhow::bail!("invalid instance id: {id}");
        }
        write_json_atomic(&self.meta_path(id), meta)
            .with_context(|| format!("persist metadata for {id}"))
    }

    /// Directories under `instances/` that hold a `meta.json`, ascending.
    pub fn list_all_instance_ids(&self) -> Vec<InstanceId> {
        let Ok(entries) = fs::read_dir(self.instances_dir()) else {
            return Vec::new();
        };

        let mut out: Vec<InstanceId> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|e| e.path().join(META_FILE).is_file())
            .filter_map(|e| e.file_name().into_string().ok())
            .map(InstanceId)
            .collect();
        out.sort();
        out
    }

    /// Every instance owned by `name`, newest first.
    pub fn list_instance_ids_for_name(&self, name: &str) -> Vec<InstanceId> {
        let mut out: Vec<InstanceId> = self
            .list_all_instance_ids()
            .into_iter()
            .filter(|id| id.owner_name().as_deref() == Some(name))
            .collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Removes the whole instance directory.
    pub fn remove_instance(&self, id: &InstanceId) -> anyhow::Result<()> {
        if !Self::is_safe_id(id) {
            anyhow::bail!("invalid instance id: {id}");
        }
        let dir = self.instance_dir(id);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("remove {}", dir.display())),
        }
    }
}

fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("no parent directory for {}", path.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    let mut f = fs::File::create(&tmp).with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush().ok();
    drop(f);
    fs::rename(&tmp, path).with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}
