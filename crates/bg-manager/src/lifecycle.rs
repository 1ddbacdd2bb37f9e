use std::{collections::BTreeMap, path::PathBuf};

use bg_instance::{
    ActiveMap, InstanceId, InstanceMeta, InstanceName, InstanceState, LaunchMode,
};
use chrono::{DateTime, Local, Utc};

use crate::{
    error::{LifecycleError, LifecycleResult},
    launch::{LaunchSpec, LaunchStrategy},
    liveness::{self, Signal},
    retention::{self, PruneReport},
    store::StateStore,
};

#[derive(Debug, Clone)]
pub struct StartRequest {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct Started {
    pub meta: InstanceMeta,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    NotActive,
    MetaMissing(InstanceId),
    NoPid(InstanceId),
    NotRunning { pid: u32 },
    Stopped { pid: u32 },
    ForceKilled { pid: u32, term_error: String },
}

#[derive(Debug, Clone)]
pub struct InstanceView {
    pub name: String,
    pub instance_id: InstanceId,
    pub meta: Option<InstanceMeta>,
    pub state: InstanceState,
}

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub instance_id: InstanceId,
    pub meta: Option<InstanceMeta>,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListReport {
    pub active: Vec<InstanceView>,
    pub history: BTreeMap<String, usize>,
}

fn state_of(meta: Option<&InstanceMeta>) -> InstanceState {
    match meta.and_then(InstanceMeta::tracked_pid) {
        Some(pid) if liveness::is_alive(pid) => InstanceState::Running,
        _ => InstanceState::Stopped,
    }
}

/// Drives instance lifecycles against a [`StateStore`]. Holds no state of its
/// own between calls; every operation re-reads the store.
#[derive(Debug, Clone)]
pub struct InstanceManager {
    store: StateStore,
}

impl InstanceManager {
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn start(
        &self,
        req: &StartRequest,
        launcher: &dyn LaunchStrategy,
    ) -> LifecycleResult<Started> {
        self.start_at(req, launcher, Local::now())
    }

    pub fn start_at(
        &self,
        req: &StartRequest,
        launcher: &dyn LaunchStrategy,
        now: DateTime<Local>,
    ) -> LifecycleResult<Started> {
        let name = InstanceName::new(&req.name)?;

        if let Some(existing) = self.store.active_id(name.as_str())
            && let Some(meta) = self.store.read_meta(&existing)
            && let Some(pid) = meta.tracked_pid()
            && liveness::is_alive(pid)
        {
            return Err(LifecycleError::AlreadyRunning {
                name: name.to_string(),
                pid,
            });
        }

        if !req.cwd.is_dir() {
            return Err(LifecycleError::MissingCwd(req.cwd.clone()));
        }

        self.store.ensure_dirs()?;
        let id = InstanceId::mint(&name, now.naive_local());
        let dir = self.store.instance_dir(&id);
        if dir.exists() {
            return Err(LifecycleError::IdCollision(id));
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| anyhow::Error::new(e).context(format!("create {}", dir.display())))?;

        let log_file = self.store.log_path(&id);
        let spec = LaunchSpec {
            instance_id: &id,
            command: &req.command,
            cwd: &req.cwd,
            env: &req.env,
            instance_dir: &dir,
            log_file: &log_file,
        };

        tracing::debug!(instance_id = %id, mode = %launcher.mode(), "launching");
        let launched = match launcher.launch(&spec) {
            Ok(l) => l,
            Err(e) => {
                // Without a meta.json the directory is not an instance; drop it.
                let _ = std::fs::remove_dir_all(&dir);
                return Err(e.context(format!("launch {}", name)).into());
            }
        };

        let (pid, window_pid) = match launched.mode {
            LaunchMode::Headless => (launched.pid, None),
            LaunchMode::Window => (None, launched.pid),
        };
        let meta = InstanceMeta {
            instance_id: id.clone(),
            name: name.to_string(),
            command: req.command.clone(),
            cwd: req.cwd.clone(),
            started_at: now.with_timezone(&Utc),
            log_file: launched.log_file,
            pid,
            window_pid,
        };

        // Metadata first, so the index never points at a missing record.
        self.store.write_meta(&meta)?;
        self.store.set_active(name.as_str(), &id)?;

        tracing::info!(name = %name, instance_id = %id, mode = %launched.mode, pid = ?meta.tracked_pid(), "instance started");
        Ok(Started {
            meta,
            warning: launched.warning,
        })
    }

    /// Idempotent: anything short of a live process is reported as a no-op
    /// and the stale index entry is dropped.
    pub fn stop(&self, name: &str) -> LifecycleResult<StopOutcome> {
        let Some(id) = self.store.active_id(name) else {
            return Ok(StopOutcome::NotActive);
        };
        let Some(meta) = self.store.read_meta(&id) else {
            self.store.clear_active(name)?;
            return Ok(StopOutcome::MetaMissing(id));
        };
        let Some(pid) = meta.tracked_pid() else {
            self.store.clear_active(name)?;
            return Ok(StopOutcome::NoPid(id));
        };
        if !liveness::is_alive(pid) {
            self.store.clear_active(name)?;
            return Ok(StopOutcome::NotRunning { pid });
        }

        let outcome = match liveness::kill_tree(pid, Signal::Terminate) {
            Ok(()) => StopOutcome::Stopped { pid },
            Err(term_err) => {
                tracing::warn!(pid, error = %term_err, "SIGTERM delivery failed; escalating");
                // A second failure leaves the index alone for the caller.
                liveness::kill_tree(pid, Signal::Kill)
                    .map_err(|source| LifecycleError::TerminateFailed { pid, source })?;
                StopOutcome::ForceKilled {
                    pid,
                    term_error: term_err.to_string(),
                }
            }
        };

        self.store.clear_active(name)?;
        tracing::info!(name, pid, "instance stopped");
        Ok(outcome)
    }

    /// Stops every active name; one failure does not stop the rest.
    pub fn stop_all(&self) -> Vec<(String, LifecycleResult<StopOutcome>)> {
        let names: Vec<String> = self.store.load_active_map().into_keys().collect();
        names
            .into_iter()
            .map(|name| {
                let res = self.stop(&name);
                (name, res)
            })
            .collect()
    }

    fn resolve_active(&self, name: &str) -> LifecycleResult<(InstanceId, InstanceMeta)> {
        let id = self
            .store
            .active_id(name)
            .ok_or_else(|| LifecycleError::NoActiveInstance(name.to_string()))?;
        let meta = self
            .store
            .read_meta(&id)
            .ok_or_else(|| LifecycleError::MetaMissing(id.clone()))?;
        Ok((id, meta))
    }

    pub fn status(&self, name: &str) -> LifecycleResult<InstanceView> {
        let (instance_id, meta) = self.resolve_active(name)?;
        Ok(InstanceView {
            name: name.to_string(),
            instance_id,
            state: state_of(Some(&meta)),
            meta: Some(meta),
        })
    }

    pub fn log_file(&self, name: &str) -> LifecycleResult<PathBuf> {
        let (_, meta) = self.resolve_active(name)?;
        if !meta.log_file.is_file() {
            return Err(LifecycleError::LogMissing(meta.log_file));
        }
        Ok(meta.log_file)
    }

    pub fn list(&self) -> ListReport {
        let active: ActiveMap = self.store.load_active_map();
        let active = active
            .into_iter()
            .map(|(name, instance_id)| {
                let meta = self.store.read_meta(&instance_id);
                InstanceView {
                    name,
                    instance_id,
                    state: state_of(meta.as_ref()),
                    meta,
                }
            })
            .collect();

        let history = retention::group_by_owner(self.store.list_all_instance_ids())
            .into_iter()
            .map(|(name, ids)| (name, ids.len()))
            .collect();

        ListReport { active, history }
    }

    /// Every recorded run of `name`, newest first.
    pub fn history(&self, name: &str) -> Vec<HistoryEntry> {
        let active = self.store.active_id(name);
        self.store
            .list_instance_ids_for_name(name)
            .into_iter()
            .map(|instance_id| HistoryEntry {
                meta: self.store.read_meta(&instance_id),
                active: active.as_ref() == Some(&instance_id),
                instance_id,
            })
            .collect()
    }

    pub fn prune(&self, keep: usize) -> PruneReport {
        retention::prune(&self.store, &self.store.load_active_map(), keep)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        cell::Cell,
        os::unix::process::CommandExt,
        process::Command,
        time::{Duration, Instant},
    };

    use chrono::TimeZone;

    use super::*;
    use crate::launch::Launched;

    struct StubLauncher {
        mode: LaunchMode,
        pid: Option<u32>,
        fail: bool,
        calls: Cell<usize>,
    }

    impl StubLauncher {
        fn headless(pid: u32) -> Self {
            Self {
                mode: LaunchMode::Headless,
                pid: Some(pid),
                fail: false,
                calls: Cell::new(0),
            }
        }
    }

    impl LaunchStrategy for StubLauncher {
        fn mode(&self) -> LaunchMode {
            self.mode
        }

        fn launch(&self, spec: &LaunchSpec<'_>) -> anyhow::Result<Launched> {
            self.calls.set(self.calls.get() + 1);
            if self.fail {
                anyhow::bail!("no terminal available");
            }
            assert!(spec.instance_dir.is_dir());
            std::fs::write(spec.log_file, "").unwrap();
            Ok(Launched {
                mode: self.mode,
                pid: self.pid,
                log_file: spec.log_file.to_path_buf(),
                warning: self.pid.is_none().then(|| "no pid".to_string()),
            })
        }
    }

    fn dead_pid() -> u32 {
        let mut child = Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn request(name: &str, cwd: &std::path::Path) -> StartRequest {
        StartRequest {
            name: name.to_string(),
            command: "sleep 60".to_string(),
            cwd: cwd.to_path_buf(),
            env: Vec::new(),
        }
    }

    fn at(secs: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 1, 12, 0, secs).unwrap()
    }

    fn manager(tmp: &tempfile::TempDir) -> InstanceManager {
        InstanceManager::new(StateStore::new(tmp.path().join("home")))
    }

    #[test]
    fn first_start_creates_one_instance_and_makes_it_active() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let started = mgr
            .start_at(&request("api", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap();

        assert_eq!(started.meta.instance_id.as_str(), "api_20240501_120000");
        assert_eq!(mgr.store().list_all_instance_ids(), vec![started.meta.instance_id.clone()]);
        assert_eq!(mgr.store().active_id("api"), Some(started.meta.instance_id.clone()));
        assert_eq!(mgr.store().read_meta(&started.meta.instance_id), Some(started.meta.clone()));
        assert_eq!(started.meta.mode(), LaunchMode::Headless);
    }

    #[test]
    fn start_while_live_is_a_conflict_and_changes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let live = std::process::id();
        let first = mgr
            .start_at(&request("api", tmp.path()), &StubLauncher::headless(live), at(0))
            .unwrap();

        let stub = StubLauncher::headless(live);
        let err = mgr
            .start_at(&request("api", tmp.path()), &stub, at(5))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::AlreadyRunning { pid, .. } if pid == live));
        assert_eq!(stub.calls.get(), 0);
        assert_eq!(mgr.store().list_all_instance_ids().len(), 1);
        assert_eq!(mgr.store().active_id("api"), Some(first.meta.instance_id));
    }

    #[test]
    fn restart_after_exit_replaces_active_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        mgr.start_at(&request("api", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap();
        let second = mgr
            .start_at(&request("api", tmp.path()), &StubLauncher::headless(dead_pid()), at(1))
            .unwrap();

        assert_eq!(mgr.store().active_id("api"), Some(second.meta.instance_id));
        assert_eq!(mgr.history("api").len(), 2);
        assert!(mgr.history("api")[0].active);
    }

    #[test]
    fn same_second_start_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        mgr.start_at(&request("api", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap();
        let err = mgr
            .start_at(&request("api", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IdCollision(_)));
    }

    #[test]
    fn failed_launch_leaves_no_instance_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let stub = StubLauncher {
            fail: true,
            ..StubLauncher::headless(1)
        };
        let err = mgr.start_at(&request("ui", tmp.path()), &stub, at(0)).unwrap_err();
        assert!(format!("{err}").contains("launch ui"));
        assert!(mgr.store().list_all_instance_ids().is_empty());
        assert!(!mgr.store().instance_dir(&InstanceId("ui_20240501_120000".into())).exists());
        assert_eq!(mgr.store().active_id("ui"), None);
    }

    #[test]
    fn windowed_start_without_pid_is_recorded_with_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let stub = StubLauncher {
            mode: LaunchMode::Window,
            pid: None,
            ..StubLauncher::headless(1)
        };
        let started = mgr.start_at(&request("ui", tmp.path()), &stub, at(0)).unwrap();
        assert_eq!(started.warning.as_deref(), Some("no pid"));
        assert_eq!(started.meta.mode(), LaunchMode::Window);
        assert_eq!(started.meta.pid, None);

        assert_eq!(mgr.stop("ui").unwrap(), StopOutcome::NoPid(started.meta.instance_id));
        assert_eq!(mgr.store().active_id("ui"), None);
    }

    #[test]
    fn invalid_name_and_missing_cwd_are_rejected_before_launch() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let stub = StubLauncher::headless(1);
        assert!(matches!(
            mgr.start_at(&request("../x", tmp.path()), &stub, at(0)),
            Err(LifecycleError::InvalidName(_))
        ));
        assert!(matches!(
            mgr.start_at(&request("api ", tmp.path()), &stub, at(0)),
            Err(LifecycleError::InvalidName(_))
        ));
        assert!(matches!(
            mgr.start_at(&request("x", &tmp.path().join("missing")), &stub, at(0)),
            Err(LifecycleError::MissingCwd(_))
        ));
        assert_eq!(stub.calls.get(), 0);
    }

    #[test]
    fn stop_with_dead_pid_clears_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let pid = dead_pid();
        mgr.start_at(&request("api", tmp.path()), &StubLauncher::headless(pid), at(0))
            .unwrap();

        assert_eq!(mgr.stop("api").unwrap(), StopOutcome::NotRunning { pid });
        assert_eq!(mgr.store().active_id("api"), None);
        assert_eq!(mgr.store().list_all_instance_ids().len(), 1);
    }

    #[test]
    fn stop_without_active_entry_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        assert_eq!(mgr.stop("ghost").unwrap(), StopOutcome::NotActive);
        assert_eq!(mgr.stop("ghost").unwrap(), StopOutcome::NotActive);
        assert!(mgr.store().load_active_map().is_empty());
    }

    #[test]
    fn stop_with_missing_meta_clears_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let id = InstanceId("api_20240501_120000".to_string());
        mgr.store().set_active("api", &id).unwrap();

        assert_eq!(mgr.stop("api").unwrap(), StopOutcome::MetaMissing(id));
        assert_eq!(mgr.store().active_id("api"), None);
    }

    #[test]
    fn stop_terminates_live_process_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        let mut child = Command::new("sh")
            .args(["-c", "sleep 60 & wait"])
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id();

        mgr.start_at(&request("worker", tmp.path()), &StubLauncher::headless(pid), at(0))
            .unwrap();
        assert_eq!(mgr.status("worker").unwrap().state, InstanceState::Running);

        assert_eq!(mgr.stop("worker").unwrap(), StopOutcome::Stopped { pid });
        assert_eq!(mgr.store().active_id("worker"), None);

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut exited = false;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = child.try_wait() {
                exited = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(exited);
    }

    #[test]
    fn stop_all_isolates_each_name() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        mgr.start_at(&request("a", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap();
        mgr.store()
            .set_active("b", &InstanceId("b_20240501_120000".to_string()))
            .unwrap();

        let results = mgr.stop_all();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert!(mgr.store().load_active_map().is_empty());
    }

    #[test]
    fn status_and_logs_report_not_found_cases() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        assert!(matches!(mgr.status("api"), Err(LifecycleError::NoActiveInstance(_))));
        assert!(matches!(mgr.log_file("api"), Err(LifecycleError::NoActiveInstance(_))));

        let id = InstanceId("api_20240501_120000".to_string());
        mgr.store().set_active("api", &id).unwrap();
        assert!(matches!(mgr.status("api"), Err(LifecycleError::MetaMissing(_))));

        let started = mgr
            .start_at(&request("web", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap();
        assert_eq!(mgr.log_file("web").unwrap(), started.meta.log_file);
        assert_eq!(mgr.status("web").unwrap().state, InstanceState::Stopped);

        std::fs::remove_file(&started.meta.log_file).unwrap();
        assert!(matches!(mgr.log_file("web"), Err(LifecycleError::LogMissing(_))));
    }

    #[test]
    fn list_reports_active_and_history_counts() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = manager(&tmp);
        for s in 0..3 {
            mgr.start_at(&request("api", tmp.path()), &StubLauncher::headless(dead_pid()), at(s))
                .unwrap();
        }
        mgr.start_at(&request("web", tmp.path()), &StubLauncher::headless(dead_pid()), at(0))
            .unwrap();
        mgr.stop("web").unwrap();

        let report = mgr.list();
        assert_eq!(report.active.len(), 1);
        assert_eq!(report.active[0].name, "api");
        assert_eq!(report.active[0].state, InstanceState::Stopped);
        assert_eq!(report.history.get("api"), Some(&3));
        assert_eq!(report.history.get("web"), Some(&1));
    }
}
