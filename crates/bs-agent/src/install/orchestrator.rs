//! Installation orchestrator
//!
//! Owns the single installation session and drives its queue. Items run one
//! at a time in queue order; each runs as a supervised background task whose
//! outcome is committed back under the session lock before the queue
//! advances. The lock is never held while a script runs.
//!
//! # Advancing
//!
//! The queue advances after a start/resume and after every item finishes.
//! A new item starts only while a client is connected, the queue is not
//! manually paused and nothing else is in flight. A failed item never halts
//! the queue.

use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;

use bs_core::config::{InstallConfig, Platform};
use bs_core::error::InstallError;
use bs_core::hash::sha256_hex;
use bs_core::rpc::{
    ControlInstallResult, InstallProgress, InstallRequestItem, ItemSnapshot, SessionStatusReport,
};
use bs_core::{ConnectionId, ItemStatus, SessionStatus};

use super::item::InstallationItem;
use super::runner::{has_runnable_scripts, ScriptRunner};
use super::session::InstallationSession;
use crate::tasks::BackgroundTasks;

const PROGRESS_CHANNEL_CAPACITY: usize = 64;

/// Handle to the orchestrator; clones share the same session
#[derive(Clone)]
pub struct InstallOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    session: Mutex<Option<InstallationSession>>,
    runner: Arc<dyn ScriptRunner>,
    tasks: BackgroundTasks,
    progress_tx: broadcast::Sender<InstallProgress>,
    config: InstallConfig,
}

/// Work picked by the advance step, launched after the lock is released
struct Launch {
    session_id: String,
    index: usize,
    name: String,
    folder: PathBuf,
}

impl InstallOrchestrator {
    pub fn new(config: InstallConfig, runner: Arc<dyn ScriptRunner>) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                session: Mutex::new(None),
                runner,
                tasks: BackgroundTasks::new(),
                progress_tx,
                config,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<InstallationSession>> {
        self.inner
            .session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Progress notifications for finished items
    pub fn subscribe(&self) -> broadcast::Receiver<InstallProgress> {
        self.inner.progress_tx.subscribe()
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.inner.tasks
    }

    /// Reuse the current session unless it completed, else start a new one
    pub fn get_or_create_session(&self) -> String {
        let mut guard = self.lock();
        if let Some(session) = guard.as_ref() {
            if session.status != SessionStatus::Completed {
                tracing::debug!("Reusing installation session {}", session.session_id);
                return session.session_id.clone();
            }
        }
        let session = InstallationSession::new();
        let id = session.session_id.clone();
        tracing::info!("Created installation session {}", id);
        *guard = Some(session);
        id
    }

    pub fn has_active_session(&self) -> bool {
        self.lock().is_some()
    }

    pub fn session_id(&self) -> Option<String> {
        self.lock().as_ref().map(|s| s.session_id.clone())
    }

    pub fn status(&self) -> Option<SessionStatus> {
        self.lock().as_ref().map(|s| s.status)
    }

    /// Link the folder packages are discovered under; the first link wins
    pub fn set_base_folder_path(&self, path: &Path) -> Result<(), InstallError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(InstallError::NoSession)?;
        if let Some(existing) = &session.base_folder {
            tracing::debug!("Base folder already set to {:?}, keeping it", existing);
            return Ok(());
        }
        if !path.is_dir() {
            return Err(InstallError::DirectoryNotFound(path.to_path_buf()));
        }
        tracing::info!("Base folder set to {:?}", path);
        session.base_folder = Some(path.to_path_buf());
        Ok(())
    }

    /// Mark `id` as the connected client
    ///
    /// A session paused by its client leaving goes back to `Running`. A
    /// manual stop is untouched; only `resume` lifts it.
    pub fn associate_connection(&self, id: &ConnectionId) -> Result<(), InstallError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(InstallError::NoSession)?;
        session.connection_id = Some(id.clone());
        session.connected = true;
        if session.status == SessionStatus::Paused {
            session.status = SessionStatus::Running;
            tracing::info!("Installation session picked up by connection {}", id);
        } else {
            tracing::info!("Connection {} associated with installation session", id);
        }
        Ok(())
    }

    /// Relink a (re)connecting client to an unfinished session
    ///
    /// Returns whether a session picked the connection up.
    pub fn setup_connection_id(&self, id: &ConnectionId) -> bool {
        let resumable = matches!(
            self.lock().as_ref(),
            Some(s) if s.status != SessionStatus::Completed
        );
        resumable && self.associate_connection(id).is_ok()
    }

    /// Unlink `id` if it is the linked connection; a running queue waits
    /// as `Paused` for the next client
    pub fn disconnect(&self, id: &ConnectionId) -> bool {
        let mut guard = self.lock();
        let Some(session) = guard.as_mut() else {
            return false;
        };
        if session.connection_id.as_ref() != Some(id) {
            return false;
        }
        session.connection_id = None;
        session.connected = false;
        if session.status == SessionStatus::Running {
            session.status = SessionStatus::Paused;
        }
        tracing::info!("Connection {} detached from installation session", id);
        true
    }

    /// Materialize the queue from the extracted packages, once per session
    ///
    /// Packages without a folder or without scripts for this platform are
    /// skipped. Returns the number of queued items.
    pub async fn initialize_queue(
        &self,
        requested: &[InstallRequestItem],
    ) -> Result<usize, InstallError> {
        let base = {
            let guard = self.lock();
            let session = guard.as_ref().ok_or(InstallError::NoSession)?;
            if !session.items.is_empty() {
                tracing::debug!("Queue already initialized with {} items", session.items.len());
                return Ok(session.items.len());
            }
            session
                .base_folder
                .clone()
                .ok_or(InstallError::BaseFolderNotSet)?
        };

        let platform = self.inner.config.resolve_platform()?;
        tracing::info!("Initializing queue for platform {}", platform);

        let requested = requested.to_vec();
        let items = tokio::task::spawn_blocking(move || discover_items(&base, &requested, platform))
            .await
            .map_err(|e| InstallError::TaskFailed(format!("queue discovery: {}", e)))??;

        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(InstallError::NoSession)?;
        if session.items.is_empty() {
            tracing::info!("Queued {} installation items", items.len());
            session.items = items;
        }
        Ok(session.items.len())
    }

    /// Set the session running and try to start the next item
    pub fn start_or_resume(&self) -> Result<(), InstallError> {
        {
            let mut guard = self.lock();
            let session = guard.as_mut().ok_or(InstallError::NoSession)?;
            if session.status == SessionStatus::Completed {
                return Ok(());
            }
            session.status = SessionStatus::Running;
            if session.paused {
                tracing::info!("Installation is stopped; pending items wait for continue");
            }
        }
        self.advance();
        Ok(())
    }

    /// Pause after the current item finishes
    pub fn stop(&self) -> Result<(), InstallError> {
        let mut guard = self.lock();
        let session = guard.as_mut().ok_or(InstallError::NoSession)?;
        session.paused = true;
        tracing::info!("Installation paused");
        Ok(())
    }

    /// Lift a manual pause and continue with pending items
    pub fn resume(&self) -> Result<(), InstallError> {
        {
            let mut guard = self.lock();
            let session = guard.as_mut().ok_or(InstallError::NoSession)?;
            session.paused = false;
            if session.status == SessionStatus::Paused {
                session.status = SessionStatus::Running;
            }
            tracing::info!("Installation resumed");
        }
        self.advance();
        Ok(())
    }

    /// Dispatch a control action (`stop` / `continue`, any case)
    pub fn control_action(&self, action: &str) -> Result<ControlInstallResult, InstallError> {
        let result = match action.to_ascii_lowercase().as_str() {
            "stop" => {
                self.stop()?;
                "Install process stopped. Current item will finish, then queue will pause."
                    .to_string()
            }
            "continue" => {
                self.resume()?;
                "Install process resumed. Processing will continue with pending items.".to_string()
            }
            _ => {
                tracing::warn!("Unknown install control action: {}", action);
                format!(
                    "Unknown action: {}. Supported actions: 'Stop', 'Continue'",
                    action
                )
            }
        };

        let guard = self.lock();
        let session = guard.as_ref().ok_or(InstallError::NoSession)?;
        let counts = session.counts();
        Ok(ControlInstallResult {
            action: action.to_string(),
            result,
            status: session.status,
            paused: session.paused,
            connected: session.connected,
            current_item: session
                .current_item()
                .filter(|item| item.status == ItemStatus::Installing)
                .map(|item| item.display_name())
                .unwrap_or_else(|| "None".to_string()),
            items: session.items.iter().map(|i| i.snapshot()).collect(),
            pending: counts.pending,
            processing: counts.installing,
            completed: counts.completed,
            failed: counts.failed,
        })
    }

    /// Compact per-item report, or `None` without a session
    pub fn session_status(&self) -> Option<SessionStatusReport> {
        let guard = self.lock();
        let session = guard.as_ref()?;
        let counts = session.counts();
        Some(SessionStatusReport {
            session_id: session.session_id.clone(),
            status: session.status,
            items: session.items.iter().map(|i| i.status_entry()).collect(),
            total: session.items.len(),
            completed: counts.completed,
            failed: counts.failed,
            pending: counts.pending,
        })
    }

    pub fn all_items(&self) -> Vec<ItemSnapshot> {
        self.lock()
            .as_ref()
            .map(|s| s.items.iter().map(|i| i.snapshot()).collect())
            .unwrap_or_default()
    }

    /// Drop the session; an item still running reports into the void
    pub fn clear_session(&self) -> bool {
        let cleared = self.lock().take();
        if let Some(session) = &cleared {
            tracing::info!("Cleared installation session {}", session.session_id);
        }
        cleared.is_some()
    }

    /// Start the next pending item if the session allows it
    pub fn advance(&self) {
        let launch = {
            let mut guard = self.lock();
            let Some(session) = guard.as_mut() else {
                return;
            };
            if !session.can_process_next() {
                return;
            }
            match session.next_pending() {
                Some(index) => {
                    let item = &mut session.items[index];
                    item.mark_installing();
                    tracing::info!("Installing {}", item.display_name());
                    let launch = Launch {
                        session_id: session.session_id.clone(),
                        index,
                        name: item.display_name(),
                        folder: item.script_folder.clone(),
                    };
                    session.current = Some(index);
                    Some(launch)
                }
                None => {
                    if session.all_terminal() && session.status != SessionStatus::Completed {
                        session.status = SessionStatus::Completed;
                        session.current = None;
                        let counts = session.counts();
                        tracing::info!(
                            "Installation session {} completed ({} succeeded, {} failed)",
                            session.session_id,
                            counts.completed,
                            counts.failed
                        );
                    }
                    None
                }
            }
        };

        if let Some(launch) = launch {
            self.launch(launch);
        }
    }

    fn launch(&self, launch: Launch) {
        let Launch {
            session_id,
            index,
            name,
            folder,
        } = launch;
        let runner = Arc::clone(&self.inner.runner);
        let platform = self.inner.config.resolve_platform();
        let this = self.clone();

        self.inner.tasks.spawn(
            format!("install {}", name),
            async move {
                let platform: Platform = platform?;
                runner.run(&folder, platform).await
            },
            move |outcome| {
                this.finish_item(&session_id, index, outcome);
                this.advance();
            },
        );
    }

    /// Commit an item's outcome and notify subscribers
    fn finish_item(&self, session_id: &str, index: usize, outcome: Result<(), InstallError>) {
        let progress = {
            let mut guard = self.lock();
            let Some(session) = guard.as_mut().filter(|s| s.session_id == session_id) else {
                tracing::debug!("Session {} is gone, dropping item outcome", session_id);
                return;
            };
            let Some(item) = session.items.get_mut(index) else {
                return;
            };
            if item.status != ItemStatus::Installing {
                return;
            }
            match outcome {
                Ok(()) => {
                    item.mark_completed();
                    tracing::info!("Installed {}", item.display_name());
                }
                Err(e) => {
                    tracing::error!("Installation of {} failed: {}", item.display_name(), e);
                    item.mark_failed(e.to_string());
                }
            }
            let progress = item.progress();
            if session.current == Some(index) {
                session.current = None;
            }
            progress
        };

        // No subscribers is fine
        let _ = self.inner.progress_tx.send(progress);
    }
}

/// Folders that may hold packages: the base folder's children and, for
/// extracted bundles, their children
fn package_folders(base: &Path) -> Result<Vec<PathBuf>, InstallError> {
    if !base.is_dir() {
        return Err(InstallError::DirectoryNotFound(base.to_path_buf()));
    }

    let mut top = subdirectories(base)?;
    top.retain(|dir| {
        !dir.file_name()
            .map(|n| n.to_string_lossy().ends_with(".bundle"))
            .unwrap_or(false)
    });

    let mut folders = top.clone();
    for dir in &top {
        folders.extend(subdirectories(dir)?);
    }
    Ok(folders)
}

fn subdirectories(dir: &Path) -> Result<Vec<PathBuf>, InstallError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// A version must name exactly one folder level
fn is_plain_component(version: &str) -> bool {
    let mut components = Path::new(version).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn discover_items(
    base: &Path,
    requested: &[InstallRequestItem],
    platform: Platform,
) -> Result<Vec<InstallationItem>, InstallError> {
    let folders = package_folders(base)?;
    tracing::info!("Found {} candidate package folders", folders.len());

    let mut items: Vec<InstallationItem> = Vec::new();
    for app in requested {
        if items
            .iter()
            .any(|i| i.id == app.id && i.version == app.version)
        {
            continue;
        }
        if !is_plain_component(&app.version) {
            tracing::warn!("Skipping '{}': invalid version '{}'", app.id, app.version);
            continue;
        }

        let expected = sha256_hex(&app.id);
        let Some(folder) = folders.iter().find(|f| {
            f.file_name()
                .map(|n| n.to_string_lossy().eq_ignore_ascii_case(&expected))
                .unwrap_or(false)
        }) else {
            tracing::info!("Folder not found for app '{}' (expected: {})", app.id, expected);
            continue;
        };

        let script_folder = folder.join(&app.version).join(platform.folder_name());
        if !has_runnable_scripts(&script_folder, platform) {
            tracing::info!("No {} scripts for '{}' in {:?}", platform, app.id, script_folder);
            continue;
        }

        let name = folder
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let item = InstallationItem::new(app.id.clone(), name, app.version.clone(), script_folder);
        tracing::info!("Added to queue: {}", item.display_name());
        items.push(item);
    }
    Ok(items)
}
