//! One package in the installation queue

use std::path::PathBuf;

use bs_core::rpc::{InstallProgress, ItemSnapshot, ItemStatusEntry};
use bs_core::time::current_time_millis;
use bs_core::ItemStatus;

/// A requested package+version with its own lifecycle
#[derive(Debug, Clone)]
pub struct InstallationItem {
    pub id: String,
    /// Name of the extracted package folder
    pub name: String,
    pub version: String,
    /// Folder holding the platform's stage scripts
    pub script_folder: PathBuf,
    pub status: ItemStatus,
    pub started_at: Option<u64>,
    pub completed_at: Option<u64>,
    pub error_message: Option<String>,
}

impl InstallationItem {
    pub fn new(id: String, name: String, version: String, script_folder: PathBuf) -> Self {
        Self {
            id,
            name,
            version,
            script_folder,
            status: ItemStatus::Pending,
            started_at: None,
            completed_at: None,
            error_message: None,
        }
    }

    /// "<id> - <version>"
    pub fn display_name(&self) -> String {
        format!("{} - {}", self.id, self.version)
    }

    pub(crate) fn mark_installing(&mut self) {
        self.status = ItemStatus::Installing;
        self.started_at = Some(current_time_millis());
    }

    pub(crate) fn mark_completed(&mut self) {
        self.status = ItemStatus::Completed;
        self.completed_at = Some(current_time_millis());
        self.error_message = None;
    }

    pub(crate) fn mark_failed(&mut self, message: String) {
        self.status = ItemStatus::Failed;
        self.completed_at = Some(current_time_millis());
        self.error_message = Some(message);
    }

    pub fn snapshot(&self) -> ItemSnapshot {
        ItemSnapshot {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            status: self.status,
            started_at: self.started_at,
            completed_at: self.completed_at,
            error_message: self.error_message.clone(),
        }
    }

    pub fn status_entry(&self) -> ItemStatusEntry {
        ItemStatusEntry {
            id: self.id.clone(),
            version: self.version.clone(),
            status: self.status,
        }
    }

    /// Notification for a finished item
    pub fn progress(&self) -> InstallProgress {
        let success = self.status == ItemStatus::Completed;
        InstallProgress {
            id: self.id.clone(),
            version: self.version.clone(),
            progress: if success { 100 } else { 0 },
            status: self.status,
            has_error: !success,
            error_message: self.error_message.clone(),
        }
    }
}
