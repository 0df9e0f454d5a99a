//! The process-wide installation session

use std::path::PathBuf;

use bs_core::{ConnectionId, ItemStatus, SessionStatus};

use super::item::InstallationItem;

/// Item counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: usize,
    pub installing: usize,
    pub completed: usize,
    pub failed: usize,
}

/// Queue of installation items, outliving any single connection
///
/// Lives behind the orchestrator's mutex; nothing here locks.
#[derive(Debug)]
pub struct InstallationSession {
    pub session_id: String,
    pub base_folder: Option<PathBuf>,
    pub connection_id: Option<ConnectionId>,
    pub connected: bool,
    pub paused: bool,
    /// Insertion order is execution order
    pub items: Vec<InstallationItem>,
    /// Index into `items` of the item being installed
    pub current: Option<usize>,
    pub status: SessionStatus,
}

impl InstallationSession {
    pub fn new() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            base_folder: None,
            connection_id: None,
            connected: false,
            paused: false,
            items: Vec::new(),
            current: None,
            status: SessionStatus::Running,
        }
    }

    pub fn current_item(&self) -> Option<&InstallationItem> {
        self.current.and_then(|i| self.items.get(i))
    }

    /// Connected, not paused and nothing in flight
    pub fn can_process_next(&self) -> bool {
        self.connected
            && !self.paused
            && self
                .current_item()
                .map_or(true, |item| item.status.is_terminal())
    }

    /// Every item finished and there was at least one
    pub fn all_terminal(&self) -> bool {
        !self.items.is_empty() && self.items.iter().all(|i| i.status.is_terminal())
    }

    pub fn next_pending(&self) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.status == ItemStatus::Pending)
    }

    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for item in &self.items {
            match item.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Installing => counts.installing += 1,
                ItemStatus::Completed => counts.completed += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

impl Default for InstallationSession {
    fn default() -> Self {
        Self::new()
    }
}
