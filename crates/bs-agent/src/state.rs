//! Agent state shared by the server, the reaper and background tasks

use std::sync::Arc;

use bs_core::config::AgentConfig;

use crate::connection::ConnectionRegistry;
use crate::extract::{ArchiveExtractor, Extractor};
use crate::install::{InstallOrchestrator, ScriptRunner, ShellScriptRunner};
use crate::keys::KeyStore;
use crate::upload::UploadManager;

/// Services built once at startup and handed to every connection
pub struct AgentState {
    /// Configuration
    pub config: AgentConfig,
    /// Admitted connections
    pub connections: Arc<ConnectionRegistry>,
    /// Per-connection encryption keys
    pub keys: Arc<KeyStore>,
    /// Upload sessions
    pub uploads: Arc<UploadManager>,
    /// Installation queue
    pub installer: InstallOrchestrator,
}

impl AgentState {
    /// Create state with the archive extractor and shell script runner
    pub fn new(config: AgentConfig) -> Self {
        let runner = Arc::new(ShellScriptRunner::new(config.install.clone()));
        Self::with_collaborators(config, Arc::new(ArchiveExtractor::new()), runner)
    }

    /// Create state with provided extraction and script collaborators
    pub fn with_collaborators(
        config: AgentConfig,
        extractor: Arc<dyn Extractor>,
        runner: Arc<dyn ScriptRunner>,
    ) -> Self {
        let keys = Arc::new(KeyStore::new());
        let uploads = Arc::new(UploadManager::new(
            config.upload.clone(),
            config.work_dir.clone(),
            Arc::clone(&keys),
            extractor,
        ));
        Self {
            connections: Arc::new(ConnectionRegistry::new(config.max_connections)),
            keys,
            uploads,
            installer: InstallOrchestrator::new(config.install.clone(), runner),
            config,
        }
    }
}
