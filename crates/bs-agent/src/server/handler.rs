//! Request dispatch
//!
//! Every request passes the admission gate first. Failures become
//! `RpcResponse::Error` with the error's wire kind; nothing here tears the
//! connection down.

use std::fmt::Display;

use bs_core::error::{InstallError, UploadError};
use bs_core::rpc::{InstallRequestItem, InstallResult, RpcRequest, RpcResponse};
use bs_core::{BsError, ConnectionId};

use crate::state::AgentState;

/// Answer one request from connection `id`
pub async fn handle_request(
    request: RpcRequest,
    state: &AgentState,
    id: &ConnectionId,
) -> RpcResponse {
    if !state.connections.is_active(id) {
        tracing::warn!("Rejected request from inactive connection {}", id);
        return failure(BsError::Unauthorized);
    }

    match request {
        RpcRequest::StartUpload(metadata) => {
            tracing::info!(
                "StartUpload from {}: {} ({} bytes, chunk {})",
                id,
                metadata.file_name,
                metadata.file_size,
                metadata.chunk_size
            );
            match state.uploads.start_upload(id, metadata).await {
                Ok(ticket) => RpcResponse::UploadStarted(ticket),
                Err(e) => failure(e),
            }
        }

        RpcRequest::UploadChunk { data, chunk_index } => {
            match state.uploads.process_chunk(id, &data, chunk_index).await {
                Ok(receipt) => RpcResponse::ChunkAccepted(receipt),
                Err(e) => failure(e),
            }
        }

        RpcRequest::EndUpload => match state.uploads.end_upload(id).await {
            Ok(result) => RpcResponse::UploadCompleted(result),
            Err(e) => failure(e),
        },

        RpcRequest::GetUploadStatus => match state.uploads.snapshot(id).await {
            Some(snapshot) => RpcResponse::UploadStatus(snapshot),
            None => failure(UploadError::NoActiveSession),
        },

        RpcRequest::Install { items } => match install(state, id, &items).await {
            Ok(result) => RpcResponse::InstallStarted(result),
            Err(e) => failure(e),
        },

        RpcRequest::ControlInstall { action } => {
            if !state.installer.has_active_session() {
                return RpcResponse::NoActiveSession;
            }
            match state.installer.control_action(&action) {
                Ok(result) => RpcResponse::ControlInstall(result),
                Err(e) => failure(e),
            }
        }

        RpcRequest::GetSessionStatus => match state.installer.session_status() {
            Some(report) => RpcResponse::SessionStatus(report),
            None => RpcResponse::NoActiveSession,
        },

        RpcRequest::Ping => RpcResponse::Pong,
    }
}

/// Link the connection's extracted bundles to the queue and start it
async fn install(
    state: &AgentState,
    id: &ConnectionId,
    items: &[InstallRequestItem],
) -> Result<InstallResult, InstallError> {
    let installer = &state.installer;
    tracing::info!("Install requested by {} for {} packages", id, items.len());

    let session_id = installer.get_or_create_session();
    installer.set_base_folder_path(&state.uploads.connection_dir(id))?;
    installer.associate_connection(id)?;
    let queued = installer.initialize_queue(items).await?;
    installer.start_or_resume()?;

    Ok(InstallResult {
        session_id,
        status: installer.status().ok_or(InstallError::NoSession)?,
        queued,
    })
}

fn failure<E>(err: E) -> RpcResponse
where
    E: Display,
    BsError: From<E>,
{
    let message = err.to_string();
    let kind = BsError::from(err).kind();
    tracing::warn!("Request failed ({:?}): {}", kind, message);
    RpcResponse::Error { kind, message }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bs_core::config::{AgentConfig, Platform};
    use bs_core::hash::sha256_hex;
    use bs_core::{ErrorKind, ItemStatus};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    use crate::extract::ArchiveExtractor;
    use crate::install::ScriptRunner;

    /// Each run waits for one permit
    struct GatedRunner {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl ScriptRunner for GatedRunner {
        async fn run(&self, _folder: &Path, _platform: Platform) -> Result<(), InstallError> {
            self.gate
                .acquire()
                .await
                .map_err(|_| InstallError::TaskFailed("gate closed".into()))?
                .forget();
            Ok(())
        }
    }

    fn state(dir: &std::path::Path) -> AgentState {
        AgentState::new(AgentConfig {
            work_dir: dir.to_path_buf(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_unregistered_connection_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let response = handle_request(RpcRequest::Ping, &state, &ConnectionId::new("x")).await;
        match response {
            RpcResponse::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Unauthorized);
                assert_eq!(message, "Connection not authorized");
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_status_without_session() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let id = ConnectionId::new("c");
        assert!(state.connections.register(&id));

        assert!(matches!(
            handle_request(RpcRequest::GetSessionStatus, &state, &id).await,
            RpcResponse::NoActiveSession
        ));
        assert!(matches!(
            handle_request(
                RpcRequest::ControlInstall {
                    action: "stop".into()
                },
                &state,
                &id
            )
            .await,
            RpcResponse::NoActiveSession
        ));
        match handle_request(RpcRequest::GetUploadStatus, &state, &id).await {
            RpcResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::SessionStateError),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_install_without_upload_dir() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(dir.path());
        let id = ConnectionId::new("c");
        assert!(state.connections.register(&id));

        let request = RpcRequest::Install {
            items: vec![InstallRequestItem {
                id: "app".into(),
                version: "1.0".into(),
            }],
        };
        match handle_request(request, &state, &id).await {
            RpcResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::DirectoryNotFound),
            other => panic!("unexpected response: {:?}", other),
        }
    }

    async fn wait_for_item(state: &AgentState, index: usize, status: ItemStatus) {
        for _ in 0..200 {
            if state.installer.all_items()[index].status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("item {} never reached {}", index, status);
    }

    #[tokio::test]
    async fn test_install_request_does_not_lift_manual_stop() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let mut config = AgentConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.install.platform = Some(Platform::UbuntuAmd64);
        let state = AgentState::with_collaborators(
            config,
            Arc::new(ArchiveExtractor::new()),
            Arc::new(GatedRunner { gate: gate.clone() }),
        );

        let first = ConnectionId::new("conn-1");
        assert!(state.connections.register(&first));
        let base = state.uploads.connection_dir(&first);
        for id in ["app.a", "app.b"] {
            let folder = base.join(sha256_hex(id)).join("1.0").join("ubuntu_amd64");
            std::fs::create_dir_all(&folder).unwrap();
            std::fs::write(folder.join("install.sh"), "true\n").unwrap();
        }
        let items: Vec<_> = ["app.a", "app.b"]
            .iter()
            .map(|id| InstallRequestItem {
                id: id.to_string(),
                version: "1.0".into(),
            })
            .collect();

        let request = RpcRequest::Install {
            items: items.clone(),
        };
        match handle_request(request, &state, &first).await {
            RpcResponse::InstallStarted(result) => assert_eq!(result.queued, 2),
            other => panic!("unexpected response: {:?}", other),
        }
        wait_for_item(&state, 0, ItemStatus::Installing).await;

        let stop = RpcRequest::ControlInstall {
            action: "Stop".into(),
        };
        assert!(matches!(
            handle_request(stop, &state, &first).await,
            RpcResponse::ControlInstall(_)
        ));
        gate.add_permits(1);
        wait_for_item(&state, 0, ItemStatus::Completed).await;

        state.connections.unregister(&first);
        assert!(state.installer.disconnect(&first));
        let second = ConnectionId::new("conn-2");
        assert!(state.connections.register(&second));

        let request = RpcRequest::Install { items };
        assert!(matches!(
            handle_request(request, &state, &second).await,
            RpcResponse::InstallStarted(_)
        ));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.installer.all_items()[1].status, ItemStatus::Pending);

        let resume = RpcRequest::ControlInstall {
            action: "continue".into(),
        };
        assert!(matches!(
            handle_request(resume, &state, &second).await,
            RpcResponse::ControlInstall(_)
        ));
        wait_for_item(&state, 1, ItemStatus::Installing).await;
        gate.add_permits(1);
        wait_for_item(&state, 1, ItemStatus::Completed).await;
    }
}
