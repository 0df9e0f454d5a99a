//! Agent integration tests
//!
//! Drives the JSON-lines TCP server the way a client would.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use bs_agent::extract::ArchiveExtractor;
use bs_agent::install::ScriptRunner;
use bs_agent::server::AgentServer;
use bs_agent::AgentState;
use bs_core::config::{AgentConfig, Platform};
use bs_core::crypto::{seal, EncryptionKey};
use bs_core::error::InstallError;
use bs_core::hash::{sha256_bytes_hex, sha256_hex};
use bs_core::rpc::{
    InstallRequestItem, RpcEvent, RpcRequest, RpcResponse, ServerMessage, UploadMetadata,
};
use bs_core::{ErrorKind, ItemStatus, SessionStatus, UploadState};

const PACKAGE_ID: &str = "com.example.tool";

/// Succeeds for every item and counts runs
#[derive(Default)]
struct RecordingRunner {
    runs: AtomicUsize,
}

#[async_trait]
impl ScriptRunner for RecordingRunner {
    async fn run(&self, folder: &Path, _platform: Platform) -> Result<(), InstallError> {
        assert!(folder.join("install.sh").is_file());
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct TestAgent {
    address: String,
    state: Arc<AgentState>,
    runner: Arc<RecordingRunner>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    _dir: tempfile::TempDir,
}

impl TestAgent {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut AgentConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AgentConfig {
            work_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        config.install.platform = Some(Platform::UbuntuAmd64);
        configure(&mut config);

        let runner = Arc::new(RecordingRunner::default());
        let state = Arc::new(AgentState::with_collaborators(
            config,
            Arc::new(ArchiveExtractor::new()),
            runner.clone(),
        ));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let cancel = CancellationToken::new();
        let server = AgentServer::new(address.clone(), Arc::clone(&state))
            .with_shutdown_token(cancel.clone());
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            address,
            state,
            runner,
            cancel,
            handle,
            _dir: dir,
        }
    }

    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// JSON-lines test client
struct TestClient {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
    events: VecDeque<RpcEvent>,
}

impl TestClient {
    async fn connect(address: &str) -> Self {
        // Retry connection a few times in case server isn't ready
        let mut last_err = None;
        for _ in 0..10 {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let (reader, writer) = stream.into_split();
                    return Self {
                        reader: BufReader::new(reader),
                        writer: BufWriter::new(writer),
                        events: VecDeque::new(),
                    };
                }
                Err(e) => {
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
        panic!("Failed to connect to agent at {}: {:?}", address, last_err);
    }

    /// Connect and take the key delivered on admission
    async fn admitted(address: &str) -> (Self, EncryptionKey) {
        let mut client = Self::connect(address).await;
        match client.read_message().await {
            Some(ServerMessage::Event(RpcEvent::SetEncryptionKey { key })) => {
                let key = EncryptionKey::from_base64(&key).expect("Invalid key");
                (client, key)
            }
            other => panic!("Expected encryption key, got {:?}", other),
        }
    }

    async fn read_message(&mut self) -> Option<ServerMessage> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("Timed out waiting for agent")
            .expect("Failed to read from agent");
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).expect("Failed to parse server message"))
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer
            .write_all(line.as_bytes())
            .await
            .expect("Failed to write request");
        self.writer.write_all(b"\n").await.expect("Failed to write");
        self.writer.flush().await.expect("Failed to flush");
    }

    async fn read_response(&mut self) -> RpcResponse {
        loop {
            match self.read_message().await {
                Some(ServerMessage::Response(response)) => return response,
                Some(ServerMessage::Event(event)) => self.events.push_back(event),
                None => panic!("Agent closed the connection"),
            }
        }
    }

    async fn send_request(&mut self, request: RpcRequest) -> RpcResponse {
        let json = serde_json::to_string(&request).expect("Failed to serialize request");
        self.send_raw(&json).await;
        self.read_response().await
    }

    async fn next_event(&mut self) -> RpcEvent {
        if let Some(event) = self.events.pop_front() {
            return event;
        }
        loop {
            match self.read_message().await {
                Some(ServerMessage::Event(event)) => return event,
                Some(ServerMessage::Response(r)) => panic!("Unexpected response {:?}", r),
                None => panic!("Agent closed the connection"),
            }
        }
    }

    /// Upload `data` with the given chunk order
    async fn upload(
        &mut self,
        key: &EncryptionKey,
        data: &[u8],
        chunk_size: usize,
        order: &[usize],
        checksum: String,
    ) -> RpcResponse {
        let response = self
            .send_request(RpcRequest::StartUpload(UploadMetadata {
                file_name: "bundle.zip".to_string(),
                file_size: data.len() as u64,
                chunk_size: chunk_size as u64,
                expected_checksum: checksum,
            }))
            .await;
        assert!(
            matches!(response, RpcResponse::UploadStarted(_)),
            "StartUpload failed: {:?}",
            response
        );

        for &index in order {
            let start = index * chunk_size;
            let end = (start + chunk_size).min(data.len());
            let response = self
                .send_request(RpcRequest::UploadChunk {
                    data: seal(key, &data[start..end]).unwrap(),
                    chunk_index: index as i64,
                })
                .await;
            assert!(
                matches!(response, RpcResponse::ChunkAccepted(_)),
                "UploadChunk {} failed: {:?}",
                index,
                response
            );
        }

        self.send_request(RpcRequest::EndUpload).await
    }
}

/// Zip bundle with one package laid out for ubuntu_amd64
fn bundle() -> Vec<u8> {
    let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let root = sha256_hex(PACKAGE_ID);
    let options = zip::write::FileOptions::default();
    zip.start_file(format!("{}/1.0/ubuntu_amd64/install.sh", root), options)
        .unwrap();
    zip.write_all(b"#!/bin/sh\necho installing\n").unwrap();
    zip.start_file(format!("{}/1.0/win32_amd64/install.ps1", root), options)
        .unwrap();
    zip.write_all(b"Write-Output 'installing'\r\n").unwrap();
    zip.finish().unwrap().into_inner()
}

#[tokio::test]
async fn test_key_delivered_and_ping() {
    let agent = TestAgent::start().await;
    let (mut client, _key) = TestClient::admitted(&agent.address).await;

    let response = client.send_request(RpcRequest::Ping).await;
    assert!(matches!(response, RpcResponse::Pong));
    assert_eq!(agent.state.connections.active_count(), 1);
    assert_eq!(agent.state.keys.len(), 1);

    agent.stop().await;
}

#[tokio::test]
async fn test_second_connection_rejected_until_first_leaves() {
    let agent = TestAgent::start().await;
    let (first, _key) = TestClient::admitted(&agent.address).await;

    let mut second = TestClient::connect(&agent.address).await;
    match second.read_message().await {
        Some(ServerMessage::Event(RpcEvent::Rejected { reason })) => {
            assert!(reason.contains("Maximum"));
        }
        other => panic!("Expected rejection, got {:?}", other),
    }
    assert!(second.read_message().await.is_none());

    drop(first);

    // The slot frees once the agent notices the close
    let mut admitted = false;
    for _ in 0..50 {
        let mut client = TestClient::connect(&agent.address).await;
        if let Some(ServerMessage::Event(RpcEvent::SetEncryptionKey { .. })) =
            client.read_message().await
        {
            admitted = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(admitted);

    agent.stop().await;
}

#[tokio::test]
async fn test_invalid_request_keeps_connection_open() {
    let agent = TestAgent::start().await;
    let (mut client, _key) = TestClient::admitted(&agent.address).await;

    client.send_raw("{not json").await;
    match client.read_response().await {
        RpcResponse::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::ValidationError);
            assert!(message.starts_with("Invalid request"));
        }
        other => panic!("Expected error, got {:?}", other),
    }

    let response = client.send_request(RpcRequest::Ping).await;
    assert!(matches!(response, RpcResponse::Pong));

    agent.stop().await;
}

#[tokio::test]
async fn test_chunk_at_configured_maximum_fits_one_line() {
    let chunk_size = 2 * 1024 * 1024;
    let agent = TestAgent::start_with(|config| config.upload.max_chunk_size = chunk_size).await;
    let (mut client, key) = TestClient::admitted(&agent.address).await;

    let data: Vec<u8> = (0..chunk_size as usize).map(|i| (i % 251) as u8).collect();
    let checksum = sha256_bytes_hex(&data);
    match client
        .upload(&key, &data, chunk_size as usize, &[0], checksum.clone())
        .await
    {
        RpcResponse::UploadCompleted(result) => {
            assert_eq!(result.file_size, chunk_size);
            assert_eq!(result.checksum, checksum);
        }
        other => panic!("Unexpected response: {:?}", other),
    }

    agent.stop().await;
}

#[tokio::test]
async fn test_upload_rejects_bad_checksum() {
    let agent = TestAgent::start().await;
    let (mut client, key) = TestClient::admitted(&agent.address).await;

    let data = bundle();
    let order: Vec<usize> = (0..data.len().div_ceil(128)).collect();
    let response = client
        .upload(&key, &data, 128, &order, "00".repeat(32))
        .await;
    match response {
        RpcResponse::Error { kind, .. } => assert_eq!(kind, ErrorKind::ChecksumMismatch),
        other => panic!("Expected checksum mismatch, got {:?}", other),
    }

    match client.send_request(RpcRequest::GetUploadStatus).await {
        RpcResponse::UploadStatus(snapshot) => assert_eq!(snapshot.state, UploadState::Failed),
        other => panic!("Expected upload status, got {:?}", other),
    }

    agent.stop().await;
}

#[tokio::test]
async fn test_incomplete_upload_lists_missing_chunks() {
    let agent = TestAgent::start().await;
    let (mut client, key) = TestClient::admitted(&agent.address).await;

    let data = vec![42u8; 300];
    let response = client
        .upload(&key, &data, 100, &[0, 2], sha256_bytes_hex(&data))
        .await;
    match response {
        RpcResponse::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::IncompleteUpload);
            assert!(message.ends_with("Missing chunks: 1"));
        }
        other => panic!("Expected incomplete upload, got {:?}", other),
    }

    agent.stop().await;
}

#[tokio::test]
async fn test_upload_then_install_end_to_end() {
    let agent = TestAgent::start().await;
    let (mut client, key) = TestClient::admitted(&agent.address).await;

    let data = bundle();
    let chunk_size = data.len().div_ceil(3);
    let response = client
        .upload(&key, &data, chunk_size, &[2, 0, 1], sha256_bytes_hex(&data))
        .await;
    match response {
        RpcResponse::UploadCompleted(result) => {
            assert_eq!(result.file_size, data.len() as u64);
            assert!(result.extraction.success, "{:?}", result.extraction.error);
            assert_eq!(result.extraction.file_count, 2);
            assert_eq!(std::fs::read(&result.file_path).unwrap(), data);
        }
        other => panic!("Expected completed upload, got {:?}", other),
    }

    let response = client
        .send_request(RpcRequest::Install {
            items: vec![
                InstallRequestItem {
                    id: PACKAGE_ID.to_string(),
                    version: "1.0".to_string(),
                },
                InstallRequestItem {
                    id: "com.example.absent".to_string(),
                    version: "1.0".to_string(),
                },
            ],
        })
        .await;
    match response {
        RpcResponse::InstallStarted(result) => assert_eq!(result.queued, 1),
        other => panic!("Expected install start, got {:?}", other),
    }

    match client.next_event().await {
        RpcEvent::ReceiveInstallationStatus(progress) => {
            assert_eq!(progress.id, PACKAGE_ID);
            assert_eq!(progress.progress, 100);
            assert_eq!(progress.status, ItemStatus::Completed);
            assert!(!progress.has_error);
        }
        other => panic!("Expected progress, got {:?}", other),
    }

    let mut completed = false;
    for _ in 0..50 {
        if let RpcResponse::SessionStatus(report) =
            client.send_request(RpcRequest::GetSessionStatus).await
        {
            if report.status == SessionStatus::Completed {
                assert_eq!(report.total, 1);
                assert_eq!(report.completed, 1);
                completed = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(completed);
    assert_eq!(agent.runner.runs.load(Ordering::SeqCst), 1);

    match client
        .send_request(RpcRequest::ControlInstall {
            action: "Stop".to_string(),
        })
        .await
    {
        RpcResponse::ControlInstall(result) => {
            assert_eq!(result.current_item, "None");
            assert_eq!(result.completed, 1);
            assert_eq!(result.items[0].status, ItemStatus::Completed);
        }
        other => panic!("Expected control result, got {:?}", other),
    }

    agent.stop().await;
}

#[tokio::test]
async fn test_disconnect_cleans_up_connection_state() {
    let agent = TestAgent::start().await;
    let (mut client, key) = TestClient::admitted(&agent.address).await;

    let data = vec![1u8; 250];
    let response = client
        .send_request(RpcRequest::StartUpload(UploadMetadata {
            file_name: "bundle.zip".to_string(),
            file_size: data.len() as u64,
            chunk_size: 100,
            expected_checksum: sha256_bytes_hex(&data),
        }))
        .await;
    assert!(matches!(response, RpcResponse::UploadStarted(_)));
    let response = client
        .send_request(RpcRequest::UploadChunk {
            data: seal(&key, &data[..100]).unwrap(),
            chunk_index: 0,
        })
        .await;
    assert!(matches!(response, RpcResponse::ChunkAccepted(_)));
    assert_eq!(agent.state.uploads.len(), 1);

    drop(client);

    for _ in 0..50 {
        if agent.state.connections.is_empty() && agent.state.uploads.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(agent.state.connections.is_empty());
    assert!(agent.state.uploads.is_empty());
    assert!(agent.state.keys.is_empty());

    agent.stop().await;
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() {
                count_files(&path)
            } else {
                1
            }
        })
        .sum()
}

#[tokio::test]
async fn test_shutdown_waits_for_connection_cleanup() {
    let agent = TestAgent::start().await;
    let (mut client, key) = TestClient::admitted(&agent.address).await;

    let data = vec![3u8; 250];
    let response = client
        .send_request(RpcRequest::StartUpload(UploadMetadata {
            file_name: "bundle.zip".to_string(),
            file_size: data.len() as u64,
            chunk_size: 100,
            expected_checksum: sha256_bytes_hex(&data),
        }))
        .await;
    assert!(matches!(response, RpcResponse::UploadStarted(_)));
    let response = client
        .send_request(RpcRequest::UploadChunk {
            data: seal(&key, &data[..100]).unwrap(),
            chunk_index: 0,
        })
        .await;
    assert!(matches!(response, RpcResponse::ChunkAccepted(_)));

    let TestAgent {
        state,
        cancel,
        handle,
        _dir: dir,
        ..
    } = agent;
    assert_eq!(count_files(dir.path()), 1);

    // The client stays connected; shutdown alone must run the cleanup
    cancel.cancel();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("Server did not stop")
        .unwrap();

    assert!(state.connections.is_empty());
    assert!(state.uploads.is_empty());
    assert!(state.keys.is_empty());
    assert_eq!(count_files(dir.path()), 0);
    drop(client);
}
