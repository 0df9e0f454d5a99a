//! Client against a live agent

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use bs_agent::extract::ArchiveExtractor;
use bs_agent::install::ScriptRunner;
use bs_agent::server::AgentServer;
use bs_agent::AgentState;
use bs_cli::client::AgentClient;
use bs_cli::commands::{install_command, upload_bundle};
use bs_core::config::{AgentConfig, Platform};
use bs_core::error::InstallError;
use bs_core::hash::sha256_hex;
use bs_core::{ItemStatus, SessionStatus};

/// Fails any package whose id hash folder contains "fail.sh"
struct FolderRunner;

#[async_trait]
impl ScriptRunner for FolderRunner {
    async fn run(&self, folder: &Path, _platform: Platform) -> Result<(), InstallError> {
        if folder.join("fail.sh").is_file() {
            return Err(InstallError::ScriptExecutionFailed {
                script: "install".into(),
                code: Some(1),
            });
        }
        Ok(())
    }
}

async fn start_agent(work_dir: &Path) -> (String, CancellationToken) {
    let mut config = AgentConfig {
        work_dir: work_dir.to_path_buf(),
        ..Default::default()
    };
    config.install.platform = Some(Platform::UbuntuAmd64);
    let state = Arc::new(AgentState::with_collaborators(
        config,
        Arc::new(ArchiveExtractor::new()),
        Arc::new(FolderRunner),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let cancel = CancellationToken::new();
    let server = AgentServer::new(address.clone(), state).with_shutdown_token(cancel.clone());
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    (address, cancel)
}

fn write_bundle(path: &Path, packages: &[(&str, &str)]) {
    let file = std::fs::File::create(path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    for (id, script) in packages {
        let name = format!("{}/1.0/ubuntu_amd64/{}", sha256_hex(id), script);
        zip.start_file(name, zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(b"true\n").unwrap();
    }
    zip.finish().unwrap();
}

#[tokio::test]
async fn test_upload_bundle_in_small_chunks() {
    let work = tempfile::tempdir().unwrap();
    let (address, cancel) = start_agent(work.path()).await;

    let files = tempfile::tempdir().unwrap();
    let bundle = files.path().join("release.zip");
    write_bundle(&bundle, &[("com.example.a", "install.sh")]);

    let mut client = AgentClient::connect(&address).await.unwrap();
    let result = upload_bundle(&mut client, &bundle, 64).await.unwrap();
    assert_eq!(result.file_size, std::fs::metadata(&bundle).unwrap().len());
    assert!(result.extraction.success);
    assert_eq!(result.extraction.file_count, 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_install_waits_for_all_items() {
    let work = tempfile::tempdir().unwrap();
    let (address, cancel) = start_agent(work.path()).await;

    let files = tempfile::tempdir().unwrap();
    let bundle = files.path().join("release.zip");
    write_bundle(
        &bundle,
        &[("com.example.a", "fail.sh"), ("com.example.b", "install.sh")],
    );

    let mut client = AgentClient::connect(&address).await.unwrap();
    let packages = vec![
        "com.example.a@1.0".to_string(),
        "com.example.b@1.0".to_string(),
    ];
    let err = install_command(&mut client, Some(&bundle), 1024, &packages, true)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("1 item(s) failed"));

    let report = client.session_status().await.unwrap().unwrap();
    assert_eq!(report.total, 2);
    assert_eq!(report.items[0].status, ItemStatus::Failed);
    assert_eq!(report.items[1].status, ItemStatus::Completed);
    assert!(matches!(
        report.status,
        SessionStatus::Completed | SessionStatus::Running
    ));

    cancel.cancel();
}

#[tokio::test]
async fn test_second_client_is_rejected() {
    let work = tempfile::tempdir().unwrap();
    let (address, cancel) = start_agent(work.path()).await;

    let mut first = AgentClient::connect(&address).await.unwrap();
    assert!(first.ping().await.unwrap());

    let err = AgentClient::connect(&address).await.err().unwrap();
    assert!(err.to_string().contains("rejected"));

    cancel.cancel();
}
