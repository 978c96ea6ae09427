
use std::fs;
use std::path::Path;

use harness::{
    release, shared_directory, shared_gateway, timings, FakeDirectory, FakeGateway,
    BOOTSTRAP_TOKEN,
};
use tempfile::TempDir;

use consul_backup_daemon::backup::{BackupRequest, BackupWorkflow};
use consul_backup_daemon::release::BOOTSTRAP_TOKEN_KEY;
use consul_backup_daemon::restore::{RestoreRequest, RestoreWorkflow};
use consul_backup_daemon::{Phase, RecoveryError, RecoveryOutcome};
use consul_snapshot_format::{SnapshotFormatError, TokenSidecar, TOKEN_SIDECAR_FILE};

const RESTORED_TOKEN: &str = "9a8b7c6d-restored";

fn cluster() -> (FakeGateway, FakeDirectory) {
    let gateway = FakeGateway::new();
    gateway.set_catalog(&[("consul-server-0", "10.0.0.1")]);
    let directory = FakeDirectory::with_servers(&[("consul-server-0", Some("10.0.0.1"))]);
    (gateway, directory)
}

fn write_backup(root: &Path, datacenters: &[&str], token: Option<&str>) {
    for dc in datacenters {
        fs::create_dir_all(root.join(dc)).unwrap();
        fs::write(root.join(dc).join("snapshot.gz"), format!("snapshot-{dc}")).unwrap();
    }
    if let Some(token) = token {
        TokenSidecar::from_token(token)
            .write_to_file(root.join(TOKEN_SIDECAR_FILE))
            .unwrap();
    }
}

fn restore_workflow(
    gateway: &FakeGateway,
    directory: &FakeDirectory,
    acl_enabled: bool,
) -> RestoreWorkflow {
    RestoreWorkflow::new(
        shared_gateway(gateway),
        shared_directory(directory),
        release(),
        acl_enabled,
        timings(),
    )
}

fn restore_request(folder: &Path, skip_acl_recovery: bool) -> RestoreRequest {
    RestoreRequest {
        folder: folder.to_path_buf(),
        datacenters: Vec::new(),
        skip_acl_recovery,
    }
}

#[tokio::test]
async fn acl_cluster_with_backup_without_token_is_rejected_before_any_call() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], None);

    let failure = restore_workflow(&gateway, &directory, true)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap_err();

    assert_eq!(failure.phase(), Phase::ConsistencyCheck);
    assert!(failure.source.is_inconsistency());
    assert!(gateway.calls().is_empty());
    assert!(directory.calls().is_empty());
}

#[tokio::test]
async fn plain_cluster_with_acl_backup_is_rejected() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], Some(RESTORED_TOKEN));

    let failure = restore_workflow(&gateway, &directory, false)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap_err();

    assert_eq!(failure.phase(), Phase::ConsistencyCheck);
    assert!(gateway.calls().is_empty());
}

#[tokio::test]
async fn skip_flag_restores_snapshots_without_recovery() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], None);

    let summary = restore_workflow(&gateway, &directory, true)
        .run(&restore_request(folder.path(), true))
        .await
        .unwrap();

    assert_eq!(summary.datacenters, ["dc1"]);
    assert_eq!(summary.recovery, None);
    assert_eq!(gateway.calls(), ["restore_snapshot"]);
    assert_eq!(
        gateway.presented_tokens(),
        [Some(BOOTSTRAP_TOKEN.to_string())]
    );
    assert!(directory.patches().is_empty());
}

#[tokio::test]
async fn restores_every_datacenter_in_name_order() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc2", "dc1"], None);

    let summary = restore_workflow(&gateway, &directory, false)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap();

    assert_eq!(summary.datacenters, ["dc1", "dc2"]);
    let restored = gateway.restored();
    assert_eq!(restored[0].0, "dc1");
    assert_eq!(&restored[0].1[..], b"snapshot-dc1");
    assert_eq!(restored[1].0, "dc2");
    assert!(gateway.presented_tokens().iter().all(Option::is_none));
}

#[tokio::test]
async fn explicit_datacenters_limit_the_restore() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1", "dc2"], None);

    let request = RestoreRequest {
        datacenters: vec!["dc2".to_string()],
        ..restore_request(folder.path(), false)
    };
    let summary = restore_workflow(&gateway, &directory, false)
        .run(&request)
        .await
        .unwrap();

    assert_eq!(summary.datacenters, ["dc2"]);
    assert_eq!(gateway.restored().len(), 1);
}

#[tokio::test]
async fn rejected_snapshot_fails_restore_phase() {
    let (gateway, directory) = cluster();
    gateway.fail_restore();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], Some(RESTORED_TOKEN));

    let failure = restore_workflow(&gateway, &directory, true)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap_err();

    assert_eq!(failure.phase(), Phase::SnapshotRestore);
    assert!(matches!(failure.source, RecoveryError::Gateway(_)));
    assert!(directory.patches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn changed_bootstrap_token_patches_secret_and_recovers() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], Some(RESTORED_TOKEN));

    let summary = restore_workflow(&gateway, &directory, true)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap();

    assert!(matches!(
        summary.recovery,
        Some(RecoveryOutcome::Completed(_))
    ));

    let secret = directory.secret(&release().bootstrap_secret()).unwrap();
    assert_eq!(secret.get(BOOTSTRAP_TOKEN_KEY), Some(RESTORED_TOKEN.as_bytes()));

    // The snapshot goes in with the live token, recovery uses the restored one.
    let tokens = gateway.presented_tokens();
    assert_eq!(tokens[0].as_deref(), Some(BOOTSTRAP_TOKEN));
    assert!(tokens[1..]
        .iter()
        .all(|t| t.as_deref() == Some(RESTORED_TOKEN)));
    assert!(directory
        .execs()
        .iter()
        .all(|(_, _, command)| command.contains(RESTORED_TOKEN)));
}

#[tokio::test(start_paused = true)]
async fn unchanged_bootstrap_token_skips_recovery() {
    let (gateway, directory) = cluster();
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], Some(BOOTSTRAP_TOKEN));

    let summary = restore_workflow(&gateway, &directory, true)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap();

    assert_eq!(summary.recovery, Some(RecoveryOutcome::Skipped));
    assert_eq!(gateway.calls(), ["restore_snapshot"]);
    assert!(directory.patches().is_empty());
    assert!(directory.deleted().is_empty());
}

#[tokio::test]
async fn missing_bootstrap_secret_is_inconsistency() {
    let (gateway, directory) = cluster();
    directory.remove_secret(&release().bootstrap_secret());
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], Some(RESTORED_TOKEN));

    let failure = restore_workflow(&gateway, &directory, true)
        .run(&restore_request(folder.path(), false))
        .await
        .unwrap_err();

    assert_eq!(failure.phase(), Phase::BootstrapToken);
    assert!(failure.source.is_inconsistency());
    assert!(gateway.calls().is_empty());
}

// backup

fn backup_workflow(
    gateway: &FakeGateway,
    directory: &FakeDirectory,
    acl_enabled: bool,
) -> BackupWorkflow {
    BackupWorkflow::new(
        shared_gateway(gateway),
        shared_directory(directory),
        release(),
        acl_enabled,
    )
}

#[tokio::test]
async fn backup_captures_every_datacenter_and_token() {
    let (gateway, directory) = cluster();
    gateway.set_datacenters(&["dc1", "dc2"]);
    gateway.set_snapshot("dc1", b"raft-dc1");
    gateway.set_snapshot("dc2", b"raft-dc2");
    let folder = TempDir::new().unwrap();

    let summary = backup_workflow(&gateway, &directory, true)
        .run(&BackupRequest {
            folder: folder.path().to_path_buf(),
            datacenters: Vec::new(),
        })
        .await
        .unwrap();

    assert_eq!(summary.datacenters, ["dc1", "dc2"]);
    assert!(summary.token_captured);
    assert_eq!(
        fs::read(folder.path().join("dc2").join("snapshot.gz")).unwrap(),
        b"raft-dc2"
    );
    let sidecar = fs::read_to_string(folder.path().join(TOKEN_SIDECAR_FILE)).unwrap();
    assert_eq!(sidecar, "NmYxYzJhNWUtYm9vdHN0cmFw");
    assert!(gateway
        .presented_tokens()
        .iter()
        .all(|t| t.as_deref() == Some(BOOTSTRAP_TOKEN)));
}

#[tokio::test]
async fn backup_without_acl_writes_no_token() {
    let (gateway, directory) = cluster();
    gateway.set_snapshot("dc1", b"raft-dc1");
    let folder = TempDir::new().unwrap();

    let summary = backup_workflow(&gateway, &directory, false)
        .run(&BackupRequest {
            folder: folder.path().to_path_buf(),
            datacenters: vec!["dc1".to_string()],
        })
        .await
        .unwrap();

    assert!(!summary.token_captured);
    assert!(!folder.path().join(TOKEN_SIDECAR_FILE).exists());
    assert_eq!(gateway.calls(), ["save_snapshot"]);
}

#[tokio::test]
async fn backup_never_overwrites_existing_snapshot() {
    let (gateway, directory) = cluster();
    gateway.set_snapshot("dc1", b"raft-dc1");
    let folder = TempDir::new().unwrap();
    write_backup(folder.path(), &["dc1"], None);

    let failure = backup_workflow(&gateway, &directory, false)
        .run(&BackupRequest {
            folder: folder.path().to_path_buf(),
            datacenters: vec!["dc1".to_string()],
        })
        .await
        .unwrap_err();

    assert_eq!(failure.phase(), Phase::Backup);
    assert!(matches!(
        failure.source,
        RecoveryError::Snapshot(SnapshotFormatError::AlreadyExists(_))
    ));
    assert_eq!(
        fs::read(folder.path().join("dc1").join("snapshot.gz")).unwrap(),
        b"snapshot-dc1"
    );
}
