//! End-to-end update scenarios driven through the update manager.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use baton_core::checksum::sha256_file;
use baton_core::{
    ApplyOptions, ApplyOutcome, ExecutionStatus, IpcError, MemorySource, ProcessState,
    UpdateConfig, UpdateError, UpdateManager,
};
use tempfile::TempDir;

struct Fixture {
    root: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("app")).unwrap();
        Self { root }
    }

    fn app_dir(&self) -> PathBuf {
        self.root.path().join("app")
    }

    fn app_file(&self, rel: &str) -> PathBuf {
        self.app_dir().join(rel)
    }

    fn config(&self) -> UpdateConfig {
        UpdateConfig {
            temp_folder: self.root.path().join("temp"),
            update_process_name: format!("scenario-{}", uuid::Uuid::new_v4()),
            ..UpdateConfig::default()
        }
    }

    fn manager(&self, source: MemorySource) -> UpdateManager {
        self.manager_with(self.config(), source)
    }

    fn manager_with(&self, config: UpdateConfig, source: MemorySource) -> UpdateManager {
        UpdateManager::for_application(config, Arc::new(source), self.app_file("app")).unwrap()
    }
}

fn feed(tasks: &str) -> String {
    format!(r#"<?xml version="1.0" encoding="utf-8"?><Feed version="1.0"><Tasks>{}</Tasks></Feed>"#, tasks)
}

fn backup_files(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn scenario_a_new_file_cold_run() {
    let fx = Fixture::new();
    let source = MemorySource::new(feed(r#"<FileUpdateTask localPath="bin/tool"/>"#))
        .with_file("bin/tool", b"tool v2".to_vec());
    let mut manager = fx.manager(source);

    assert_eq!(manager.check_for_updates().await.unwrap(), 1);
    manager.prepare_updates().await.unwrap();
    let outcome = manager
        .apply_updates(ApplyOptions {
            cold_run: true,
            ..ApplyOptions::default()
        })
        .await
        .unwrap();

    assert!(matches!(outcome, ApplyOutcome::Applied));
    assert_eq!(manager.state(), ProcessState::AppliedSuccessfully);
    assert_eq!(manager.steps()[0].status, ExecutionStatus::Successful);
    assert_eq!(fs::read(fx.app_file("bin/tool")).unwrap(), b"tool v2");
    assert_eq!(backup_files(manager.backup_folder()), 0);
}

#[tokio::test]
async fn scenario_b_matching_checksum_drops_step() {
    let fx = Fixture::new();
    fs::write(fx.app_file("data.bin"), b"current").unwrap();
    let current = sha256_file(&fx.app_file("data.bin")).unwrap();

    let tasks = format!(
        r#"<FileUpdateTask localPath="data.bin">
             <Conditions>
               <FileChecksumCondition type="not" checksum="{}" checksumType="sha256"/>
             </Conditions>
           </FileUpdateTask>
           <FileUpdateTask localPath="other.bin"/>"#,
        current.to_uppercase()
    );
    let mut manager = fx.manager(MemorySource::new(feed(&tasks)));

    assert_eq!(manager.check_for_updates().await.unwrap(), 1);
    assert_eq!(manager.steps()[0].target_path(), Some("other.bin"));
}

#[cfg(unix)]
#[tokio::test]
async fn scenario_c_cold_run_keeps_os_error() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    // A read-only directory sits where the file should go; deleting it fails
    let target = fx.app_file("locked");
    fs::create_dir_all(&target).unwrap();
    fs::set_permissions(&target, fs::Permissions::from_mode(0o555)).unwrap();

    let source = MemorySource::new(feed(r#"<FileUpdateTask localPath="locked"/>"#))
        .with_file("locked", b"new".to_vec());
    let mut manager = fx.manager(source);
    manager.check_for_updates().await.unwrap();
    manager.prepare_updates().await.unwrap();

    let err = manager
        .apply_updates(ApplyOptions {
            cold_run: true,
            ..ApplyOptions::default()
        })
        .await
        .unwrap_err();

    match err {
        UpdateError::Execute { source, .. } => assert!(source.raw_os_error().is_some()),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(manager.steps()[0].status, ExecutionStatus::Failed);
    assert_eq!(manager.state(), ProcessState::RollbackRequired);

    fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).unwrap();
}

#[tokio::test]
async fn scenario_d_live_run_defers_to_restart() {
    let fx = Fixture::new();
    fs::write(fx.app_file("app.bin"), b"old").unwrap();

    let source = MemorySource::new(feed(r#"<FileUpdateTask localPath="app.bin" hotswap="false"/>"#))
        .with_file("app.bin", b"new".to_vec());
    let mut config = fx.config();
    // No updater host is available, so the handoff stops at staging
    config.updater_path = Some(fx.root.path().join("no-such-updater"));
    let mut manager = fx.manager_with(config, source);
    manager.check_for_updates().await.unwrap();
    manager.prepare_updates().await.unwrap();

    let err = manager.apply_updates(ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Io(_)));

    let step = &manager.steps()[0];
    assert_eq!(step.status, ExecutionStatus::RequiresAppRestart);
    assert_eq!(fs::read(fx.app_file("app.bin")).unwrap(), b"old");
}

#[cfg(unix)]
#[tokio::test]
async fn scenario_e_handoff_timeout_keeps_session() {
    use std::os::unix::fs::PermissionsExt;

    let fx = Fixture::new();
    fs::write(fx.app_file("app.bin"), b"old").unwrap();

    // Stands in for an updater host that never opens the pipe
    let host = fx.root.path().join("silent-host");
    fs::write(&host, "#!/bin/sh\nsleep 5\n").unwrap();
    fs::set_permissions(&host, fs::Permissions::from_mode(0o755)).unwrap();

    let mut config = fx.config();
    config.updater_path = Some(host);
    config.pipe_connect_timeout = "300ms".to_string();

    let source = MemorySource::new(feed(r#"<FileUpdateTask localPath="app.bin"/>"#))
        .with_file("app.bin", b"new".to_vec());
    let mut manager = fx.manager_with(config, source);
    manager.check_for_updates().await.unwrap();
    manager.prepare_updates().await.unwrap();

    let err = manager.apply_updates(ApplyOptions::default()).await.unwrap_err();
    assert!(matches!(err, UpdateError::Ipc(IpcError::ConnectTimeout { .. })));

    assert_eq!(manager.state(), ProcessState::RollbackRequired);
    assert_eq!(manager.steps().len(), 1);
    assert_eq!(manager.steps()[0].status, ExecutionStatus::RequiresAppRestart);

    // The session is still ours: rolling back works and leaves the old file
    manager.rollback_updates().unwrap();
    assert_eq!(fs::read(fx.app_file("app.bin")).unwrap(), b"old");
    assert_eq!(manager.state(), ProcessState::NotChecked);
}

#[tokio::test]
async fn failed_step_stops_apply_and_rollback_stays_at_or_before_it() {
    let fx = Fixture::new();
    fs::write(fx.app_file("a.txt"), b"a old").unwrap();
    // A directory where b.txt should be makes the cold replace fail
    fs::create_dir_all(fx.app_file("b.txt/inner")).unwrap();

    let source = MemorySource::new(feed(
        r#"<FileUpdateTask localPath="a.txt"/>
           <FileUpdateTask localPath="b.txt"/>
           <FileUpdateTask localPath="c.txt"/>"#,
    ))
    .with_file("a.txt", b"a new".to_vec())
    .with_file("b.txt", b"b new".to_vec())
    .with_file("c.txt", b"c new".to_vec());
    let mut manager = fx.manager(source);
    manager.check_for_updates().await.unwrap();
    manager.prepare_updates().await.unwrap();

    let result = manager
        .apply_updates(ApplyOptions {
            cold_run: true,
            ..ApplyOptions::default()
        })
        .await;
    assert!(matches!(result, Err(UpdateError::Execute { .. })));

    let statuses: Vec<_> = manager.steps().iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            ExecutionStatus::Successful,
            ExecutionStatus::Failed,
            ExecutionStatus::Prepared
        ]
    );
    assert_eq!(fs::read(fx.app_file("a.txt")).unwrap(), b"a new");
    assert!(!fx.app_file("c.txt").exists());

    manager.rollback_updates().unwrap();
    assert_eq!(fs::read(fx.app_file("a.txt")).unwrap(), b"a old");

    let rolled_back: Vec<_> = manager
        .log()
        .items()
        .into_iter()
        .filter(|item| item.message.starts_with("Rolled back"))
        .map(|item| item.message)
        .collect();
    assert_eq!(
        rolled_back,
        vec!["Rolled back 'Update b.txt'", "Rolled back 'Update a.txt'"]
    );
}

#[tokio::test]
async fn prepare_failure_aborts_phase() {
    let fx = Fixture::new();
    let source = MemorySource::new(feed(
        r#"<FileUpdateTask localPath="a.txt"/><FileUpdateTask localPath="missing.txt"/>"#,
    ))
    .with_file("a.txt", b"a".to_vec());
    let mut manager = fx.manager(source);
    manager.check_for_updates().await.unwrap();

    let err = manager.prepare_updates().await.unwrap_err();
    assert!(matches!(err, UpdateError::Prepare { .. }));
    assert_eq!(manager.state(), ProcessState::Checked);
    assert_eq!(manager.steps()[1].status, ExecutionStatus::FailedToPrepare);
}

#[tokio::test]
async fn progress_reaches_every_task() {
    use std::sync::Mutex;

    let fx = Fixture::new();
    let source = MemorySource::new(feed(
        r#"<FileUpdateTask localPath="one"/><FileUpdateTask localPath="two"/>"#,
    ))
    .with_file("one", vec![1u8; 16])
    .with_file("two", vec![2u8; 16]);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut manager = fx
        .manager(source)
        .with_progress(Arc::new(move |p| sink.lock().unwrap().push((p.task_id, p.percentage))));

    manager.check_for_updates().await.unwrap();
    manager.prepare_updates().await.unwrap();

    let seen = seen.lock().unwrap().clone();
    assert!(seen.contains(&(1, 50)));
    assert!(seen.contains(&(2, 100)));
}

#[tokio::test]
async fn reinstate_without_pending_session() {
    let fx = Fixture::new();
    let mut config = fx.config();
    config.pipe_connect_timeout = "100ms".to_string();
    let mut manager = fx.manager_with(config, MemorySource::new(feed("")));

    assert!(!manager.reinstate_if_restarted().await.unwrap());
    assert_eq!(manager.state(), ProcessState::NotChecked);
}
