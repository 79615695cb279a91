//! Sequencer tests against fake service, repository and installer

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use redeploy::deploy::backup::Backup;
use redeploy::deploy::fsm::SequencerState;
use redeploy::deploy::report::{SequencerError, UpdateOutcome};
use redeploy::filesys::dir::Dir;
use redeploy::filesys::lock::DeploymentLock;

use crate::harness::{Harness, Script, ENV_CONTENTS, LOCAL_REV, REMOTE_REV};

fn changed() -> Script {
    Script {
        remote_changed: true,
        ..Default::default()
    }
}

async fn only_backup(harness: &Harness) -> Backup {
    let mut dirs: Vec<PathBuf> = fs::read_dir(harness.backup_dir())
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(dirs.len(), 1, "{:?}", dirs);
    Backup::open(&dirs.remove(0)).await.unwrap()
}

async fn digest(path: impl Into<PathBuf>) -> String {
    Dir::new(path).tree_digest().await.unwrap()
}

#[tokio::test]
async fn test_update_applies_new_revision() {
    let harness = Harness::new(changed());
    let report = assert_ok!(harness.sequencer().update().await);

    assert_eq!(
        report.outcome,
        UpdateOutcome::Updated {
            from: LOCAL_REV.to_string(),
            to: REMOTE_REV.to_string()
        }
    );
    assert_eq!(harness.read_code("main.py"), "v2\n");
    assert_eq!(
        fs::read_to_string(harness.venv_dir().join("installed_from")).unwrap(),
        "v2\n"
    );
    assert!(report.healed.is_empty());
    assert_eq!(report.history.last(), Some(&SequencerState::Verified));

    assert!(harness.position("stop") < harness.position("fetch"));
    assert!(harness.position("fetch") < harness.position("apply"));
    assert!(harness.position("apply") < harness.position("install"));
    assert!(harness.position("install") < harness.position("start"));
    assert!(harness.position("start") < harness.position("is_active"));

    let backup = only_backup(&harness).await;
    assert_eq!(backup.path(), report.backup);
    assert_eq!(backup.manifest().revision.as_deref(), Some(LOCAL_REV));
    assert_eq!(
        fs::read_to_string(backup.code_dir().path().join("main.py")).unwrap(),
        "v1\n"
    );
}

#[tokio::test]
async fn test_backup_exists_before_stop() {
    let harness = Harness::new(changed());
    assert_ok!(harness.sequencer().update().await);

    assert_eq!(*harness.service.backups_at_stop.lock().unwrap(), Some(1));
}

#[tokio::test]
async fn test_up_to_date_restarts_unchanged() {
    let harness = Harness::new(Script::default());
    let before = digest(harness.code_dir()).await;

    let report = assert_ok!(harness.sequencer().update().await);

    assert_eq!(
        report.outcome,
        UpdateOutcome::UpToDate {
            revision: LOCAL_REV.to_string()
        }
    );
    assert!(!harness.called("apply"));
    assert!(!harness.called("install"));
    assert!(harness.called("start"));
    assert!(!report.history.contains(&SequencerState::Applying));
    assert!(!report.history.contains(&SequencerState::Installing));
    assert!(!report.history.contains(&SequencerState::RollingBack));
    assert_eq!(digest(harness.code_dir()).await, before);
}

#[tokio::test]
async fn test_apply_failure_restores_backup() {
    let harness = Harness::new(Script {
        remote_changed: true,
        apply_fails: true,
        ..Default::default()
    });

    let err = assert_err!(harness.sequencer().update().await);
    let SequencerError::ApplyFailed { rollback, backup, .. } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(rollback.is_clean(), "{:?}", rollback);
    assert_eq!(rollback.digest_matches, Some(true));

    // Byte-identical to the backup, broken tree parked for inspection
    let snapshot = only_backup(&harness).await;
    assert_eq!(snapshot.path(), backup);
    assert_eq!(
        digest(harness.code_dir()).await,
        digest(snapshot.code_dir().path()).await
    );
    assert!(!harness.code_dir().join("junk.py").exists());
    let parked = rollback.parked.as_ref().unwrap();
    assert!(parked.starts_with(harness.root()));
    assert!(parked.join("junk.py").exists());

    // Service brought back, nothing installed
    assert!(harness.position("apply") < harness.position("start"));
    assert!(harness.called("is_active"));
    assert!(!harness.called("install"));
    assert_eq!(err.backup_path(), Some(backup.as_path()));
}

#[tokio::test]
async fn test_install_failure_rolls_back_and_reinstalls() {
    let harness = Harness::new(Script {
        remote_changed: true,
        install_failures: 1,
        ..Default::default()
    });

    let err = assert_err!(harness.sequencer().update().await);
    let SequencerError::InstallFailed { rollback, .. } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(rollback.is_clean(), "{:?}", rollback);

    assert_eq!(harness.read_code("main.py"), "v1\n");
    assert_eq!(harness.read_code(".env"), ENV_CONTENTS);

    // The venv was rebuilt from the restored code
    assert_eq!(
        fs::read_to_string(harness.venv_dir().join("installed_from")).unwrap(),
        "v1\n"
    );
    let installs = harness.calls().iter().filter(|c| *c == "install").count();
    assert_eq!(installs, 2);
}

#[tokio::test]
async fn test_failed_rollback_copy_keeps_the_old_tree_in_place() {
    let harness = Harness::new(Script {
        remote_changed: true,
        install_failures: 1,
        install_loses_backup: true,
        ..Default::default()
    });

    let err = assert_err!(harness.sequencer().update().await);
    let SequencerError::InstallFailed { rollback, .. } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(!rollback.restored);
    assert!(rollback.parked.is_none(), "{:?}", rollback);

    // The service restarts over the full applied tree, not just the secrets
    assert_eq!(harness.read_code("main.py"), "v2\n");
    assert_eq!(harness.read_code("requirements.txt"), "aiogram==3.4\n");
    assert_eq!(harness.read_code(".env"), ENV_CONTENTS);
    assert!(harness.code_dir().join(".git").join("HEAD").exists());
    assert!(harness.position("stop") < harness.position("start"));

    let parked: Vec<_> = fs::read_dir(harness.root())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".failed-"))
        .collect();
    assert!(parked.is_empty());
}

#[tokio::test]
async fn test_missing_venv_is_not_installed_without_mutation() {
    let harness = Harness::new(changed());
    fs::remove_dir_all(harness.venv_dir()).unwrap();
    let before = digest(harness.tmp.path()).await;

    let err = assert_err!(harness.sequencer().update().await);

    assert!(matches!(err, SequencerError::NotInstalled { .. }), "{:?}", err);
    assert!(err.is_untouched());
    assert!(err.backup_path().is_none());
    assert!(harness.calls().is_empty());
    assert!(!harness.backup_dir().exists());
    assert_eq!(digest(harness.tmp.path()).await, before);
}

#[tokio::test]
async fn test_missing_checkout_is_not_installed() {
    let harness = Harness::new(changed());
    fs::remove_dir_all(harness.code_dir().join(".git")).unwrap();

    let err = assert_err!(harness.sequencer().update().await);
    assert!(err.to_string().contains("git checkout"), "{}", err);
}

#[tokio::test]
async fn test_liveness_failure_is_reported_not_rolled_back() {
    let harness = Harness::new(Script {
        remote_changed: true,
        stays_down: true,
        ..Default::default()
    });

    let sequencer = harness.sequencer();
    let err = assert_err!(sequencer.update().await);

    let SequencerError::StartupFailed { cause, .. } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(cause.is_none());
    assert_eq!(harness.read_code("main.py"), "v2\n");
    assert_eq!(sequencer.state().await, SequencerState::Failed);
    assert!(!sequencer.history().await.contains(&SequencerState::RollingBack));

    let remediation = err.remediation(sequencer.layout(), "bot.service").join("\n");
    assert!(remediation.contains("journalctl -u bot.service"));
    assert!(remediation.contains(&harness.backup_dir().display().to_string()));
    assert!(remediation.contains("secrets/.env"));
    assert!(!remediation.contains("credentials.json"));
}

#[tokio::test]
async fn test_startup_failure_after_rollback_keeps_cause() {
    let harness = Harness::new(Script {
        remote_changed: true,
        apply_fails: true,
        stays_down: true,
        ..Default::default()
    });

    let err = assert_err!(harness.sequencer().update().await);
    let SequencerError::StartupFailed { cause, .. } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(cause.as_deref().unwrap_or_default().contains("merge conflict"));
    assert_eq!(harness.read_code("main.py"), "v1\n");
}

#[tokio::test]
async fn test_heal_restores_deleted_secret() {
    let harness = Harness::new(Script {
        remote_changed: true,
        apply_deletes_env: true,
        ..Default::default()
    });

    let report = assert_ok!(harness.sequencer().update().await);

    assert_eq!(report.healed, vec![PathBuf::from(".env")]);
    assert_eq!(harness.read_code(".env"), ENV_CONTENTS);
    assert_eq!(harness.read_code("main.py"), "v2\n");
}

#[tokio::test]
async fn test_secrets_survive_update() {
    let harness = Harness::new(changed());
    assert_ok!(harness.sequencer().update().await);

    assert_eq!(harness.read_code(".env"), ENV_CONTENTS);
    assert_eq!(
        fs::read(harness.code_dir().join("bot.db")).unwrap(),
        vec![0u8, 1, 2, 3]
    );
}

#[tokio::test]
async fn test_second_update_is_locked() {
    let harness = Harness::new(changed());
    let _held = DeploymentLock::try_acquire(harness.root()).unwrap();

    let err = assert_err!(harness.sequencer().update().await);

    assert!(matches!(err, SequencerError::Locked(_)), "{:?}", err);
    assert!(harness.calls().is_empty());
    assert!(!harness.backup_dir().exists());
}

#[tokio::test]
async fn test_fetch_timeout_restarts_unchanged() {
    let harness = Harness::with_config(
        Script {
            remote_changed: true,
            fetch_delay: Some(Duration::from_secs(5)),
            ..Default::default()
        },
        |config| config.timeouts.fetch_secs = 1,
    );

    let err = assert_err!(harness.sequencer().update().await);

    let SequencerError::FetchFailed { reason, .. } = &err else {
        panic!("unexpected error: {:?}", err);
    };
    assert!(reason.contains("timed out"), "{}", reason);
    assert!(!harness.called("apply"));
    assert!(harness.called("start"));
    assert_eq!(harness.read_code("main.py"), "v1\n");
}

#[tokio::test]
async fn test_fetch_failure_restarts_unchanged() {
    let harness = Harness::new(Script {
        fetch_fails: true,
        ..Default::default()
    });

    let err = assert_err!(harness.sequencer().update().await);
    assert!(matches!(err, SequencerError::FetchFailed { .. }), "{:?}", err);
    assert!(harness.position("stop") < harness.position("start"));
    assert!(err.backup_path().is_some());
}

#[tokio::test]
async fn test_stop_failure_changes_nothing() {
    let harness = Harness::new(Script {
        remote_changed: true,
        stop_fails: true,
        ..Default::default()
    });

    let err = assert_err!(harness.sequencer().update().await);

    assert!(matches!(err, SequencerError::StopFailed { .. }), "{:?}", err);
    assert!(!harness.called("fetch"));
    assert!(harness.called("start"));
    assert_eq!(harness.read_code("main.py"), "v1\n");
}

#[tokio::test]
async fn test_restore_latest_backup() {
    let harness = Harness::new(changed());
    assert_ok!(harness.sequencer().update().await);
    assert_eq!(harness.read_code("main.py"), "v2\n");
    fs::remove_file(harness.code_dir().join(".env")).unwrap();

    let sequencer = harness.sequencer();
    let report = assert_ok!(sequencer.restore(None).await);

    assert_eq!(harness.read_code("main.py"), "v1\n");
    assert_eq!(harness.read_code(".env"), ENV_CONTENTS);
    assert!(report.rollback.is_clean(), "{:?}", report.rollback);
    assert!(report.history.contains(&SequencerState::RollingBack));
    assert_eq!(report.history.last(), Some(&SequencerState::Verified));
    assert_eq!(
        fs::read_to_string(harness.venv_dir().join("installed_from")).unwrap(),
        "v1\n"
    );
}

#[tokio::test]
async fn test_restore_explicit_backup() {
    let harness = Harness::new(changed());
    let report = assert_ok!(harness.sequencer().update().await);

    let restored = assert_ok!(harness.sequencer().restore(Some(&report.backup)).await);
    assert_eq!(restored.backup, report.backup);
    assert_eq!(harness.read_code("main.py"), "v1\n");
}

#[tokio::test]
async fn test_restore_without_backups() {
    let harness = Harness::new(Script::default());

    let err = assert_err!(harness.sequencer().restore(None).await);

    assert!(matches!(err, SequencerError::NoBackup(_)), "{:?}", err);
    assert!(!harness.called("stop"));
}

#[tokio::test]
async fn test_status_reports_layout() {
    let harness = Harness::new(Script::default());
    fs::remove_file(harness.code_dir().join("bot.db")).unwrap();

    let status = harness.sequencer().status().await;

    assert!(status.installed);
    assert_eq!(status.active, Some(true));
    assert_eq!(status.revision.as_deref(), Some(LOCAL_REV));
    assert!(status.latest_backup.is_none());
    assert!(status
        .secrets
        .contains(&(PathBuf::from("bot.db"), false)));
    assert!(status.secrets.contains(&(PathBuf::from(".env"), true)));
}
