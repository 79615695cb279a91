//! Backup store tests

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::Path;

use redeploy::deploy::backup::BackupStore;
use redeploy::filesys::dir::Dir;
use redeploy::storage::layout::DeploymentLayout;
use redeploy::storage::settings::DeploymentConfig;

fn layout(tmp: &Path) -> DeploymentLayout {
    let mut config = DeploymentConfig::new("bot", tmp.join("bot"), "bot.service");
    config.backup_dir = Some(tmp.join("backups"));
    let layout = DeploymentLayout::from_config(&config);

    let code = layout.code_dir();
    fs::create_dir_all(code.path().join("handlers")).unwrap();
    fs::write(code.path().join("main.py"), "import handlers\n").unwrap();
    fs::write(code.path().join("handlers").join("start.py"), "async def start(): ...\n").unwrap();
    fs::write(code.path().join(".env"), "TELEGRAM_API_TOKEN=x\n").unwrap();
    layout
}

#[tokio::test]
async fn test_snapshot_preserves_links_and_modes() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = layout(tmp.path());
    let code = layout.code_dir();
    symlink("handlers/start.py", code.path().join("start.py")).unwrap();
    let script = code.path().join("run.sh");
    fs::write(&script, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

    let backup = BackupStore::new(&layout).create(None).await.unwrap();
    let copy = backup.code_dir();

    let link = fs::read_link(copy.path().join("start.py")).unwrap();
    assert_eq!(link, Path::new("handlers/start.py"));
    let mode = fs::metadata(copy.path().join("run.sh")).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o755);
    assert_eq!(
        Dir::new(copy.path()).tree_digest().await.unwrap(),
        code.tree_digest().await.unwrap()
    );
}

#[tokio::test]
async fn test_backups_listed_newest_first() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = layout(tmp.path());
    let store = BackupStore::new(&layout);

    let first = store.create(Some("aaa".to_string())).await.unwrap();
    let second = store.create(Some("bbb".to_string())).await.unwrap();

    let listed = store.list().await.unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].path(), second.path());
    assert_eq!(listed[1].path(), first.path());
    assert_eq!(
        store.latest().await.unwrap().unwrap().manifest().revision.as_deref(),
        Some("bbb")
    );
}

#[tokio::test]
async fn test_backups_are_never_overwritten() {
    let tmp = tempfile::tempdir().unwrap();
    let layout = layout(tmp.path());
    let store = BackupStore::new(&layout);

    let first = store.create(None).await.unwrap();
    fs::write(layout.code_dir().path().join("main.py"), "changed\n").unwrap();
    store.create(None).await.unwrap();

    assert_eq!(
        fs::read_to_string(first.code_dir().path().join("main.py")).unwrap(),
        "import handlers\n"
    );
}
