//! Settings file tests

use std::fs;
use std::path::Path;

use redeploy::errors::DeployError;
use redeploy::logs::LogLevel;
use redeploy::storage::settings::Settings;

const SETTINGS: &str = r#"{
    "log_level": "debug",
    "log_dir": "/var/log/redeploy",
    "deployments": [
        {
            "name": "shop-bot",
            "root": "/home/deploy/shop-bot",
            "service": "shop-bot.service",
            "user": "deploy",
            "backup_dir": "/home/deploy/backups",
            "timeouts": { "install_secs": 1800 }
        },
        {
            "name": "support-bot",
            "root": "/srv/support",
            "code_subdir": "app",
            "service": "support.service",
            "branch": "production"
        }
    ]
}"#;

#[tokio::test]
async fn test_load_settings_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("settings.json");
    fs::write(&path, SETTINGS).unwrap();

    let settings = Settings::load(&path).await.unwrap();
    assert_eq!(settings.log_level, LogLevel::Debug);
    assert!(!settings.log_format_json);
    assert_eq!(settings.deployments.len(), 2);

    let shop = settings.deployment(Some("shop-bot")).unwrap();
    assert_eq!(shop.user.as_deref(), Some("deploy"));
    assert_eq!(shop.timeouts.install_secs, 1800);
    assert_eq!(shop.timeouts.fetch_secs, 120);
    assert_eq!(shop.code_subdir, "bot");
    assert_eq!(shop.branch, "main");

    let support = settings.deployment(Some("support-bot")).unwrap();
    assert_eq!(support.code_subdir, "app");
    assert_eq!(support.branch, "production");
    assert!(support.require_root);

    // Two deployments: a name is required
    assert!(matches!(
        settings.deployment(None),
        Err(DeployError::ConfigError(_))
    ));
    assert!(matches!(
        settings.deployment(Some("missing")),
        Err(DeployError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_missing_settings_file() {
    let err = Settings::load(Path::new("/nonexistent/redeploy/settings.json"))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::ConfigError(_)));
}

#[tokio::test]
async fn test_malformed_settings_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("settings.json");
    fs::write(&path, "{ \"deployments\": [ { \"name\": ").unwrap();

    let err = Settings::load(&path).await.unwrap_err();
    assert!(matches!(err, DeployError::ConfigError(_)));
}

#[tokio::test]
async fn test_settings_without_deployments_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("settings.json");
    fs::write(&path, "{}").unwrap();

    assert!(Settings::load(&path).await.is_err());
}
