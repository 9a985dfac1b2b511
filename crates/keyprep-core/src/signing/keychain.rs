//! Ephemeral keychain management for iOS code signing.
//!
//! Each credential preparation gets its own randomly named keychain with a
//! random password, so concurrent builds on one host never share signing
//! identities.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SigningConfig;
use crate::error::{KeyprepError, Result};
use crate::process::CommandRunner;

/// Contract for the keychain that receives distribution certificates.
#[async_trait]
pub trait Keychain: Send + Sync {
    /// Creates and unlocks the keychain, returning its path.
    async fn create(&mut self) -> Result<PathBuf>;

    /// Path of the keychain, once created.
    fn path(&self) -> Option<&Path>;

    /// Imports a PKCS#12 bundle into the keychain.
    async fn import_certificate(&self, p12_path: &Path, password: &SecretString) -> Result<()>;

    /// Fails unless an identity with `fingerprint` for `team_id` is usable.
    async fn ensure_certificate_imported(&self, team_id: &str, fingerprint: &str) -> Result<()>;

    /// Deletes the keychain and removes it from the search list.
    async fn destroy(&mut self) -> Result<()>;

    /// Best-effort synchronous deletion for contexts that cannot await.
    fn destroy_blocking(&mut self) {}
}

/// A signing identity listed by `security find-identity`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningIdentity {
    pub fingerprint: String,
    pub name: String,
}

#[derive(Debug)]
struct Created {
    path: PathBuf,
    password: SecretString,
}

/// Keychain backed by a file and the macOS `security` tool.
pub struct EphemeralKeychain {
    runner: Arc<dyn CommandRunner>,
    security_bin: String,
    keychain_dir: PathBuf,
    timeout_secs: u64,
    created: Option<Created>,
}

impl EphemeralKeychain {
    pub fn new(runner: Arc<dyn CommandRunner>, config: &SigningConfig) -> Self {
        Self {
            runner,
            security_bin: config.security_bin.clone(),
            keychain_dir: config.keychain_dir.clone(),
            timeout_secs: config.keychain_timeout_secs,
            created: None,
        }
    }

    async fn security(&self, args: Vec<String>) -> Result<String> {
        let output = self.runner.run_checked(&self.security_bin, &args).await?;
        Ok(output.stdout_lossy())
    }

    /// Steps after `create-keychain`; on error the caller deletes the file.
    async fn configure(&self, path: &str, password: &SecretString) -> Result<()> {
        self.security(vec![
            "unlock-keychain".to_string(),
            "-p".to_string(),
            password.expose_secret().to_string(),
            path.to_string(),
        ])
        .await?;

        // No auto-lock on sleep, lock after the configured inactivity timeout
        if let Err(e) = self
            .security(vec![
                "set-keychain-settings".to_string(),
                "-ut".to_string(),
                self.timeout_secs.to_string(),
                path.to_string(),
            ])
            .await
        {
            tracing::warn!(
                "Failed to configure keychain settings (may still work): {}",
                e
            );
        }

        self.add_to_search_list(path).await
    }

    /// Prepends the keychain to the user search list so codesign finds it.
    async fn add_to_search_list(&self, path: &str) -> Result<()> {
        let current = self
            .security(vec![
                "list-keychains".to_string(),
                "-d".to_string(),
                "user".to_string(),
            ])
            .await?;

        let mut args = vec![
            "list-keychains".to_string(),
            "-d".to_string(),
            "user".to_string(),
            "-s".to_string(),
            path.to_string(),
        ];
        let others = parse_keychain_list(&current);
        args.extend(others.into_iter().filter(|k| k != path));

        self.security(args).await?;
        tracing::debug!("Added keychain to search list: {}", path);
        Ok(())
    }

    fn created(&self) -> Result<&Created> {
        self.created
            .as_ref()
            .ok_or_else(|| KeyprepError::InvalidState("Keychain has not been created".to_string()))
    }
}

#[async_trait]
impl Keychain for EphemeralKeychain {
    async fn create(&mut self) -> Result<PathBuf> {
        if self.created.is_some() {
            return Err(KeyprepError::InvalidState(
                "Keychain has already been created".to_string(),
            ));
        }

        let path = self
            .keychain_dir
            .join(format!("keyprep-{}.keychain-db", uuid::Uuid::new_v4()));
        let path_str = path.to_string_lossy().into_owned();
        let password = SecretString::from(generate_random_password(32));

        self.security(vec![
            "create-keychain".to_string(),
            "-p".to_string(),
            password.expose_secret().to_string(),
            path_str.clone(),
        ])
        .await?;

        if let Err(e) = self.configure(&path_str, &password).await {
            if let Err(delete_err) = self
                .security(vec!["delete-keychain".to_string(), path_str])
                .await
            {
                tracing::warn!(
                    "Failed to delete keychain {} after failed setup: {}",
                    path.display(),
                    delete_err
                );
            }
            return Err(e);
        }

        tracing::debug!("Created ephemeral keychain: {}", path.display());

        self.created = Some(Created {
            path: path.clone(),
            password,
        });
        Ok(path)
    }

    fn path(&self) -> Option<&Path> {
        self.created.as_ref().map(|c| c.path.as_path())
    }

    async fn import_certificate(&self, p12_path: &Path, password: &SecretString) -> Result<()> {
        let created = self.created()?;
        let keychain = created.path.to_string_lossy().into_owned();

        let args = vec![
            "import".to_string(),
            p12_path.to_string_lossy().into_owned(),
            "-k".to_string(),
            keychain.clone(),
            "-P".to_string(),
            password.expose_secret().to_string(),
            "-T".to_string(),
            "/usr/bin/codesign".to_string(),
            "-T".to_string(),
            "/usr/bin/security".to_string(),
        ];
        let output = self.runner.run(&self.security_bin, &args).await?;
        if !output.is_success() {
            // Targets commonly share one certificate, so a repeat import is expected
            if is_duplicate_item(&output.stderr) {
                tracing::debug!(
                    "Certificate already present in keychain: {}",
                    created.path.display()
                );
                return Ok(());
            }
            return Err(KeyprepError::ExternalTool {
                program: self.security_bin.clone(),
                subcommand: "import".to_string(),
                stderr: output.stderr.trim().to_string(),
            });
        }

        // Allows codesign to use the key without a UI prompt on headless hosts
        if let Err(e) = self
            .security(vec![
                "set-key-partition-list".to_string(),
                "-S".to_string(),
                "apple-tool:,apple:,codesign:".to_string(),
                "-s".to_string(),
                "-k".to_string(),
                created.password.expose_secret().to_string(),
                keychain,
            ])
            .await
        {
            tracing::warn!("Failed to set key partition list (may still work): {}", e);
        }

        tracing::debug!(
            "Imported certificate into keychain: {}",
            created.path.display()
        );
        Ok(())
    }

    async fn ensure_certificate_imported(&self, team_id: &str, fingerprint: &str) -> Result<()> {
        let created = self.created()?;
        let output = self
            .security(vec![
                "find-identity".to_string(),
                "-v".to_string(),
                "-p".to_string(),
                "codesigning".to_string(),
                created.path.to_string_lossy().into_owned(),
            ])
            .await?;

        let team_marker = format!("({})", team_id);
        let found = parse_identities(&output)
            .iter()
            .any(|id| id.fingerprint == fingerprint && id.name.contains(&team_marker));

        if !found {
            return Err(KeyprepError::IdentityNotFound {
                team_id: team_id.to_string(),
                fingerprint: fingerprint.to_string(),
            });
        }

        Ok(())
    }

    async fn destroy(&mut self) -> Result<()> {
        let Some(created) = self.created.take() else {
            tracing::debug!("No keychain to destroy");
            return Ok(());
        };

        self.security(vec![
            "delete-keychain".to_string(),
            created.path.to_string_lossy().into_owned(),
        ])
        .await?;

        tracing::debug!("Deleted ephemeral keychain: {}", created.path.display());
        Ok(())
    }

    fn destroy_blocking(&mut self) {
        if let Some(created) = self.created.take() {
            match std::process::Command::new(&self.security_bin)
                .arg("delete-keychain")
                .arg(&created.path)
                .output()
            {
                Ok(output) if output.status.success() => {
                    tracing::debug!("Deleted ephemeral keychain: {}", created.path.display());
                }
                Ok(output) => tracing::error!(
                    "Failed to delete keychain {}: {}",
                    created.path.display(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => tracing::error!(
                    "Failed to delete keychain {}: {}",
                    created.path.display(),
                    e
                ),
            }
        }
    }
}

/// `security import` reports an identity that is already in the keychain
/// as an error.
fn is_duplicate_item(stderr: &str) -> bool {
    stderr.contains("already exists in the keychain")
}

/// Parses `security list-keychains` output into paths.
pub fn parse_keychain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(|line| line.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parses `security find-identity -v` output.
///
/// Lines look like `  1) 3F2A...C9 "iPhone Distribution: Acme Inc (ABCDE12345)"`.
pub fn parse_identities(output: &str) -> Vec<SigningIdentity> {
    let Ok(pattern) = regex_lite::Regex::new(r#"^\s*\d+\)\s+([0-9A-Fa-f]{40})\s+"(.+)"\s*$"#)
    else {
        return Vec::new();
    };

    output
        .lines()
        .filter_map(|line| pattern.captures(line))
        .map(|caps| SigningIdentity {
            fingerprint: caps[1].to_uppercase(),
            name: caps[2].to_string(),
        })
        .collect()
}

/// Generates a random password for keychain encryption.
fn generate_random_password(length: usize) -> String {
    use rand::Rng;
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| {
            let idx = rng.gen_range(0..CHARSET.len());
            CHARSET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::test_utils::{FakeCommandRunner, arg_after};

    const FINGERPRINT: &str = "3F2A6C1D9E8B7A6F5E4D3C2B1A0F9E8D7C6B5A49";

    fn runner() -> FakeCommandRunner {
        FakeCommandRunner::new()
            .ok("security", "create-keychain")
            .ok("security", "unlock-keychain")
            .ok("security", "set-keychain-settings")
            .on("security", "list-keychains", |args| {
                if args.iter().any(|a| a == "-s") {
                    Ok(CommandOutput::success(Vec::new()))
                } else {
                    Ok(CommandOutput::success(
                        "    \"/Users/ci/Library/Keychains/login.keychain-db\"\n",
                    ))
                }
            })
            .ok("security", "import")
            .ok("security", "set-key-partition-list")
            .ok("security", "delete-keychain")
    }

    fn keychain(runner: Arc<FakeCommandRunner>) -> EphemeralKeychain {
        let config = SigningConfig::new("/tmp/profiles");
        EphemeralKeychain::new(runner, &config)
    }

    #[test]
    fn test_generate_random_password() {
        let password = generate_random_password(32);
        assert_eq!(password.len(), 32);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));

        let password2 = generate_random_password(32);
        assert_ne!(password, password2);
    }

    #[test]
    fn test_parse_identities() {
        let output = format!(
            "  1) {} \"iPhone Distribution: Acme Inc (ABCDE12345)\"\n  2) {} \"Apple Development: Jane (ZZZZZ99999)\"\n     2 valid identities found\n",
            FINGERPRINT,
            "a".repeat(40)
        );
        let identities = parse_identities(&output);
        assert_eq!(identities.len(), 2);
        assert_eq!(identities[0].fingerprint, FINGERPRINT);
        assert_eq!(
            identities[0].name,
            "iPhone Distribution: Acme Inc (ABCDE12345)"
        );
        assert_eq!(identities[1].fingerprint, "A".repeat(40));
    }

    #[test]
    fn test_parse_keychain_list() {
        let list = parse_keychain_list(
            "    \"/a/login.keychain-db\"\n    \"/Library/Keychains/System.keychain\"\n\n",
        );
        assert_eq!(
            list,
            vec!["/a/login.keychain-db", "/Library/Keychains/System.keychain"]
        );
    }

    #[tokio::test]
    async fn test_create_configures_and_lists_keychain() {
        let runner = Arc::new(runner());
        let mut keychain = keychain(runner.clone());

        let path = keychain.create().await.unwrap();

        assert_eq!(keychain.path(), Some(path.as_path()));
        assert!(path.to_string_lossy().ends_with(".keychain-db"));
        assert_eq!(runner.count("security", "create-keychain"), 1);
        assert_eq!(runner.count("security", "unlock-keychain"), 1);

        let calls = runner.calls();
        let (_, set_list) = calls
            .iter()
            .find(|(_, args)| args[0] == "list-keychains" && args.iter().any(|a| a == "-s"))
            .unwrap();
        let path_str = path.to_string_lossy();
        assert_eq!(arg_after(set_list, "-s"), Some(&*path_str));
        assert!(set_list.iter().any(|a| a.ends_with("login.keychain-db")));
    }

    #[tokio::test]
    async fn test_create_uses_unique_paths() {
        let runner = Arc::new(runner());
        let mut first = keychain(runner.clone());
        let mut second = keychain(runner);

        let a = first.create().await.unwrap();
        let b = second.create().await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_deletes_keychain_when_unlock_fails() {
        let runner = Arc::new(runner().on("security", "unlock-keychain", |_| {
            Ok(CommandOutput::failure(
                51,
                "security: SecKeychainUnlock: bad password\n",
            ))
        }));
        let mut keychain = keychain(runner.clone());

        let err = keychain.create().await.unwrap_err();

        assert!(err.to_string().contains("SecKeychainUnlock"));
        assert_eq!(runner.count("security", "delete-keychain"), 1);
        assert!(keychain.path().is_none());
    }

    #[tokio::test]
    async fn test_import_passes_password_and_keychain() {
        let runner = Arc::new(runner());
        let mut keychain = keychain(runner.clone());
        let path = keychain.create().await.unwrap();

        keychain
            .import_certificate(Path::new("/tmp/cert.p12"), &SecretString::from("p12-pass"))
            .await
            .unwrap();

        let calls = runner.calls();
        let (_, import) = calls.iter().find(|(_, args)| args[0] == "import").unwrap();
        assert_eq!(import[1], "/tmp/cert.p12");
        assert_eq!(arg_after(import, "-P"), Some("p12-pass"));
        let path_str = path.to_string_lossy();
        assert_eq!(arg_after(import, "-k"), Some(&*path_str));
    }

    #[tokio::test]
    async fn test_import_failure_propagates() {
        let runner = Arc::new(runner().on("security", "import", |_| {
            Ok(CommandOutput::failure(
                1,
                "security: SecKeychainItemImport: MAC verification failed during PKCS12 import (wrong password?)\n",
            ))
        }));
        let mut keychain = keychain(runner.clone());
        keychain.create().await.unwrap();

        let err = keychain
            .import_certificate(Path::new("/tmp/cert.p12"), &SecretString::from("wrong"))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("wrong password?"));
        assert_eq!(runner.count("security", "import"), 1);
        assert_eq!(runner.count("security", "set-key-partition-list"), 0);
    }

    #[tokio::test]
    async fn test_import_of_existing_certificate_succeeds() {
        let runner = Arc::new(runner().on("security", "import", |_| {
            Ok(CommandOutput::failure(
                1,
                "security: SecKeychainItemImport: The specified item already exists in the keychain.\n",
            ))
        }));
        let mut keychain = keychain(runner.clone());
        keychain.create().await.unwrap();

        keychain
            .import_certificate(Path::new("/tmp/cert.p12"), &SecretString::from("pw"))
            .await
            .unwrap();

        assert_eq!(runner.count("security", "import"), 1);
    }

    #[tokio::test]
    async fn test_create_sets_timeout_without_lock_on_sleep() {
        let runner = Arc::new(runner());
        let mut keychain = keychain(runner.clone());
        let path = keychain.create().await.unwrap();

        let calls = runner.calls();
        let (_, settings) = calls
            .iter()
            .find(|(_, args)| args[0] == "set-keychain-settings")
            .unwrap();
        assert_eq!(settings[1], "-ut");
        assert_eq!(settings[2], "21600");
        assert_eq!(settings[3], path.to_string_lossy());
    }

    #[tokio::test]
    async fn test_create_reports_failed_rollback() {
        let runner = Arc::new(
            runner()
                .on("security", "unlock-keychain", |_| {
                    Ok(CommandOutput::failure(
                51,
                "security: SecKeychainUnlock: bad password\n",
            ))
                })
                .on("security", "delete-keychain", |_| {
                    Ok(CommandOutput::failure(
                        50,
                        "security: SecKeychainDelete: no such keychain\n",
                    ))
                }),
        );
        let mut keychain = keychain(runner.clone());

        let err = keychain.create().await.unwrap_err();

        // The setup failure wins over the failed rollback
        assert!(err.to_string().contains("SecKeychainUnlock"));
        assert_eq!(runner.count("security", "delete-keychain"), 1);
        assert!(keychain.path().is_none());
    }

    #[tokio::test]
    async fn test_import_before_create_is_invalid_state() {
        let keychain = keychain(Arc::new(runner()));
        let err = keychain
            .import_certificate(Path::new("/tmp/cert.p12"), &SecretString::from("pw"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeyprepError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_ensure_certificate_imported() {
        let identities = format!(
            "  1) {} \"iPhone Distribution: Acme Inc (ABCDE12345)\"\n     1 valid identities found\n",
            FINGERPRINT
        );
        let runner = Arc::new(runner().on("security", "find-identity", move |_| {
            Ok(CommandOutput::success(identities.clone()))
        }));
        let mut keychain = keychain(runner);
        keychain.create().await.unwrap();

        keychain
            .ensure_certificate_imported("ABCDE12345", FINGERPRINT)
            .await
            .unwrap();

        let err = keychain
            .ensure_certificate_imported("ZZZZZ99999", FINGERPRINT)
            .await
            .unwrap_err();
        assert!(matches!(err, KeyprepError::IdentityNotFound { .. }));

        let err = keychain
            .ensure_certificate_imported("ABCDE12345", &"0".repeat(40))
            .await
            .unwrap_err();
        assert!(matches!(err, KeyprepError::IdentityNotFound { .. }));
    }

    #[tokio::test]
    async fn test_destroy_is_noop_when_not_created() {
        let runner = Arc::new(runner());
        let mut keychain = keychain(runner.clone());

        keychain.destroy().await.unwrap();
        assert_eq!(runner.count("security", "delete-keychain"), 0);
    }

    #[tokio::test]
    async fn test_destroy_deletes_once() {
        let runner = Arc::new(runner());
        let mut keychain = keychain(runner.clone());
        keychain.create().await.unwrap();

        keychain.destroy().await.unwrap();
        keychain.destroy().await.unwrap();

        assert_eq!(runner.count("security", "delete-keychain"), 1);
        assert!(keychain.path().is_none());
    }
}
