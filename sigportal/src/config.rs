// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

use std::{env, path::PathBuf, time::Duration};

#[cfg(feature = "cli")]
use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::platform::{LocalOptions, product::Product};

/// Configuration for the signing agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The location where the agent keeps its state.
    ///
    /// This holds certificate chains the user has chosen to trust and the portal's hardware
    /// support dataset. Defaults to `$STATE_DIRECTORY`, as set by systemd, or
    /// "/var/lib/sigportal".
    pub state_directory: PathBuf,

    /// The Unix socket on which the agent receives magic links.
    ///
    /// Defaults to "agent.socket" in `$RUNTIME_DIRECTORY`, as set by systemd, or
    /// "/run/sigportal/agent.socket".
    pub socket_path: PathBuf,

    /// The OAuth client ID the agent presents to the authorization server.
    pub client_id: String,

    /// Seconds to wait for the portal or authorization server to respond before giving up.
    pub request_timeout: u64,

    /// Minutes to remember a PIN or password after it was last entered.
    pub secret_ttl: u64,

    /// A PEM bundle of certificate authorities shipped with the agent.
    ///
    /// These are trusted for TLS in addition to the system's authorities.
    pub bundled_anchors: Option<PathBuf>,

    /// PEM bundles of the system's certificate authorities; missing files are skipped.
    pub system_anchors: Vec<PathBuf>,

    /// The PEM-encoded certificate whose key signs the portal's sessions.
    ///
    /// Without it, all work from the portal is refused.
    pub session_certificate: Option<PathBuf>,

    /// Directories containing PKCS #11 modules.
    ///
    /// When the portal suggests a smart card module by file name, it's only used if it is
    /// installed in one of these directories.
    pub pkcs11_directories: Vec<PathBuf>,

    /// The signing products available to the agent.
    ///
    /// # Example
    ///
    /// ```toml
    /// [[products]]
    /// type = "pkcs11"
    /// library = "/usr/lib64/pkcs11/opensc-pkcs11.so"
    /// label = "PIV Card"
    ///
    /// [[products]]
    /// type = "pkcs12"
    /// path = "/home/user/signing.p12"
    /// password_file = "signing.password"
    /// ```
    ///
    /// If a PIN or password file path is relative, it's relative to `$CREDENTIALS_DIRECTORY`.
    pub products: Vec<Product>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_directory: default_state_directory(),
            socket_path: default_socket_path(),
            client_id: "sigportal-agent".to_string(),
            request_timeout: 30,
            secret_ttl: 5,
            bundled_anchors: None,
            system_anchors: vec![
                PathBuf::from("/etc/pki/tls/certs/ca-bundle.crt"),
                PathBuf::from("/etc/ssl/certs/ca-certificates.crt"),
            ],
            session_certificate: None,
            pkcs11_directories: vec![
                PathBuf::from("/usr/lib64/pkcs11"),
                PathBuf::from("/usr/lib/x86_64-linux-gnu/pkcs11"),
                PathBuf::from("/usr/lib/pkcs11"),
            ],
            products: vec![],
        }
    }
}

impl std::fmt::Display for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            toml::ser::to_string_pretty(&self).unwrap_or_default()
        )
    }
}

impl Config {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn secret_ttl(&self) -> Duration {
        Duration::from_secs(self.secret_ttl * 60)
    }

    /// The options for a [`crate::platform::LocalPlatform`] using this configuration.
    pub fn local_options(&self) -> LocalOptions {
        LocalOptions {
            products: self.products.clone(),
            pkcs11_directories: self.pkcs11_directories.clone(),
            secret_ttl: self.secret_ttl(),
            session_certificate: self.session_certificate.clone(),
            state_directory: self.state_directory.clone(),
        }
    }

    /// Fix up relative PIN and password file paths to use the provided credentials directory.
    ///
    /// # Errors
    ///
    /// If a referenced file doesn't exist, an error is returned.
    pub fn with_credentials_dir(
        &mut self,
        credentials_dir: &std::path::Path,
    ) -> anyhow::Result<()> {
        for product in self.products.iter_mut() {
            let identity = product.identity();
            let Some(secret_file) = product.secret_file_mut() else {
                continue;
            };
            if secret_file.is_absolute() {
                tracing::warn!(
                    product = %identity,
                    secret_file = secret_file.display().to_string(),
                    "Path to secret file is absolute; consider using systemd credentials"
                );
            } else {
                *secret_file = credentials_dir.join(&*secret_file);
                if !secret_file.exists() {
                    return Err(anyhow::anyhow!(
                        "No secret file named '{}' found in credentials directory",
                        secret_file.display()
                    ));
                }
            }
        }

        Ok(())
    }
}

fn default_state_directory() -> PathBuf {
    env::var("STATE_DIRECTORY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/sigportal"))
}

fn default_socket_path() -> PathBuf {
    env::var("RUNTIME_DIRECTORY")
        .map(|runtime| PathBuf::from(runtime).join("agent.socket"))
        .unwrap_or_else(|_| PathBuf::from("/run/sigportal/agent.socket"))
}

#[cfg(feature = "cli")]
fn private_load_config<T>(path: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    let config = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read from path {path:?}"))?;
    tracing::info!(path=%path.display(), "Read from configuration file");
    toml::from_str(&config)
        .inspect_err(|error| {
            eprintln!("Failed to parse configuration loaded from {path:?}:\n{error}");
            eprintln!("Example config file:\n\n{}", T::default());
        })
        .context("configuration file is invalid")
}

/// Load the configuration with fallback options.
///
/// If `path` is [`None`], the `default` path, relative to `$CONFIGURATION_DIRECTORY`, is
/// checked. If that doesn't exist either, the [`Default`] implementation is returned.
///
/// # Errors
///
/// In the event that one of the config files exists, but is invalid, an error is returned.
#[cfg(feature = "cli")]
pub fn load_config<T>(path: Option<PathBuf>, default: &std::path::Path) -> anyhow::Result<T>
where
    T: Default + std::fmt::Display + serde::de::DeserializeOwned,
{
    path.or_else(|| {
        env::var("CONFIGURATION_DIRECTORY")
            .inspect_err(|error| {
                tracing::debug!(
                    ?error,
                    "CONFIGURATION_DIRECTORY environment variable isn't readable"
                );
            })
            .map(PathBuf::from)
            .ok()
            .map(|base_path| base_path.join(default))
            .filter(|path| path.is_file())
    })
    .map_or_else(
        || {
            tracing::warn!("No configuration file found; using defaults");
            Ok(T::default())
        },
        |path| {
            tracing::info!(?path, "Attempting to load configuration");
            private_load_config::<T>(&path)
        },
    )
}
