use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail, ensure};
use serde::Deserialize;

use crate::cli::Cli;

const AWS_ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY";
const AWS_SECRET_ACCESS_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";
const PCDN_SECRET_ENV: &str = "PCDN_SECRET";

const MANDATORY_PRESERVE_HEADERS: [&str; 1] = ["content-type"];
const ILLEGAL_PRESERVE_HEADERS: [&str; 3] = ["content-encoding", "accept-ranges", "content-length"];

/// The one JSON configuration document read at startup. Field names follow
/// the wire format (`CacheDir`, `FreeSpaceBatchSizeInBytes`, ...).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Settings {
    pub listen: SocketAddr,
    pub cache_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub database_dir: PathBuf,
    pub cache_size: u64,
    #[serde(default)]
    pub free_space_batch_size_in_bytes: u64,
    #[serde(default, rename = "TLSCertificateDir")]
    pub tls_certificate_dir: Option<PathBuf>,
    #[serde(default)]
    pub gzip_content_types: Vec<String>,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub preserve_headers: Vec<String>,
    #[serde(default)]
    pub secret: String,
    pub hosts: HashMap<String, Host>,
    #[serde(default)]
    pub metrics_listen: Option<SocketAddr>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct Host {
    pub bucket: String,
    #[serde(default)]
    pub path: String,
    /// Base URL of an S3-compatible service; unset means AWS.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub preserve_headers: Option<Vec<String>>,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub sig_required: bool,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = resolve_config_path(cli)?;
        let data = fs::read(&config_path)
            .with_context(|| format!("failed to read config {}", config_path.display()))?;
        let mut settings: Settings = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse config {}", config_path.display()))?;
        settings.apply_env(|name| std::env::var(name).ok());
        settings.normalize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Fills in unset credentials from the environment. Separated from
    /// `load` so tests can inject a lookup.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if self.access_key.is_empty()
            && let Some(value) = get(AWS_ACCESS_KEY_ENV)
        {
            tracing::info!("using {AWS_ACCESS_KEY_ENV} from environment");
            self.access_key = value;
        }
        if self.secret_key.is_empty()
            && let Some(value) = get(AWS_SECRET_ACCESS_KEY_ENV)
        {
            tracing::info!("using {AWS_SECRET_ACCESS_KEY_ENV} from environment");
            self.secret_key = value;
        }
        if self.secret.is_empty()
            && let Some(value) = get(PCDN_SECRET_ENV)
        {
            tracing::info!("using {PCDN_SECRET_ENV} from environment");
            self.secret = value;
        }
    }

    /// Resolves per-host credentials and preserved-header lists against the
    /// top-level defaults. Preserved header names are lower-cased here once;
    /// everything downstream compares lower-cased names.
    pub fn normalize(&mut self) -> Result<()> {
        let default_preserve = self.preserve_headers.clone();
        for (name, host) in self.hosts.iter_mut() {
            let mut preserve: Vec<String> = host
                .preserve_headers
                .clone()
                .unwrap_or_else(|| default_preserve.clone())
                .iter()
                .map(|header| header.to_ascii_lowercase())
                .collect();

            for illegal in ILLEGAL_PRESERVE_HEADERS {
                if preserve.iter().any(|header| header == illegal) {
                    bail!("header {illegal} cannot be preserved (host {name})");
                }
            }
            for mandatory in MANDATORY_PRESERVE_HEADERS {
                if !preserve.iter().any(|header| header == mandatory) {
                    preserve.push(mandatory.to_string());
                }
            }
            host.preserve_headers = Some(preserve);

            if host.access_key.is_empty() {
                host.access_key = self.access_key.clone();
            }
            if host.secret_key.is_empty() {
                host.secret_key = self.secret_key.clone();
            }
            ensure!(
                !host.access_key.is_empty(),
                "no AccessKey found for host {name}"
            );
            ensure!(
                !host.secret_key.is_empty(),
                "no SecretKey found for host {name}"
            );
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(!self.secret.is_empty(), "secret is required");
        ensure!(!self.hosts.is_empty(), "at least one host must be configured");
        ensure!(self.cache_size > 0, "CacheSize must be greater than 0");
        require_dir(&self.cache_dir, "CacheDir")?;
        require_dir(&self.tmp_dir, "TmpDir")?;
        require_dir(&self.database_dir, "DatabaseDir")?;
        if let Some(dir) = &self.tls_certificate_dir {
            require_dir(dir, "TLSCertificateDir")?;
        }
        Ok(())
    }

    /// Configured virtual-host names, sorted for stable logging.
    pub fn host_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.hosts.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_certificate_dir.is_some()
    }
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    let meta =
        fs::metadata(path).with_context(|| format!("{what} {} does not exist", path.display()))?;
    ensure!(meta.is_dir(), "{what} {} is not a directory", path.display());
    Ok(())
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.config {
        return Ok(path.clone());
    }
    let fallback = PathBuf::from("config.json");
    if fallback.exists() {
        return Ok(fallback);
    }
    bail!("no configuration file provided via --config and ./config.json not found");
}
