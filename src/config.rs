use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::archiver::ArchiverOptions;
use crate::compression::CompressionMode;
use crate::error::{IoResultExt, Result};
use crate::store::{gcs, GcsStore, LocalFsStore, VersionStore};

/// archiver configuration stored as toml
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// local root for materialized versions
    pub archive_dir: PathBuf,
    /// bucket holding the archives
    pub bucket: String,
    /// optional leading path for every blob
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
    #[serde(default)]
    pub compression: CompressionMode,
    /// extract straight from the backend stream instead of a temp file
    #[serde(default = "default_true")]
    pub download_as_stream: bool,
    pub backend: BackendConfig,
}

fn default_true() -> bool {
    true
}

/// which blob backend to talk to
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// generation-addressed store on the local filesystem
    Local { root: PathBuf },
    /// google cloud storage json api
    Gcs {
        #[serde(default = "default_endpoint")]
        endpoint: String,
        /// environment variable holding a bearer token
        #[serde(default = "default_token_env")]
        token_env: String,
    },
}

fn default_endpoint() -> String {
    gcs::DEFAULT_ENDPOINT.to_string()
}

fn default_token_env() -> String {
    "GCS_OAUTH_TOKEN".to_string()
}

impl Config {
    /// create a config using a local filesystem backend
    pub fn local(
        archive_dir: impl Into<PathBuf>,
        bucket: impl Into<String>,
        root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            bucket: bucket.into(),
            path_prefix: None,
            compression: CompressionMode::default(),
            download_as_stream: true,
            backend: BackendConfig::Local { root: root.into() },
        }
    }

    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_path(parent)?;
        }
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn archiver_options(&self) -> ArchiverOptions {
        ArchiverOptions {
            archive_dir: self.archive_dir.clone(),
            bucket: self.bucket.clone(),
            path_prefix: self.path_prefix.clone(),
            compression: self.compression,
            download_as_stream: self.download_as_stream,
        }
    }

    /// construct the configured backend
    pub fn open_store(&self) -> Result<Box<dyn VersionStore>> {
        match &self.backend {
            BackendConfig::Local { root } => Ok(Box::new(LocalFsStore::new(root.clone()))),
            BackendConfig::Gcs {
                endpoint,
                token_env,
            } => Ok(Box::new(GcsStore::from_env(endpoint, token_env)?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_toml_roundtrip() {
        let mut config = Config::local("/var/archive", "artifacts", "/srv/blobs");
        config.path_prefix = Some("nrtsearch".to_string());
        config.compression = CompressionMode::Lz4;
        config.download_as_stream = false;

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_config_minimal_toml() {
        let toml_str = r#"
archive_dir = "/var/archive"
bucket = "artifacts"

[backend]
kind = "gcs"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.compression, CompressionMode::Gzip);
        assert!(config.download_as_stream);
        assert!(config.path_prefix.is_none());
        assert_eq!(
            config.backend,
            BackendConfig::Gcs {
                endpoint: "https://storage.googleapis.com".to_string(),
                token_env: "GCS_OAUTH_TOKEN".to_string(),
            }
        );
    }

    #[test]
    fn test_config_rejects_unknown_backend() {
        let toml_str = r#"
archive_dir = "/var/archive"
bucket = "artifacts"

[backend]
kind = "s3"
"#;
        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_config_save_load_and_wiring() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc/archivist.toml");
        let mut config = Config::local(dir.path().join("archive"), "b", dir.path().join("blobs"));
        config.compression = CompressionMode::Lz4;
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);

        let options = loaded.archiver_options();
        assert_eq!(options.archive_dir, dir.path().join("archive"));
        assert_eq!(options.bucket, "b");
        assert_eq!(options.compression, CompressionMode::Lz4);

        let store = loaded.open_store().unwrap();
        assert!(store.list("b", "").unwrap().is_empty());
    }
}
