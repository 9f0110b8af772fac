use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::crypto::ArchivePassword;
use crate::transfer::upload::UploadConfig;

/// Clé fixe de l'objet catalogue.
pub const DEFAULT_CATALOG_KEY: &str = "library.zip";

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_catalog_key() -> String {
    DEFAULT_CATALOG_KEY.to_string()
}

/// Configuration d'accès au stockage objet compatible S3.
///
/// Identifiants S3 classiques :
/// - Access Key ID
/// - Secret Access Key
/// - Endpoint (ex: https://gateway.storjshare.io)
/// - Bucket name
#[derive(Clone, Deserialize)]
pub struct StoreConfig {
    /// Vide : identifiants lus depuis l'environnement.
    #[serde(default)]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    pub endpoint: String,
    pub bucket_name: String,
    #[serde(default = "default_region")]
    pub region: String,
}

impl StoreConfig {
    pub fn new(
        access_key_id: String,
        secret_access_key: String,
        endpoint: String,
        bucket_name: String,
    ) -> Self {
        Self {
            access_key_id,
            secret_access_key,
            endpoint,
            bucket_name,
            region: default_region(), // la plupart des passerelles acceptent us-east-1
        }
    }
}

impl std::fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConfig")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .finish()
    }
}

/// Configuration complète d'une bibliothèque, chargée depuis un fichier TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct VaultConfig {
    pub store: StoreConfig,
    #[serde(default = "default_catalog_key")]
    pub catalog_key: String,
    pub password: ArchivePassword,
    /// Base SQLite locale (miroir du catalogue).
    pub database_path: PathBuf,
    /// Fichiers temporaires (archives en construction, extractions).
    pub scratch_dir: PathBuf,
    /// Fichiers de lecture persistés par film.
    pub media_dir: PathBuf,
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Erreurs de chargement de la configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl VaultConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: VaultConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        log::info!("VaultConfig::load: path={}", path.display());
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.workers == 0 {
            return Err(ConfigError::Invalid("upload.workers must be at least 1".to_string()));
        }
        if self.upload.part_size == 0 {
            return Err(ConfigError::Invalid("upload.part_size must be positive".to_string()));
        }
        if self.upload.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "upload.retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.password.expose().is_empty() {
            return Err(ConfigError::Invalid("password must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn has_static_credentials(&self) -> bool {
        !self.store.access_key_id.is_empty()
    }

    pub fn bucket(&self) -> &str {
        &self.store.bucket_name
    }
}
