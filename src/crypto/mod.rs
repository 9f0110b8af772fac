use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use sha2::{Digest, Sha256};

/// Extension des clés d'objets d'archives.
pub const ARCHIVE_EXTENSION: &str = "zip";

/// Mot de passe des archives AES-256, fourni par la configuration du compte.
///
/// Partagé entre les tâches de transfert ; jamais affiché en clair.
#[derive(Clone)]
pub struct ArchivePassword(Arc<SecretString>);

impl ArchivePassword {
    pub fn new<S: Into<String>>(value: S) -> Self {
        let boxed: Box<str> = value.into().into_boxed_str();
        Self(Arc::new(SecretString::new(boxed)))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl fmt::Debug for ArchivePassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArchivePassword")
            .field(&"<redacted>")
            .finish()
    }
}

impl<'de> Deserialize<'de> for ArchivePassword {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::new)
    }
}

/// Clé d'objet dérivée du contenu : SHA-256 hexadécimal du fichier + `.zip`.
pub fn content_key(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{}.{ARCHIVE_EXTENSION}", hex::encode(hasher.finalize())))
}
