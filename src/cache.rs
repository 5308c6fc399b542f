//! In-memory token cache keyed by client, authority and scope.
//!
//! The cache is owned by the [`App`](crate::app::App) and can be hydrated from
//! and flushed to a pretty-printed JSON file at startup and shutdown.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::auth::authority::Authority;
use crate::auth::scope::Scope;
use crate::auth::token::Token;
use crate::error::CacheError;

/// Composite key `client_id;authorization_endpoint;scope`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(client_id: &str, authority: &Authority, scope: &Scope) -> Self {
        Self(format!(
            "{};{};{}",
            client_id, authority.authorization_endpoint, scope
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Thread-safe map from [`CacheKey`] to the last token obtained for it.
#[derive(Debug, Default)]
pub struct TokenCache {
    entries: RwLock<HashMap<String, Token>>,
}

impl TokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the token for a key, `None` if nothing was stored.
    pub fn get(&self, client_id: &str, authority: &Authority, scope: &Scope) -> Option<Token> {
        let key = CacheKey::new(client_id, authority, scope);
        self.read().get(key.as_str()).cloned()
    }

    /// Store a token, replacing any previous entry for the key.
    pub fn insert(&self, client_id: &str, authority: &Authority, scope: &Scope, token: Token) {
        let key = CacheKey::new(client_id, authority, scope);
        debug!("Caching token for {}", key.as_str());
        self.write().insert(key.0, token);
    }

    /// Remove the entry for a key, returning it if present.
    pub fn delete(&self, client_id: &str, authority: &Authority, scope: &Scope) -> Option<Token> {
        let key = CacheKey::new(client_id, authority, scope);
        self.write().remove(key.as_str())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Replace the cache contents with a JSON snapshot read from `reader`.
    pub fn load_from<R: Read>(&self, reader: R) -> Result<(), CacheError> {
        let mut entries = self.write();
        *entries = from_records(serde_json::from_reader(reader)?);
        Ok(())
    }

    /// Write a pretty-printed JSON snapshot of the cache to `writer`.
    ///
    /// Takes the write lock so no insert can interleave with the snapshot.
    pub fn save_to<W: Write>(&self, mut writer: W) -> Result<(), CacheError> {
        let entries = self.write();
        serde_json::to_writer_pretty(&mut writer, &to_records(&entries))?;
        writer.flush()?;
        Ok(())
    }

    /// Hydrate the cache from a file; a missing file leaves the cache untouched.
    pub fn import(&self, path: &Path) -> Result<(), CacheError> {
        let mut entries = self.write();
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No token cache at {}", path.display());
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        *entries = from_records(serde_json::from_reader(io::BufReader::new(file))?);
        info!("Imported {} cached token(s) from {}", entries.len(), path.display());
        Ok(())
    }

    /// Like [`import`](Self::import), but a file that cannot be parsed is
    /// renamed to `<path>.bak` so a later export does not destroy it.
    ///
    /// Returns the backup location when the file was set aside.
    pub fn import_or_set_aside(&self, path: &Path) -> Result<Option<PathBuf>, CacheError> {
        match self.import(path) {
            Ok(()) => Ok(None),
            Err(CacheError::Serialization(e)) => {
                let backup = backup_path(path);
                fs::rename(path, &backup)?;
                warn!(
                    "Token cache {} is unreadable ({}), moved to {}",
                    path.display(),
                    e,
                    backup.display()
                );
                Ok(Some(backup))
            }
            Err(e) => Err(e),
        }
    }

    /// Flush the cache to a file, creating parent directories as needed.
    ///
    /// The snapshot is written to a temporary file in the same directory and
    /// renamed over `path`, so readers see either the old or the new file.
    pub fn export(&self, path: &Path) -> Result<(), CacheError> {
        let entries = self.write();
        write_atomically(path, |writer| {
            serde_json::to_writer_pretty(writer, &to_records(&entries))?;
            Ok(())
        })?;
        info!("Exported {} cached token(s) to {}", entries.len(), path.display());
        Ok(())
    }

    // A panic while holding the lock cannot leave the map half-updated, so a
    // poisoned lock is still safe to use.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Token>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Token>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// On-disk form of an entry: the token and the expiry stamped when it was obtained.
#[derive(Serialize, Deserialize)]
struct CacheRecord {
    #[serde(flatten)]
    token: Token,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expires_on: Option<DateTime<Utc>>,
}

fn to_records(entries: &HashMap<String, Token>) -> BTreeMap<&str, CacheRecord> {
    entries
        .iter()
        .map(|(key, token)| {
            let record = CacheRecord {
                token: token.clone(),
                expires_on: token.expires_on(),
            };
            (key.as_str(), record)
        })
        .collect()
}

fn from_records(records: HashMap<String, CacheRecord>) -> HashMap<String, Token> {
    records
        .into_iter()
        .map(|(key, record)| (key, record.token.with_expires_on(record.expires_on)))
        .collect()
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

/// Write `path` through a temporary sibling file that replaces it on success.
///
/// The temporary file is created with mode 0600 on unix, so cached refresh
/// tokens are readable only by the owner. On failure it is removed and
/// `path` is left as it was.
fn write_atomically<F>(path: &Path, write: F) -> Result<(), CacheError>
where
    F: FnOnce(&mut dyn Write) -> Result<(), CacheError>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    {
        let mut writer = io::BufWriter::new(file.as_file_mut());
        write(&mut writer)?;
        writer.flush()?;
    }
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}
