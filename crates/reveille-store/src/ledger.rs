//! The schedule ledger: what should be scheduled.
//!
//! The ledger is authoritative. Triggers registered with the platform are
//! derived state that the engine reconciles against it after anything that
//! may have destroyed them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::lock::FileLock;
use crate::{LedgerError, NotificationId, NotificationRequest, Recurrence};

/// Current on-disk format version.
pub const LEDGER_VERSION: u32 = 1;

/// Durable id -> request mapping.
#[async_trait]
pub trait ScheduleLedger: Send + Sync {
    /// Read every entry from durable storage, ordered by id.
    async fn load(&self) -> Result<Vec<NotificationRequest>, LedgerError>;

    /// Look up a single entry.
    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRequest>, LedgerError>;

    /// Insert or replace the entry for `request.id`.
    async fn upsert(&self, request: &NotificationRequest) -> Result<(), LedgerError>;

    /// Remove an entry. Returns whether it existed.
    async fn remove(&self, id: NotificationId) -> Result<bool, LedgerError>;

    /// Remove every entry, returning the ids that were present.
    async fn clear(&self) -> Result<Vec<NotificationId>, LedgerError>;
}

/// Persisted record. The id is the map key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerRecord {
    title: String,
    body: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    fire_at: DateTime<Utc>,
    #[serde(default)]
    recurrence: Recurrence,
}

/// Ledger file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: BTreeMap<NotificationId, LedgerRecord>,
}

impl Default for LedgerFile {
    fn default() -> Self {
        Self {
            version: LEDGER_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

impl LedgerFile {
    fn requests(&self) -> Vec<NotificationRequest> {
        self.entries
            .iter()
            .map(|(id, record)| NotificationRequest {
                id: *id,
                title: record.title.clone(),
                body: record.body.clone(),
                fire_at: record.fire_at,
                recurrence: record.recurrence,
            })
            .collect()
    }
}

impl From<&NotificationRequest> for LedgerRecord {
    fn from(request: &NotificationRequest) -> Self {
        Self {
            title: request.title.clone(),
            body: request.body.clone(),
            fire_at: request.fire_at,
            recurrence: request.recurrence,
        }
    }
}

/// Ledger stored as a JSON file.
///
/// Every read goes to disk so a freshly started process sees exactly what
/// was last persisted. Writes replace the file atomically (temp file + rename)
/// while holding a [`FileLock`], so other processes sharing the file never
/// lose an update.
#[derive(Debug)]
pub struct FileLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLedger {
    /// Open the ledger at the default or specified path.
    ///
    /// A missing file is an empty ledger; it is created on first write.
    pub fn open(path: Option<PathBuf>) -> Self {
        let path = path.unwrap_or_else(Self::default_path);
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// Get the default ledger path.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("reveille")
            .join("ledger.json")
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_file(&self) -> Result<LedgerFile, LedgerError> {
        if !fs::try_exists(&self.path).await? {
            return Ok(LedgerFile::default());
        }

        let content = fs::read_to_string(&self.path).await?;
        let file: LedgerFile = serde_json::from_str(&content)?;
        if file.version != LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion(file.version));
        }
        for request in file.requests() {
            request.validate()?;
        }
        Ok(file)
    }

    /// Apply `change` to the current contents and persist the result.
    async fn modify<T>(
        &self,
        change: impl FnOnce(&mut LedgerFile) -> T,
    ) -> Result<T, LedgerError> {
        let _guard = self.write_lock.lock().await;
        let _lock = FileLock::acquire(&self.path).await?;
        let mut file = self.read_file().await?;
        let out = change(&mut file);
        self.write_file(&file).await?;
        Ok(out)
    }

    async fn write_file(&self, file: &LedgerFile) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(file)?;
        let tmp_path = self.path.with_extension("json.tmp");
        let mut tmp = fs::File::create(&tmp_path).await?;
        tmp.write_all(content.as_bytes()).await?;
        tmp.sync_all().await?;
        drop(tmp);
        fs::rename(&tmp_path, &self.path).await?;

        debug!(path = %self.path.display(), entries = file.entries.len(), "ledger persisted");
        Ok(())
    }
}

#[async_trait]
impl ScheduleLedger for FileLedger {
    async fn load(&self) -> Result<Vec<NotificationRequest>, LedgerError> {
        Ok(self.read_file().await?.requests())
    }

    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRequest>, LedgerError> {
        let file = self.read_file().await?;
        Ok(file.requests().into_iter().find(|r| r.id == id))
    }

    #[tracing::instrument(skip(self, request), fields(id = %request.id))]
    async fn upsert(&self, request: &NotificationRequest) -> Result<(), LedgerError> {
        request.validate()?;
        self.modify(|file| {
            file.entries.insert(request.id, request.into());
        })
        .await
    }

    async fn remove(&self, id: NotificationId) -> Result<bool, LedgerError> {
        let existed = self
            .modify(|file| file.entries.remove(&id).is_some())
            .await?;
        if existed {
            debug!(%id, "removed ledger entry");
        }
        Ok(existed)
    }

    async fn clear(&self) -> Result<Vec<NotificationId>, LedgerError> {
        let ids = self
            .modify(|file| std::mem::take(&mut file.entries).into_keys().collect::<Vec<_>>())
            .await?;
        info!(count = ids.len(), "cleared ledger");
        Ok(ids)
    }
}

/// Ledger held in memory.
///
/// Can be flipped into an unavailable state to exercise cold-start failures.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    entries: RwLock<BTreeMap<NotificationId, NotificationRequest>>,
    unavailable: AtomicBool,
}

impl MemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a ledger pre-populated with `requests`.
    pub fn with_entries(requests: impl IntoIterator<Item = NotificationRequest>) -> Self {
        let entries = requests.into_iter().map(|r| (r.id, r)).collect();
        Self {
            entries: RwLock::new(entries),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make `load` fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), LedgerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("storage not mounted".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduleLedger for MemoryLedger {
    async fn load(&self) -> Result<Vec<NotificationRequest>, LedgerError> {
        self.check_available()?;
        Ok(self.entries.read().await.values().cloned().collect())
    }

    async fn get(&self, id: NotificationId) -> Result<Option<NotificationRequest>, LedgerError> {
        self.check_available()?;
        Ok(self.entries.read().await.get(&id).cloned())
    }

    async fn upsert(&self, request: &NotificationRequest) -> Result<(), LedgerError> {
        self.check_available()?;
        request.validate()?;
        self.entries
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(())
    }

    async fn remove(&self, id: NotificationId) -> Result<bool, LedgerError> {
        self.check_available()?;
        Ok(self.entries.write().await.remove(&id).is_some())
    }

    async fn clear(&self) -> Result<Vec<NotificationId>, LedgerError> {
        self.check_available()?;
        let mut entries = self.entries.write().await;
        let ids = entries.keys().copied().collect();
        entries.clear();
        Ok(ids)
    }
}
