//! Controller pairing records and their storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use hap_core::error::{Error, PairingError, ParseError, Result};
use tokio::sync::Mutex;

/// A paired controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRecord {
    /// Controller pairing identifier, usually a UUID string.
    pub identifier: String,
    /// Controller LTPK.
    pub public_key: [u8; 32],
    pub admin: bool,
}

impl PairingRecord {
    pub fn new(identifier: impl Into<String>, public_key: [u8; 32], admin: bool) -> Self {
        Self {
            identifier: identifier.into(),
            public_key,
            admin,
        }
    }
}

/// Persistent set of paired controllers.
///
/// Shared by every connection of an accessory; implementations serialize
/// concurrent writers.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PairingStore: Send + Sync {
    async fn get(&self, identifier: &str) -> Result<Option<PairingRecord>>;

    /// Insert or update a record. A new identifier beyond capacity fails with
    /// [`Error::StorageFull`].
    async fn add(&self, record: PairingRecord) -> Result<()>;

    /// Insert a record for an identifier that is not stored yet. An existing
    /// identifier fails with [`PairingError::Unavailable`] and is left as is.
    async fn insert(&self, record: PairingRecord) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, identifier: &str) -> Result<bool>;

    async fn len(&self) -> Result<usize>;

    async fn is_full(&self) -> Result<bool>;
}

/// Bounded list shared by both store implementations.
#[derive(Debug)]
struct Records {
    capacity: usize,
    entries: Vec<PairingRecord>,
}

impl Records {
    fn get(&self, identifier: &str) -> Option<PairingRecord> {
        self.entries
            .iter()
            .find(|r| r.identifier == identifier)
            .cloned()
    }

    fn insert(&mut self, record: PairingRecord) -> Result<()> {
        if self.entries.iter().any(|r| r.identifier == record.identifier) {
            return Err(PairingError::Unavailable(format!(
                "{} is already paired",
                record.identifier
            ))
            .into());
        }
        self.upsert(record)
    }

    fn upsert(&mut self, record: PairingRecord) -> Result<()> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|r| r.identifier == record.identifier)
        {
            *existing = record;
            return Ok(());
        }
        if self.entries.len() >= self.capacity {
            return Err(Error::StorageFull);
        }
        self.entries.push(record);
        Ok(())
    }

    fn remove(&mut self, identifier: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|r| r.identifier != identifier);
        self.entries.len() != before
    }
}

/// In-memory store, lost on restart.
#[derive(Debug)]
pub struct MemoryPairingStore {
    records: Mutex<Records>,
}

impl MemoryPairingStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(Records {
                capacity,
                entries: Vec::new(),
            }),
        }
    }
}

#[async_trait]
impl PairingStore for MemoryPairingStore {
    async fn get(&self, identifier: &str) -> Result<Option<PairingRecord>> {
        Ok(self.records.lock().await.get(identifier))
    }

    async fn add(&self, record: PairingRecord) -> Result<()> {
        self.records.lock().await.upsert(record)
    }

    async fn insert(&self, record: PairingRecord) -> Result<()> {
        self.records.lock().await.insert(record)
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        Ok(self.records.lock().await.remove(identifier))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.lock().await.entries.len())
    }

    async fn is_full(&self) -> Result<bool> {
        let records = self.records.lock().await;
        Ok(records.entries.len() >= records.capacity)
    }
}

/// File-backed store.
///
/// One record per line: `<hex LTPK> <0|1 admin> <identifier>`. The whole file
/// is rewritten through a temporary sibling and renamed into place on every
/// change, while the lock is held.
#[derive(Debug)]
pub struct FilePairingStore {
    path: PathBuf,
    records: Mutex<Records>,
}

impl FilePairingStore {
    /// Open `path`, starting empty if it does not exist yet.
    pub async fn open(path: impl Into<PathBuf>, capacity: usize) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => parse_records(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(Error::Storage(format!("{}: {}", path.display(), e))),
        };
        tracing::debug!(path = %path.display(), count = entries.len(), "Loaded pairings");

        Ok(Self {
            path,
            records: Mutex::new(Records { capacity, entries }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `change` and persist it, rolling back if the write fails.
    async fn store(
        &self,
        record: PairingRecord,
        change: fn(&mut Records, PairingRecord) -> Result<()>,
    ) -> Result<()> {
        if record.identifier.is_empty() || record.identifier.contains('\n') {
            return Err(Error::Param(format!(
                "unstorable controller identifier {:?}",
                record.identifier
            )));
        }
        let mut records = self.records.lock().await;
        let previous = records.entries.clone();
        change(&mut records, record)?;
        if let Err(e) = self.persist(&records).await {
            records.entries = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn persist(&self, records: &Records) -> Result<()> {
        let mut contents = String::new();
        for r in &records.entries {
            contents.push_str(&format!(
                "{} {} {}\n",
                hex::encode(r.public_key),
                u8::from(r.admin),
                r.identifier
            ));
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", self.path.display(), e)))
    }
}

#[async_trait]
impl PairingStore for FilePairingStore {
    async fn get(&self, identifier: &str) -> Result<Option<PairingRecord>> {
        Ok(self.records.lock().await.get(identifier))
    }

    async fn add(&self, record: PairingRecord) -> Result<()> {
        self.store(record, Records::upsert).await
    }

    async fn insert(&self, record: PairingRecord) -> Result<()> {
        self.store(record, Records::insert).await
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        let mut records = self.records.lock().await;
        let previous = records.entries.clone();
        if !records.remove(identifier) {
            return Ok(false);
        }
        if let Err(e) = self.persist(&records).await {
            records.entries = previous;
            return Err(e);
        }
        Ok(true)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.records.lock().await.entries.len())
    }

    async fn is_full(&self) -> Result<bool> {
        let records = self.records.lock().await;
        Ok(records.entries.len() >= records.capacity)
    }
}

fn parse_records(contents: &str) -> Result<Vec<PairingRecord>> {
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(parse_record)
        .collect()
}

fn parse_record(line: &str) -> Result<PairingRecord> {
    let mut fields = line.splitn(3, ' ');
    let key_hex = fields.next().ok_or(ParseError::MissingField("public key"))?;
    let admin = fields.next().ok_or(ParseError::MissingField("permissions"))?;
    let identifier = fields.next().ok_or(ParseError::MissingField("identifier"))?;

    let public_key: [u8; 32] = hex::decode(key_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| ParseError::InvalidValue(format!("public key {:?}", key_hex)))?;
    let admin = match admin {
        "0" => false,
        "1" => true,
        other => return Err(ParseError::InvalidValue(format!("permissions {:?}", other)).into()),
    };

    Ok(PairingRecord::new(identifier, public_key, admin))
}
