//! Persistent postal cache.
//!
//! The cache file is a flat JSON object mapping `street|city|REGION` keys to
//! [`CacheEntry`] objects. It is loaded fully into memory when the cache is
//! opened and rewritten wholesale on [`PostalCache::save`].
//!
//! A single actor task owns the map. [`PostalCache`] handles are cheap to
//! clone and talk to the actor over a channel, so concurrent workers never
//! race on the map or the file.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use recordfill_shared::{CacheEntry, CacheKey, RecordfillError, Result};

/// Commands queued before senders wait on the actor.
const CHANNEL_CAPACITY: usize = 64;

enum Command {
    Get {
        key: CacheKey,
        reply: oneshot::Sender<Option<CacheEntry>>,
    },
    Put {
        key: CacheKey,
        entry: CacheEntry,
        reply: oneshot::Sender<()>,
    },
    Save {
        reply: oneshot::Sender<Result<bool>>,
    },
    Len {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to the cache actor.
#[derive(Debug, Clone)]
pub struct PostalCache {
    tx: mpsc::Sender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Get { .. } => "Get",
            Command::Put { .. } => "Put",
            Command::Save { .. } => "Save",
            Command::Len { .. } => "Len",
        };
        f.write_str(name)
    }
}

impl PostalCache {
    /// Load the cache file at `path` (missing file means empty) and start
    /// the actor. Must be called inside a tokio runtime.
    pub async fn open(path: &Path) -> Result<Self> {
        let entries = load_entries(path).await?;
        info!(path = %path.display(), entries = entries.len(), "postal cache loaded");
        Ok(Self::spawn(entries, Some(path.to_path_buf())))
    }

    /// A cache that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self::spawn(HashMap::new(), None)
    }

    fn spawn(entries: HashMap<CacheKey, CacheEntry>, path: Option<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let actor = CacheActor {
            entries,
            path,
            dirty: false,
        };
        tokio::spawn(actor.run(rx));
        Self { tx }
    }

    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            key: key.clone(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| closed())
    }

    /// Insert or replace the entry for `key`. Not persisted until [`save`](Self::save).
    pub async fn put(&self, key: CacheKey, entry: CacheEntry) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Put { key, entry, reply }).await?;
        rx.await.map_err(|_| closed())
    }

    /// Rewrite the cache file if anything changed since the last save.
    ///
    /// Returns whether a write happened. Write failures are fatal to a run.
    pub async fn save(&self) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Save { reply }).await?;
        rx.await.map_err(|_| closed())?
    }

    pub async fn len(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Len { reply }).await?;
        rx.await.map_err(|_| closed())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    async fn send(&self, command: Command) -> Result<()> {
        self.tx.send(command).await.map_err(|_| closed())
    }
}

fn closed() -> RecordfillError {
    RecordfillError::Cache("cache actor stopped".into())
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

struct CacheActor {
    entries: HashMap<CacheKey, CacheEntry>,
    path: Option<PathBuf>,
    dirty: bool,
}

impl CacheActor {
    /// Serve commands until every handle is dropped.
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Get { key, reply } => {
                    let _ = reply.send(self.entries.get(&key).cloned());
                }
                Command::Put { key, entry, reply } => {
                    debug!(%key, found = entry.is_found(), "cache put");
                    self.entries.insert(key, entry);
                    self.dirty = true;
                    let _ = reply.send(());
                }
                Command::Save { reply } => {
                    let _ = reply.send(self.save().await);
                }
                Command::Len { reply } => {
                    let _ = reply.send(self.entries.len());
                }
            }
        }

        if self.dirty {
            if let Err(e) = self.save().await {
                warn!(error = %e, "final cache save failed");
            }
        }
        debug!("cache actor stopped");
    }

    async fn save(&mut self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty {
            return Ok(false);
        }
        write_entries(path, &self.entries).await?;
        self.dirty = false;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// Read the cache file. A missing file is an empty cache; malformed keys are
/// skipped; an unparseable file is an error.
pub async fn load_entries(path: &Path) -> Result<HashMap<CacheKey, CacheEntry>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(e) => return Err(RecordfillError::io(path, e)),
    };
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let stored: BTreeMap<String, CacheEntry> = serde_json::from_str(&raw)
        .map_err(|e| RecordfillError::Cache(format!("{}: {e}", path.display())))?;

    let mut entries = HashMap::with_capacity(stored.len());
    for (key, entry) in stored {
        match key.parse::<CacheKey>() {
            Ok(key) => {
                entries.insert(key, entry);
            }
            Err(e) => warn!(error = %e, "skipping cache entry"),
        }
    }
    Ok(entries)
}

/// Rewrite the whole cache file through a sibling temp file and a rename.
pub async fn write_entries(path: &Path, entries: &HashMap<CacheKey, CacheEntry>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| RecordfillError::io(parent, e))?;
        }
    }

    // Sorted keys keep the file diffable.
    let stored: BTreeMap<String, &CacheEntry> =
        entries.iter().map(|(k, v)| (k.to_string(), v)).collect();
    let json = serde_json::to_string_pretty(&stored)
        .map_err(|e| RecordfillError::Cache(format!("serialize cache: {e}")))?;

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| RecordfillError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| RecordfillError::io(path, e))?;
    debug!(path = %path.display(), entries = entries.len(), "postal cache saved");
    Ok(())
}
