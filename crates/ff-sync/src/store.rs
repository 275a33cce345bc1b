//! Rule Store
//!
//! The extension's persistent key-value record for the rule set. Reads never
//! fail: anything that cannot be read yields the fail-open default. Writes are
//! serialized, durable before they return, and announced to subscribers only
//! after they committed. Like the platform storage API, a write that leaves
//! the value unchanged announces nothing.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, PoisonError, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};

use ff_core::RuleSet;

const CHANGE_CAPACITY: usize = 64;

/// A committed write: the value it replaced and the value now stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub old: RuleSet,
    pub new: RuleSet,
}

/// Error type for rule store writes.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to write '{path}': {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("Failed to encode rule set: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Rule store is unavailable")]
    Unavailable,
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Current rule set, or the default when nothing can be read.
    async fn get(&self) -> RuleSet;

    /// Replace the whole rule set. Last write wins.
    async fn set(&self, rules: RuleSet) -> Result<(), StoreError>;

    /// Notifications for every committed change, from any writer.
    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

// =============================================================================
// Memory Store
// =============================================================================

/// In-process store. Can be switched unavailable to exercise fail-open paths.
pub struct MemoryRuleStore {
    current: Mutex<RuleSet>,
    available: AtomicBool,
    changes: broadcast::Sender<StoreChange>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::with_rules(RuleSet::default())
    }

    pub fn with_rules(rules: RuleSet) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            current: Mutex::new(rules),
            available: AtomicBool::new(true),
            changes,
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

impl Default for MemoryRuleStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn get(&self) -> RuleSet {
        if !self.available.load(Ordering::SeqCst) {
            warn!("Rule store unavailable, reading default rules");
            return RuleSet::default();
        }
        self.current.lock().await.clone()
    }

    async fn set(&self, rules: RuleSet) -> Result<(), StoreError> {
        let mut current = self.current.lock().await;
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable);
        }
        if *current == rules {
            return Ok(());
        }
        let old = std::mem::replace(&mut *current, rules.clone());
        debug!("Stored {} domains, enabled={}", rules.len(), rules.enabled);
        // No subscribers is fine
        let _ = self.changes.send(StoreChange { old, new: rules });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

// =============================================================================
// File Store
// =============================================================================

/// State every [`FileRuleStore`] on the same file shares, so that a write
/// through one instance serializes with and notifies all the others.
struct SharedFile {
    write_lock: Mutex<()>,
    changes: broadcast::Sender<StoreChange>,
}

type OpenFiles = StdMutex<HashMap<PathBuf, Weak<SharedFile>>>;

static OPEN_FILES: OnceLock<OpenFiles> = OnceLock::new();

impl SharedFile {
    fn for_path(key: PathBuf) -> Arc<Self> {
        let mut files = OPEN_FILES
            .get_or_init(OpenFiles::default)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        files.retain(|_, shared| shared.strong_count() > 0);

        if let Some(shared) = files.get(&key).and_then(Weak::upgrade) {
            return shared;
        }
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        let shared = Arc::new(Self {
            write_lock: Mutex::new(()),
            changes,
        });
        files.insert(key, Arc::downgrade(&shared));
        shared
    }
}

/// Resolve a store path to one key per file, whether or not it exists yet.
/// Missing trailing components are joined onto the deepest existing ancestor.
fn file_key(path: &Path) -> PathBuf {
    let mut missing = Vec::new();
    let mut current = path;
    loop {
        if let Ok(resolved) = std::fs::canonicalize(current) {
            return missing.iter().rev().fold(resolved, |key, name| key.join(name));
        }
        match (current.parent(), current.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                current = if parent.as_os_str().is_empty() {
                    Path::new(".")
                } else {
                    parent
                };
            }
            _ => return path.to_path_buf(),
        }
    }
}

/// JSON file store. Writes go to a sibling temp file which is synced and
/// renamed over the target, so a crash never leaves a torn file behind.
/// A missing or corrupt file reads as the default.
///
/// Instances opened on the same file within a process share their write lock
/// and change notifications. Writes by other processes are not observed.
pub struct FileRuleStore {
    path: PathBuf,
    shared: Arc<SharedFile>,
}

impl FileRuleStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let shared = SharedFile::for_path(file_key(&path));
        Self { path, shared }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read(&self) -> RuleSet {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return RuleSet::default(),
            Err(e) => {
                warn!("Failed to read '{}': {}, using default rules", self.path.display(), e);
                return RuleSet::default();
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(rules) => rules,
            Err(e) => {
                warn!("Corrupt rule file '{}': {}, using default rules", self.path.display(), e);
                RuleSet::default()
            }
        }
    }

    async fn write(&self, rules: &RuleSet) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error(parent))?;
        }

        let bytes = serde_json::to_vec_pretty(rules)?;
        let tmp = self.path.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp).await.map_err(io_error(&tmp))?;
        file.write_all(&bytes).await.map_err(io_error(&tmp))?;
        file.sync_all().await.map_err(io_error(&tmp))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await.map_err(io_error(&self.path))?;
        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.display().to_string();
    move |source| StoreError::Io { path, source }
}

#[async_trait]
impl RuleStore for FileRuleStore {
    async fn get(&self) -> RuleSet {
        self.read().await
    }

    async fn set(&self, rules: RuleSet) -> Result<(), StoreError> {
        let _guard = self.shared.write_lock.lock().await;
        let old = self.read().await;
        if old == rules {
            return Ok(());
        }
        self.write(&rules).await?;
        debug!("Wrote {} domains to '{}'", rules.len(), self.path.display());
        let _ = self.shared.changes.send(StoreChange { old, new: rules });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.shared.changes.subscribe()
    }
}
