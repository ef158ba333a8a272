//! Persisted set of topic suffixes the listener subscribes to.
//!
//! The backing file holds one suffix per line, without the namespace prefix. Blank
//! lines are ignored and a missing file means "no subscriptions". Every successful
//! mutation is written through (temp file + fsync + rename) before the caller issues
//! the broker subscribe/unsubscribe, so a crash between the two heals on restart.
//! A write only touches the affected suffix: an add appends one line, a remove drops
//! that suffix's lines, and every other line (blank ones included) stays where it was.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Namespace value that disables topic prefixing.
pub const NULL_NAMESPACE: &str = "null";

/// True when `namespace` contributes no topic prefix (`null` or empty).
pub fn is_unprefixed(namespace: &str) -> bool {
    namespace.is_empty() || namespace == NULL_NAMESPACE
}

/// Join `namespace` and `suffix` into a topic, honouring the null namespace.
pub fn namespaced(namespace: &str, suffix: &str) -> String {
    if is_unprefixed(namespace) {
        suffix.to_string()
    } else {
        format!("{namespace}/{suffix}")
    }
}

/// A topic suffix as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription(String);

impl Subscription {
    /// Validate and wrap a suffix. Surrounding whitespace is trimmed.
    pub fn new(suffix: impl AsRef<str>) -> Result<Self, StoreError> {
        let suffix = suffix.as_ref().trim();
        if suffix.is_empty() || suffix.contains(['\n', '\r']) {
            return Err(StoreError::InvalidTopic(suffix.to_string()));
        }
        Ok(Self(suffix.to_string()))
    }

    pub fn suffix(&self) -> &str {
        &self.0
    }

    /// The topic actually subscribed on the broker: `namespace/suffix`.
    pub fn topic(&self, namespace: &str) -> String {
        namespaced(namespace, &self.0)
    }
}

impl std::fmt::Display for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Added,
    AlreadyPresent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotPresent,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid topic suffix: {0:?}")]
    InvalidTopic(String),

    #[error("failed to read subscriptions from {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to persist subscriptions to {path}: {source}")]
    Persist { path: PathBuf, source: io::Error },
}

/// Subscription list with write-through persistence.
///
/// Without a path the store lives in memory only (subscription file disabled).
#[derive(Debug)]
pub struct SubscriptionStore {
    path: Option<PathBuf>,
    entries: Vec<Subscription>,
    /// File lines as last read or written, blank and duplicate lines included.
    lines: Vec<String>,
}

impl SubscriptionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            entries: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Vec::new(),
            lines: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current subscriptions in file order.
    pub fn entries(&self) -> &[Subscription] {
        &self.entries
    }

    pub fn contains(&self, subscription: &Subscription) -> bool {
        self.entries.contains(subscription)
    }

    /// Read the backing file, replacing the in-memory set.
    pub fn load(&mut self) -> Result<Vec<Subscription>, StoreError> {
        let Some(path) = self.path.clone() else {
            tracing::info!("No subscription file configured, no topics are subscribed");
            self.entries.clear();
            self.lines.clear();
            return Ok(Vec::new());
        };

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    "Subscription file not found, no topics are subscribed"
                );
                self.entries.clear();
                self.lines.clear();
                return Ok(Vec::new());
            }
            Err(source) => return Err(StoreError::Read { path, source }),
        };

        let mut entries: Vec<Subscription> = Vec::new();
        for line in content.lines() {
            let Ok(subscription) = Subscription::new(line) else {
                continue;
            };
            if !entries.contains(&subscription) {
                entries.push(subscription);
            }
        }

        if entries.is_empty() {
            tracing::warn!(path = %path.display(), "Subscription file empty, no topics are subscribed");
        } else {
            tracing::info!(path = %path.display(), count = entries.len(), "Subscriptions loaded");
        }

        self.entries = entries.clone();
        self.lines = content.lines().map(str::to_string).collect();
        Ok(entries)
    }

    /// Add a suffix. An already-present suffix leaves storage untouched.
    pub fn add(&mut self, subscription: &Subscription) -> Result<AddOutcome, StoreError> {
        if self.contains(subscription) {
            return Ok(AddOutcome::AlreadyPresent);
        }

        self.entries.push(subscription.clone());
        self.lines.push(subscription.suffix().to_string());
        if let Err(e) = self.persist() {
            self.entries.pop();
            self.lines.pop();
            return Err(e);
        }
        Ok(AddOutcome::Added)
    }

    /// Remove a suffix. An absent suffix leaves storage untouched.
    pub fn remove(&mut self, subscription: &Subscription) -> Result<RemoveOutcome, StoreError> {
        let Some(index) = self.entries.iter().position(|s| s == subscription) else {
            return Ok(RemoveOutcome::NotPresent);
        };

        let removed = self.entries.remove(index);
        let previous_lines = self.lines.clone();
        self.lines.retain(|line| line.trim() != removed.suffix());
        if let Err(e) = self.persist() {
            self.entries.insert(index, removed);
            self.lines = previous_lines;
            return Err(e);
        }
        Ok(RemoveOutcome::Removed)
    }

    fn persist(&self) -> Result<(), StoreError> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };

        let mut content = String::new();
        for line in &self.lines {
            content.push_str(line);
            content.push('\n');
        }

        write_atomically(path, content.as_bytes()).map_err(|source| StoreError::Persist {
            path: path.clone(),
            source,
        })?;
        tracing::debug!(path = %path.display(), count = self.entries.len(), "Subscriptions persisted");
        Ok(())
    }
}

fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(content)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(s: &str) -> Subscription {
        Subscription::new(s).unwrap()
    }

    fn store_with(content: Option<&str>) -> (tempfile::TempDir, SubscriptionStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subscriptions.txt");
        if let Some(content) = content {
            fs::write(&path, content).unwrap();
        }
        (dir, SubscriptionStore::new(path))
    }

    fn read(store: &SubscriptionStore) -> String {
        fs::read_to_string(store.path().unwrap()).unwrap()
    }

    #[test]
    fn topic_prefixes_namespace() {
        assert_eq!(sub("tick").topic("default"), "default/tick");
        assert_eq!(sub("a/b").topic("ns"), "ns/a/b");
    }

    #[test]
    fn null_namespace_is_not_prefixed() {
        assert_eq!(sub("tick").topic(NULL_NAMESPACE), "tick");
        assert_eq!(namespaced("", "log"), "log");
        assert_eq!(namespaced("default", "log"), "default/log");
    }

    #[test]
    fn rejects_blank_suffix() {
        assert!(matches!(
            Subscription::new("   "),
            Err(StoreError::InvalidTopic(_))
        ));
    }

    #[test]
    fn missing_file_loads_empty() {
        let (_dir, mut store) = store_with(None);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn load_skips_blank_lines_and_duplicates() {
        let (_dir, mut store) = store_with(Some("tick\n\n  tock  \ntick\n\n"));
        let loaded = store.load().unwrap();
        assert_eq!(loaded, vec![sub("tick"), sub("tock")]);
    }

    #[test]
    fn add_persists_before_returning() {
        let (_dir, mut store) = store_with(Some("tick\n"));
        store.load().unwrap();

        assert_eq!(store.add(&sub("tock")).unwrap(), AddOutcome::Added);
        assert_eq!(read(&store), "tick\ntock\n");
    }

    #[test]
    fn add_creates_missing_file() {
        let (_dir, mut store) = store_with(None);
        store.load().unwrap();

        assert_eq!(store.add(&sub("tick")).unwrap(), AddOutcome::Added);
        assert_eq!(read(&store), "tick\n");
    }

    #[test]
    fn duplicate_add_leaves_file_untouched() {
        let (_dir, mut store) = store_with(Some("tick\n\ntock\n"));
        store.load().unwrap();

        assert_eq!(store.add(&sub("tick")).unwrap(), AddOutcome::AlreadyPresent);
        assert_eq!(read(&store), "tick\n\ntock\n");
    }

    #[test]
    fn absent_remove_leaves_file_untouched() {
        let (_dir, mut store) = store_with(Some("tick\n\n"));
        store.load().unwrap();

        assert_eq!(store.remove(&sub("tock")).unwrap(), RemoveOutcome::NotPresent);
        assert_eq!(read(&store), "tick\n\n");
    }

    #[test]
    fn mutations_keep_other_lines_in_place() {
        let (_dir, mut store) = store_with(Some("tick\n\n  tock\ntick\n\nlast\n"));
        store.load().unwrap();

        assert_eq!(store.add(&sub("tack")).unwrap(), AddOutcome::Added);
        assert_eq!(read(&store), "tick\n\n  tock\ntick\n\nlast\ntack\n");

        assert_eq!(store.remove(&sub("tick")).unwrap(), RemoveOutcome::Removed);
        assert_eq!(read(&store), "\n  tock\n\nlast\ntack\n");

        assert_eq!(store.remove(&sub("tock")).unwrap(), RemoveOutcome::Removed);
        assert_eq!(read(&store), "\n\nlast\ntack\n");
    }

    #[test]
    fn remove_preserves_order_of_the_rest() {
        let (_dir, mut store) = store_with(Some("a\nb\nc\n"));
        store.load().unwrap();

        assert_eq!(store.remove(&sub("b")).unwrap(), RemoveOutcome::Removed);
        assert_eq!(read(&store), "a\nc\n");
    }

    #[test]
    fn sequence_of_operations_matches_set_semantics() {
        let (_dir, mut store) = store_with(Some("a\nb\n"));
        store.load().unwrap();

        store.add(&sub("c")).unwrap();
        store.add(&sub("a")).unwrap();
        store.remove(&sub("x")).unwrap();
        store.remove(&sub("b")).unwrap();
        store.add(&sub("d")).unwrap();
        store.remove(&sub("c")).unwrap();
        store.add(&sub("c")).unwrap();

        assert_eq!(read(&store), "a\nd\nc\n");

        let mut reloaded = SubscriptionStore::new(store.path().unwrap());
        assert_eq!(reloaded.load().unwrap(), vec![sub("a"), sub("d"), sub("c")]);
    }

    #[test]
    fn failed_persist_rolls_back_memory() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = SubscriptionStore::new(dir.path().join("missing-dir").join("subs.txt"));
        store.load().unwrap();

        assert!(matches!(
            store.add(&sub("tick")),
            Err(StoreError::Persist { .. })
        ));
        assert!(store.entries().is_empty());
    }

    #[test]
    fn in_memory_store_tracks_without_disk() {
        let mut store = SubscriptionStore::in_memory();
        assert!(store.load().unwrap().is_empty());
        assert_eq!(store.add(&sub("tick")).unwrap(), AddOutcome::Added);
        assert_eq!(store.remove(&sub("tick")).unwrap(), RemoveOutcome::Removed);
    }
}
