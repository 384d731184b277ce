// MIT License - Copyright (c) 2026 Peter Wright
// Durable last-seen timestamps with periodic atomic flush

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::domain::Domain;
use crate::error::{BridgeError, Result};

type Entries = BTreeMap<String, DateTime<Utc>>;

fn key(domain: Domain, id: &str) -> String {
    format!("{}/{}", domain, id)
}

fn parse_key(key: &str) -> Option<(Domain, &str)> {
    let (domain, id) = key.split_once('/')?;
    Some((domain.parse().ok()?, id))
}

fn keep_latest(map: &mut Entries, key: String, at: DateTime<Utc>) {
    map.entry(key)
        .and_modify(|existing| {
            if at > *existing {
                *existing = at;
            }
        })
        .or_insert(at);
}

#[derive(Debug, Default)]
struct StoreState {
    /// What is (or is about to be) on disk
    persisted: Entries,
    /// Changes not yet flushed
    dirty: Entries,
}

/// Last-seen timestamps keyed by `domain/normalized_id`, flushed to a JSON
/// file by atomic replace.
#[derive(Debug)]
pub struct LastSeenStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    flush_lock: tokio::sync::Mutex<()>,
}

impl LastSeenStore {
    /// An empty store that will write to `path`.
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: Mutex::new(StoreState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Load the store file. A missing file is an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self::empty(path);
        let text = match fs::read_to_string(&store.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("no last-seen store at {}, starting empty", store.path.display());
                return Ok(store);
            }
            Err(e) => return Err(e.into()),
        };
        let entries: Entries = serde_json::from_str(&text).map_err(|e| BridgeError::Persistence {
            details: format!("unreadable last-seen store {}: {}", store.path.display(), e),
        })?;
        info!("loaded {} last-seen entries from {}", entries.len(), store.path.display());
        store.state.lock().persisted = entries;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All known entries, for seeding the snapshot at startup.
    pub fn entries(&self) -> Vec<(Domain, String, DateTime<Utc>)> {
        let state = self.state.lock();
        let mut merged = state.persisted.clone();
        for (k, at) in &state.dirty {
            keep_latest(&mut merged, k.clone(), *at);
        }
        drop(state);
        merged
            .into_iter()
            .filter_map(|(k, at)| match parse_key(&k) {
                Some((domain, id)) => Some((domain, id.to_string(), at)),
                None => {
                    warn!("ignoring last-seen entry with bad key {:?}", k);
                    None
                }
            })
            .collect()
    }

    pub fn get(&self, domain: Domain, id: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock();
        let k = key(domain, id);
        match (state.persisted.get(&k), state.dirty.get(&k)) {
            (Some(a), Some(b)) => Some(*a.max(b)),
            (a, b) => a.or(b).copied(),
        }
    }

    /// Record a known timestamp without scheduling a write.
    pub fn seed(&self, domain: Domain, id: &str, at: DateTime<Utc>) {
        keep_latest(&mut self.state.lock().persisted, key(domain, id), at);
    }

    /// Schedule a timestamp for the next flush.
    pub fn mark_dirty(&self, domain: Domain, id: &str, at: DateTime<Utc>) {
        keep_latest(&mut self.state.lock().dirty, key(domain, id), at);
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    /// Write pending changes to disk. Returns how many entries were flushed.
    ///
    /// On failure the pending entries are kept for the next attempt.
    pub async fn flush(&self) -> Result<usize> {
        let _serialized = self.flush_lock.lock().await;

        let (taken, merged) = {
            let mut state = self.state.lock();
            if state.dirty.is_empty() {
                return Ok(0);
            }
            let taken = std::mem::take(&mut state.dirty);
            let mut merged = state.persisted.clone();
            for (k, at) in &taken {
                keep_latest(&mut merged, k.clone(), *at);
            }
            (taken, merged)
        };

        let path = self.path.clone();
        let data = serde_json::to_vec_pretty(&merged)?;
        let written = tokio::task::spawn_blocking(move || atomic_write(&path, &data))
            .await
            .map_err(|e| BridgeError::Persistence {
                details: format!("flush task failed: {}", e),
            })
            .and_then(|r| r);

        let mut state = self.state.lock();
        match written {
            Ok(()) => {
                for (k, at) in merged {
                    keep_latest(&mut state.persisted, k, at);
                }
                debug!("flushed {} last-seen entries", taken.len());
                Ok(taken.len())
            }
            Err(e) => {
                for (k, at) in taken {
                    keep_latest(&mut state.dirty, k, at);
                }
                Err(e)
            }
        }
    }

    /// Flush every `interval` until `shutdown` flips, then flush once more.
    pub async fn run_flusher(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("last-seen flush failed, will retry: {}", e);
                    }
                }
                _ = stopped(&mut shutdown) => break,
            }
        }
        if let Err(e) = self.flush().await {
            error!("final last-seen flush failed: {}", e);
        }
    }
}

async fn stopped(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|s| *s).await;
}

/// Write to a temp file in the same directory, sync it, then rename over `path`.
fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut temp = tempfile::NamedTempFile::new_in(dir).map_err(|e| BridgeError::Persistence {
        details: format!("failed to create temp file in {}: {}", dir.display(), e),
    })?;
    temp.as_file_mut()
        .write_all(data)
        .and_then(|()| temp.as_file().sync_all())
        .map_err(|e| BridgeError::Persistence {
            details: format!("failed to write last-seen temp file: {}", e),
        })?;
    temp.persist(path).map_err(|e| BridgeError::Persistence {
        details: format!("failed to persist last-seen store to {}: {}", path.display(), e),
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LastSeenStore::load(dir.path().join("last_seen.json")).unwrap();
        assert!(store.entries().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_seen.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            LastSeenStore::load(&path),
            Err(BridgeError::Persistence { .. })
        ));
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_seen.json");
        let store = LastSeenStore::load(&path).unwrap();
        store.mark_dirty(Domain::Zones, "1", ts(10));
        store.mark_dirty(Domain::Outputs, "2", ts(20));
        assert_eq!(store.flush().await.unwrap(), 2);
        assert_eq!(store.pending_count(), 0);
        assert_eq!(store.flush().await.unwrap(), 0);

        let reloaded = LastSeenStore::load(&path).unwrap();
        assert_eq!(reloaded.get(Domain::Zones, "1"), Some(ts(10)));
        let mut entries = reloaded.entries();
        entries.sort();
        assert_eq!(entries[0], (Domain::Zones, "1".to_string(), ts(10)));
    }

    #[tokio::test]
    async fn test_flush_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_seen.json");
        let store = LastSeenStore::empty(&path);
        store.seed(Domain::Zones, "1", ts(100));
        store.mark_dirty(Domain::Zones, "1", ts(50));
        store.flush().await.unwrap();
        assert_eq!(LastSeenStore::load(&path).unwrap().get(Domain::Zones, "1"), Some(ts(100)));
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_pending() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes persist fail
        let path = dir.path().join("occupied");
        fs::create_dir(&path).unwrap();
        let store = LastSeenStore::empty(&path);
        store.mark_dirty(Domain::Zones, "1", ts(1));
        assert!(store.flush().await.is_err());
        assert_eq!(store.pending_count(), 1);
        assert_eq!(store.get(Domain::Zones, "1"), Some(ts(1)));
    }

    #[test]
    fn test_flusher_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let store = Arc::new(LastSeenStore::empty("last_seen.json"));
        let (_tx, rx) = watch::channel(false);
        let flusher = store.run_flusher(Duration::from_secs(1), rx);
        assert_send(&flusher);
    }

    #[test]
    fn test_atomic_write_replaces_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_seen.json");
        fs::write(&path, "a much longer previous content that must not survive").unwrap();
        atomic_write(&path, b"{}").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("last_seen.json")]);
    }

    #[tokio::test]
    async fn test_flusher_final_flush_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("last_seen.json");
        let store = Arc::new(LastSeenStore::empty(&path));
        let (tx, rx) = watch::channel(false);
        let flusher = tokio::spawn(store.clone().run_flusher(Duration::from_secs(3600), rx));

        store.mark_dirty(Domain::Accounts, "3", ts(5));
        tx.send_replace(true);
        flusher.await.unwrap();
        assert_eq!(LastSeenStore::load(&path).unwrap().get(Domain::Accounts, "3"), Some(ts(5)));
    }

    #[test]
    fn test_bad_keys_ignored() {
        let store = LastSeenStore::empty("unused.json");
        store.seed(Domain::Zones, "1", ts(0));
        store.state.lock().persisted.insert("garage/1".to_string(), ts(0));
        assert_eq!(store.entries().len(), 1);
    }
}
