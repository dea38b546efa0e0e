//! Directory-backed storage engine
//!
//! Each series lives in `<root>/<SYMBOL>/<TIMEFRAME>/<TYPE>.jsonl`, one row
//! per line. Appends are serialized through a single async lock.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::{
    ChangeSink, DurabilityBarrier, InstanceSetup, StorageEngine, StorageError, StorageFactory,
    StorageResult,
};
use crate::metrics::STORAGE_WRITES;
use crate::schema::{Row, TimeBucketKey, WriteEvent};
use crate::trigger::TriggerMatcher;

const SERIES_EXTENSION: &str = "jsonl";
const CACHE_ROWS_PER_KEY: usize = 10_000;
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

#[derive(Clone)]
pub struct LocalStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: PathBuf,
    background_sync: bool,
    wal_bypass: bool,
    sink: Option<Arc<dyn ChangeSink>>,
    catalog: RwLock<BTreeSet<TimeBucketKey>>,
    cache: Option<RwLock<HashMap<TimeBucketKey, VecDeque<Row>>>>,
    triggers: RwLock<Vec<TriggerMatcher>>,
    events: broadcast::Sender<WriteEvent>,
    barrier: Arc<DurabilityBarrier>,
    append_lock: Mutex<()>,
}

impl LocalStore {
    /// Open (creating if needed) the store under `setup.root_dir`
    pub async fn initialize(setup: InstanceSetup) -> StorageResult<Self> {
        let root = setup.root_dir.clone();
        if root.exists() && !root.is_dir() {
            return Err(StorageError::InvalidRoot {
                path: root.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }
        fs::create_dir_all(&root).await?;

        let catalog = if setup.init_catalog {
            let scan_root = root.clone();
            tokio::task::spawn_blocking(move || scan_catalog(&scan_root))
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))??
        } else {
            BTreeSet::new()
        };

        info!(
            root = %root.display(),
            series = catalog.len(),
            wal_cache = setup.init_wal_cache,
            background_sync = setup.background_sync,
            wal_bypass = setup.wal_bypass,
            replicating = setup.replication_sender.is_some(),
            "Storage initialized"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                root,
                background_sync: setup.background_sync,
                wal_bypass: setup.wal_bypass,
                sink: setup.replication_sender,
                catalog: RwLock::new(catalog),
                cache: setup.init_wal_cache.then(|| RwLock::new(HashMap::new())),
                triggers: RwLock::new(Vec::new()),
                events,
                barrier: DurabilityBarrier::new(),
                append_lock: Mutex::new(()),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    async fn accept(&self, event: WriteEvent, publish: bool) -> StorageResult<()> {
        // Entered before the flag check so shutdown waits for this append
        let guard = self.inner.barrier.enter();
        if self.inner.barrier.is_shutdown_pending() {
            return Err(StorageError::ShuttingDown(event.key.to_string()));
        }
        self.inner.append(&event).await?;
        STORAGE_WRITES.inc();

        if publish {
            if let Some(sink) = &self.inner.sink {
                sink.publish(&event);
            }
        }
        // No subscribers is fine
        let _ = self.inner.events.send(event.clone());
        self.fire_triggers(event);
        drop(guard);
        Ok(())
    }

    fn fire_triggers(&self, event: WriteEvent) {
        let matched: Vec<TriggerMatcher> = self
            .inner
            .triggers
            .read()
            .iter()
            .filter(|m| m.matches(&event.key))
            .cloned()
            .collect();
        if matched.is_empty() {
            return;
        }

        let guard = self.inner.barrier.enter();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let _guard = guard;
            for matcher in matched {
                for derived in matcher.trigger().fire(&event) {
                    if derived.rows.is_empty() {
                        continue;
                    }
                    if let Err(e) = inner.append(&derived).await {
                        warn!(
                            trigger = matcher.trigger().name(),
                            key = %derived.key,
                            error = %e,
                            "Trigger output write failed"
                        );
                        continue;
                    }
                    let _ = inner.events.send(derived);
                }
            }
        });
    }
}

impl Inner {
    fn series_path(&self, key: &TimeBucketKey) -> StorageResult<PathBuf> {
        let relative = PathBuf::from(format!("{}.{}", key.as_str(), SERIES_EXTENSION));
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    async fn append(&self, event: &WriteEvent) -> StorageResult<()> {
        let mut buffer = Vec::with_capacity(event.rows.len() * 96);
        for row in &event.rows {
            serde_json::to_writer(&mut buffer, row)?;
            buffer.push(b'\n');
        }

        let path = self.series_path(&event.key)?;
        {
            let _lock = self.append_lock.lock().await;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(&buffer).await?;

            if !self.wal_bypass {
                if self.background_sync {
                    let guard = self.barrier.enter();
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = file.sync_all().await {
                            warn!(error = %e, "Background sync failed");
                        }
                    });
                } else {
                    file.sync_all().await?;
                }
            }
        }

        self.catalog.write().insert(event.key.clone());
        if let Some(cache) = &self.cache {
            let mut cache = cache.write();
            let rows = cache.entry(event.key.clone()).or_default();
            rows.extend(event.rows.iter().cloned());
            let overflow = rows.len().saturating_sub(CACHE_ROWS_PER_KEY);
            rows.drain(..overflow);
        }
        debug!(key = %event.key, rows = event.rows.len(), "Appended rows");
        Ok(())
    }

    async fn read_tail(&self, key: &TimeBucketKey, limit: usize) -> StorageResult<Vec<Row>> {
        let path = self.series_path(key)?;
        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let rows = contents
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<Row>)
            .collect::<Result<Vec<_>, _>>()?;
        let skip = rows.len().saturating_sub(limit);
        Ok(rows.into_iter().skip(skip).collect())
    }
}

/// Walk `root` and collect every series file as a key
fn scan_catalog(root: &Path) -> std::io::Result<BTreeSet<TimeBucketKey>> {
    fn walk(root: &Path, dir: &Path, out: &mut BTreeSet<TimeBucketKey>) -> std::io::Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else if path.extension().and_then(|e| e.to_str()) == Some(SERIES_EXTENSION) {
                let key = path
                    .strip_prefix(root)
                    .ok()
                    .map(|rel| rel.with_extension(""))
                    .and_then(|rel| {
                        let parts: Vec<_> = rel
                            .components()
                            .filter_map(|c| c.as_os_str().to_str())
                            .collect();
                        TimeBucketKey::parse(&parts.join("/"))
                    });
                match key {
                    Some(key) => {
                        out.insert(key);
                    }
                    None => debug!(path = %path.display(), "Skipping unrecognized file"),
                }
            }
        }
        Ok(())
    }

    let mut keys = BTreeSet::new();
    walk(root, root, &mut keys)?;
    Ok(keys)
}

#[async_trait]
impl StorageEngine for LocalStore {
    async fn write(&self, event: WriteEvent) -> StorageResult<()> {
        self.accept(event, true).await
    }

    async fn apply_replicated(&self, event: WriteEvent) -> StorageResult<()> {
        self.accept(event, false).await
    }

    async fn query(&self, key: &TimeBucketKey, limit: usize) -> StorageResult<Vec<Row>> {
        if let Some(cache) = &self.inner.cache {
            if let Some(rows) = cache.read().get(key) {
                let skip = rows.len().saturating_sub(limit);
                return Ok(rows.iter().skip(skip).cloned().collect());
            }
        }
        self.inner.read_tail(key, limit).await
    }

    fn catalog(&self) -> Vec<TimeBucketKey> {
        self.inner.catalog.read().iter().cloned().collect()
    }

    fn register_trigger(&self, matcher: TriggerMatcher) {
        info!(pattern = matcher.pattern(), trigger = matcher.trigger().name(), "Trigger registered");
        self.inner.triggers.write().push(matcher);
    }

    fn subscribe(&self) -> broadcast::Receiver<WriteEvent> {
        self.inner.events.subscribe()
    }

    fn barrier(&self) -> Arc<DurabilityBarrier> {
        Arc::clone(&self.inner.barrier)
    }
}

/// Factory for [`LocalStore`]
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStoreFactory;

#[async_trait]
impl StorageFactory for LocalStoreFactory {
    async fn initialize(&self, setup: InstanceSetup) -> StorageResult<Arc<dyn StorageEngine>> {
        Ok(Arc::new(LocalStore::initialize(setup).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Bar, MINUTE_TIMEFRAME};
    use crate::trigger::{AggTrigger, TriggerConfig};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tempfile::TempDir;

    fn bars(epochs: &[i64]) -> WriteEvent {
        let rows = epochs
            .iter()
            .map(|&epoch| {
                Row::Bar(Bar {
                    epoch,
                    open: dec!(1),
                    high: dec!(2),
                    low: dec!(1),
                    close: dec!(2),
                    volume: dec!(100),
                })
            })
            .collect();
        WriteEvent::new(TimeBucketKey::bars("AAPL", MINUTE_TIMEFRAME), rows)
    }

    fn setup(dir: &TempDir) -> InstanceSetup {
        setup_at(dir.path())
    }

    fn setup_at(root: &Path) -> InstanceSetup {
        InstanceSetup {
            wal_bypass: true,
            ..InstanceSetup::new(root)
        }
    }

    #[tokio::test]
    async fn test_write_then_query_from_disk() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::initialize(InstanceSetup {
            init_wal_cache: false,
            ..setup(&dir)
        })
        .await
        .unwrap();

        store.write(bars(&[60, 120, 180])).await.unwrap();
        let key = TimeBucketKey::bars("AAPL", MINUTE_TIMEFRAME);
        let rows = store.query(&key, 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(&rows[1], Row::Bar(b) if b.epoch == 180));
        assert!(dir.path().join("AAPL/1Min/OHLCV.jsonl").exists());
    }

    #[tokio::test]
    async fn test_catalog_is_rebuilt_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let store = LocalStore::initialize(setup(&dir)).await.unwrap();
            store.write(bars(&[60])).await.unwrap();
        }
        let reopened = LocalStore::initialize(setup(&dir)).await.unwrap();
        assert_eq!(
            reopened.catalog(),
            vec![TimeBucketKey::bars("AAPL", MINUTE_TIMEFRAME)]
        );
    }

    #[tokio::test]
    async fn test_writes_rejected_after_shutdown_pending() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::initialize(setup(&dir)).await.unwrap();
        store.barrier().mark_shutdown_pending();
        assert!(matches!(
            store.write(bars(&[60])).await,
            Err(StorageError::ShuttingDown(_))
        ));
    }

    #[tokio::test]
    async fn test_background_sync_is_tracked_by_barrier() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::initialize(InstanceSetup::new(dir.path()))
            .await
            .unwrap();
        store.write(bars(&[60])).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), store.barrier().wait())
            .await
            .expect("background sync never finished")
            .unwrap();
        assert_eq!(store.barrier().pending(), 0);
    }

    #[tokio::test]
    async fn test_trigger_writes_aggregates() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::initialize(setup(&dir)).await.unwrap();
        let trigger = AggTrigger::new(&TriggerConfig {
            filter: None,
            destinations: vec!["5Min".into()],
        })
        .unwrap();
        store.register_trigger(TriggerMatcher::new(Arc::new(trigger), "*/1Min/OHLCV").unwrap());

        store.write(bars(&[0, 60, 120, 300])).await.unwrap();
        store.barrier().wait().await.unwrap();

        let rows = store
            .query(&TimeBucketKey::bars("AAPL", "5Min"), 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(matches!(&rows[0], Row::Bar(b) if b.volume == dec!(300)));
    }

    #[tokio::test]
    async fn test_barrier_waits_for_in_flight_append() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::initialize(InstanceSetup {
            background_sync: false,
            ..InstanceSetup::new(dir.path())
        })
        .await
        .unwrap();

        // Park the writer inside append
        let lock = store.inner.append_lock.lock().await;
        let writer = {
            let store = store.clone();
            tokio::spawn(async move { store.write(bars(&[60])).await })
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.barrier().pending() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("write never entered the barrier");

        let barrier = store.barrier();
        barrier.mark_shutdown_pending();
        let waiter = tokio::spawn(async move { barrier.wait().await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!waiter.is_finished(), "barrier drained while a write was in flight");

        drop(lock);
        writer.await.unwrap().unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("barrier never drained")
            .unwrap()
            .unwrap();
        assert!(dir.path().join("AAPL/1Min/OHLCV.jsonl").exists());
    }

    #[tokio::test]
    async fn test_escaping_key_is_rejected() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("store");
        let store = LocalStore::initialize(setup_at(&root)).await.unwrap();

        let raw = r#"{"key":"../escaped/x","rows":[]}"#;
        assert!(serde_json::from_str::<WriteEvent>(raw).is_err());

        let event = WriteEvent::new(TimeBucketKey::new("..", "escaped", "x"), Vec::new());
        assert!(matches!(
            store.write(event).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(!dir.path().join("escaped").exists());
        assert_eq!(store.barrier().pending(), 0);
    }

    #[tokio::test]
    async fn test_subscribers_see_writes() {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::initialize(setup(&dir)).await.unwrap();
        let mut rx = store.subscribe();
        store.write(bars(&[60])).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.key.as_str(), "AAPL/1Min/OHLCV");
    }
}
