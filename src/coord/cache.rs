use crate::coord::client::{CoordClient, CoordClientFactory, CoordError, NodeStat};
use crate::coord::watch::{SessionEventKind, WatchChannel, WatchEvent, Watcher};
use crate::retry::Backoff;
use crate::telemetry::{shared_registry, MetricsSnapshot, SharedMetricsRegistry};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// The three per-path slots. An entry holding `None` is a cached absence,
/// distinct from a missing entry ("not yet queried").
#[derive(Default)]
struct Slots {
    data: HashMap<String, Option<Vec<u8>>>,
    stats: HashMap<String, Option<NodeStat>>,
    children: HashMap<String, Option<Vec<String>>>,
}

impl Slots {
    fn put_data(&mut self, path: &str, data: Option<Vec<u8>>, stat: Option<NodeStat>) {
        self.data.insert(path.to_string(), data);
        self.stats.insert(path.to_string(), stat);
    }

    fn remove(&mut self, path: &str) {
        self.data.remove(path);
        self.stats.remove(path);
        self.children.remove(path);
    }

    fn clear(&mut self) {
        self.data.clear();
        self.stats.clear();
        self.children.clear();
    }

    fn clear_prefix(&mut self, prefix: &str) {
        self.data.retain(|path, _| !path.starts_with(prefix));
        self.stats.retain(|path, _| !path.starts_with(prefix));
        self.children.retain(|path, _| !path.starts_with(prefix));
    }
}

/// Why a populating attempt must go around the retry loop again.
enum RetrySignal {
    Coord(CoordError),
    /// The node was deleted or mutated between the `exists` probe and the
    /// read that followed. Never cached.
    ConcurrentModification,
}

/// Process-local cache of immutable snapshots of coordination paths, kept
/// coherent by watch events.
///
/// Every populating read arms a watch on the path it observes, so a cached
/// value (including a cached absence) stays valid until the store notifies
/// otherwise. The cache is coupled 1:1 to a session; session loss clears
/// every slot.
pub struct CoordCache {
    client: Arc<dyn CoordClient>,
    channel: Arc<WatchChannel>,
    state: Mutex<Slots>,
    sleeper: Condvar,
    metrics: SharedMetricsRegistry,
}

struct CacheEventHandler {
    cache: Weak<CoordCache>,
}

impl Watcher for CacheEventHandler {
    fn process(&self, event: &WatchEvent) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        match event {
            WatchEvent::Node { path, .. } => cache.remove(path),
            WatchEvent::Session(SessionEventKind::Disconnected) => {
                trace!("event=coord_session_disconnected action=clear");
                cache.clear();
            }
            WatchEvent::Session(SessionEventKind::Expired) => {
                trace!("event=coord_session_expired action=clear");
                cache.clear();
            }
            // Re-arming happens on the next populating read.
            WatchEvent::Session(SessionEventKind::Connected) => {}
        }
    }
}

impl CoordCache {
    /// Builds a cache over `client`, registering its event handler on
    /// `channel` first so a chained external watcher observes every event
    /// after the cache has reacted to it.
    pub fn new(
        client: Arc<dyn CoordClient>,
        channel: Arc<WatchChannel>,
        external: Option<Arc<dyn Watcher>>,
    ) -> Arc<CoordCache> {
        let cache = Arc::new(CoordCache {
            client,
            channel: Arc::clone(&channel),
            state: Mutex::new(Slots::default()),
            sleeper: Condvar::new(),
            metrics: shared_registry("tessera.coord"),
        });
        channel.register(Arc::new(CacheEventHandler {
            cache: Arc::downgrade(&cache),
        }));
        if let Some(watcher) = external {
            channel.register(watcher);
        }
        cache
    }

    pub fn channel(&self) -> &Arc<WatchChannel> {
        &self.channel
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.lock().snapshot()
    }

    /// Cached bytes for `path`, or a cached absence. Populates on miss and
    /// answers locally until an event invalidates the slot.
    pub fn get_data(&self, path: &str) -> Option<Vec<u8>> {
        let mut slots = self.state.lock();
        self.note_lookup(slots.data.contains_key(path));
        self.populate_data(&mut slots, path);
        slots.data.get(path).cloned().flatten()
    }

    /// As `get_data`, plus a defensive copy of the stat block.
    pub fn get_data_with_stat(&self, path: &str) -> (Option<Vec<u8>>, Option<NodeStat>) {
        let mut slots = self.state.lock();
        self.note_lookup(slots.data.contains_key(path));
        self.populate_data(&mut slots, path);
        (
            slots.data.get(path).cloned().flatten(),
            slots.stats.get(path).cloned().flatten(),
        )
    }

    /// Cached child names for `path`, or a cached absence.
    pub fn get_children(&self, path: &str) -> Option<Vec<String>> {
        let mut slots = self.state.lock();
        self.note_lookup(slots.children.contains_key(path));
        let mut backoff = Backoff::new();
        loop {
            if slots.children.contains_key(path) {
                break;
            }
            match self.try_populate_children(&mut slots, path) {
                Ok(()) => break,
                Err(signal) => self.sleep_for_retry(&mut slots, path, signal, &mut backoff),
            }
        }
        slots.children.get(path).cloned().flatten()
    }

    pub fn clear(&self) {
        self.state.lock().clear();
    }

    /// Drops every slot whose path starts with `prefix`.
    pub fn clear_prefix(&self, prefix: &str) {
        self.state.lock().clear_prefix(prefix);
    }

    fn remove(&self, path: &str) {
        trace!("event=coord_cache_evict path={path}");
        self.state.lock().remove(path);
        self.metrics.lock().inc_counter("evictions", 1);
    }

    fn populate_data(&self, slots: &mut MutexGuard<'_, Slots>, path: &str) {
        let mut backoff = Backoff::new();
        loop {
            if slots.data.contains_key(path) {
                return;
            }
            match self.try_populate_data(slots, path) {
                Ok(()) => return,
                Err(signal) => self.sleep_for_retry(slots, path, signal, &mut backoff),
            }
        }
    }

    fn try_populate_data(&self, slots: &mut Slots, path: &str) -> Result<(), RetrySignal> {
        // The probe is what makes negative caching safe: it arms a watch even
        // when the node does not exist, so a later creation evicts the slot.
        let probe = self
            .client
            .exists(path, true)
            .map_err(RetrySignal::Coord)?;
        match probe {
            None => {
                trace!("event=coord_cache_absent path={path}");
                slots.put_data(path, None, None);
            }
            Some(stat) => match self.client.get_data(path, true, Some(stat.version)) {
                Ok((data, fresh_stat)) => {
                    trace!("event=coord_cache_fill path={path} bytes={}", data.len());
                    slots.put_data(path, Some(data), Some(fresh_stat));
                }
                Err(CoordError::BadVersion(_)) | Err(CoordError::NoNode(_)) => {
                    return Err(RetrySignal::ConcurrentModification);
                }
                Err(err) => return Err(RetrySignal::Coord(err)),
            },
        }
        Ok(())
    }

    fn try_populate_children(&self, slots: &mut Slots, path: &str) -> Result<(), RetrySignal> {
        match self.client.get_children(path, true) {
            Ok(children) => {
                slots.children.insert(path.to_string(), Some(children));
                Ok(())
            }
            Err(CoordError::NoNode(_)) => {
                // Absence may only be cached off an exists probe, which arms
                // the watch a bare children read on a missing node cannot.
                match self.client.exists(path, true).map_err(RetrySignal::Coord)? {
                    None => {
                        slots.children.insert(path.to_string(), None);
                        Ok(())
                    }
                    Some(_) => Err(RetrySignal::ConcurrentModification),
                }
            }
            Err(err) => Err(RetrySignal::Coord(err)),
        }
    }

    /// Sleeps out one backoff step with the map lock released, so watch
    /// events and other callers make progress while this caller waits.
    fn sleep_for_retry(
        &self,
        slots: &mut MutexGuard<'_, Slots>,
        path: &str,
        signal: RetrySignal,
        backoff: &mut Backoff,
    ) {
        match signal {
            RetrySignal::ConcurrentModification => {
                debug!("event=coord_concurrent_modification path={path}")
            }
            RetrySignal::Coord(err) if err.is_transient() => {
                debug!("event=coord_retry path={path} error={err}")
            }
            RetrySignal::Coord(err) => warn!("event=coord_retry path={path} error={err}"),
        }
        let delay = backoff.next_delay();
        let _ = self.sleeper.wait_for(slots, delay);
    }

    fn note_lookup(&self, hit: bool) {
        let mut metrics = self.metrics.lock();
        if hit {
            metrics.inc_counter("hits", 1);
        } else {
            metrics.inc_counter("misses", 1);
        }
    }
}

/// Process-scoped map from `(connect string, session timeout)` to a shared
/// cache instance. The first request constructs; later requests return the
/// extant instance. Instances are never evicted.
pub struct CacheRegistry {
    factory: Arc<dyn CoordClientFactory>,
    instances: Mutex<HashMap<(String, u64), Arc<CoordCache>>>,
}

impl CacheRegistry {
    pub fn new(factory: Arc<dyn CoordClientFactory>) -> Self {
        Self {
            factory,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(
        &self,
        connect: &str,
        session_timeout: Duration,
    ) -> Result<Arc<CoordCache>, CoordError> {
        let key = (connect.to_string(), session_timeout.as_millis() as u64);
        let mut instances = self.instances.lock();
        if let Some(cache) = instances.get(&key) {
            return Ok(Arc::clone(cache));
        }
        let channel = WatchChannel::new();
        let client = self.factory.connect(connect, session_timeout, &channel)?;
        let cache = CoordCache::new(client, channel, None);
        instances.insert(key, Arc::clone(&cache));
        Ok(cache)
    }

    pub fn len(&self) -> usize {
        self.instances.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::watch::NodeEventKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted store: a fixed node map plus per-call counters and an
    /// optional one-shot failure on the first data read.
    struct StubClient {
        nodes: Mutex<HashMap<String, (Vec<u8>, NodeStat)>>,
        exists_calls: AtomicUsize,
        get_data_calls: AtomicUsize,
        get_children_calls: AtomicUsize,
        fail_first_get_data: AtomicUsize,
    }

    impl StubClient {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                nodes: Mutex::new(HashMap::new()),
                exists_calls: AtomicUsize::new(0),
                get_data_calls: AtomicUsize::new(0),
                get_children_calls: AtomicUsize::new(0),
                fail_first_get_data: AtomicUsize::new(0),
            })
        }

        fn insert(&self, path: &str, data: &[u8], version: i64) {
            let stat = NodeStat {
                version,
                data_length: data.len() as u32,
                ..NodeStat::default()
            };
            self.nodes
                .lock()
                .insert(path.to_string(), (data.to_vec(), stat));
        }
    }

    impl CoordClient for StubClient {
        fn exists(&self, path: &str, _watch: bool) -> Result<Option<NodeStat>, CoordError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.nodes.lock().get(path).map(|(_, stat)| stat.clone()))
        }

        fn get_data(
            &self,
            path: &str,
            _watch: bool,
            version_bound: Option<i64>,
        ) -> Result<(Vec<u8>, NodeStat), CoordError> {
            self.get_data_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first_get_data.load(Ordering::SeqCst) > 0 {
                self.fail_first_get_data.fetch_sub(1, Ordering::SeqCst);
                return Err(CoordError::BadVersion(path.to_string()));
            }
            let nodes = self.nodes.lock();
            let (data, stat) = nodes
                .get(path)
                .ok_or_else(|| CoordError::NoNode(path.to_string()))?;
            if let Some(bound) = version_bound {
                if bound != stat.version {
                    return Err(CoordError::BadVersion(path.to_string()));
                }
            }
            Ok((data.clone(), stat.clone()))
        }

        fn get_children(&self, path: &str, _watch: bool) -> Result<Vec<String>, CoordError> {
            self.get_children_calls.fetch_add(1, Ordering::SeqCst);
            let nodes = self.nodes.lock();
            if !nodes.contains_key(path) {
                return Err(CoordError::NoNode(path.to_string()));
            }
            let prefix = format!("{path}/");
            let mut children: Vec<String> = nodes
                .keys()
                .filter_map(|key| key.strip_prefix(&prefix))
                .filter(|rest| !rest.contains('/'))
                .map(|rest| rest.to_string())
                .collect();
            children.sort();
            Ok(children)
        }
    }

    fn cache_over(client: Arc<StubClient>) -> Arc<CoordCache> {
        CoordCache::new(client, WatchChannel::new(), None)
    }

    #[test]
    fn populating_read_fills_data_and_stat() {
        let client = StubClient::new();
        client.insert("/a", b"alpha", 3);
        let cache = cache_over(client.clone());
        let (data, stat) = cache.get_data_with_stat("/a");
        assert_eq!(data.as_deref(), Some(b"alpha".as_slice()));
        assert_eq!(stat.unwrap().version, 3);
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn absent_path_is_answered_locally_after_one_probe() {
        let client = StubClient::new();
        let cache = cache_over(client.clone());
        for _ in 0..5 {
            assert_eq!(cache.get_data("/missing"), None);
        }
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.get_data_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn node_event_evicts_all_three_slots() {
        let client = StubClient::new();
        client.insert("/a", b"alpha", 1);
        let cache = cache_over(client.clone());
        cache.get_data("/a");
        cache.get_children("/a");
        cache.channel().dispatch(&WatchEvent::Node {
            kind: NodeEventKind::DataChanged,
            path: "/a".to_string(),
        });
        client.insert("/a", b"beta", 2);
        assert_eq!(cache.get_data("/a").as_deref(), Some(b"beta".as_slice()));
        // two populating reads of the data slot, not three
        assert_eq!(client.get_data_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn session_loss_clears_every_slot() {
        let client = StubClient::new();
        client.insert("/a", b"1", 1);
        client.insert("/b", b"2", 1);
        let cache = cache_over(client.clone());
        cache.get_data("/a");
        cache.get_data("/b");
        cache
            .channel()
            .dispatch(&WatchEvent::Session(SessionEventKind::Expired));
        cache.get_data("/a");
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn connected_event_is_a_noop() {
        let client = StubClient::new();
        client.insert("/a", b"1", 1);
        let cache = cache_over(client.clone());
        cache.get_data("/a");
        cache
            .channel()
            .dispatch(&WatchEvent::Session(SessionEventKind::Connected));
        cache.get_data("/a");
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_modification_retries_until_stable() {
        let client = StubClient::new();
        client.insert("/x", b"stable", 1);
        client.fail_first_get_data.store(1, Ordering::SeqCst);
        let cache = cache_over(client.clone());
        assert_eq!(cache.get_data("/x").as_deref(), Some(b"stable".as_slice()));
        // first attempt hit the version mismatch, second succeeded
        assert_eq!(client.get_data_calls.load(Ordering::SeqCst), 2);
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn children_negative_cache_requires_probe() {
        let client = StubClient::new();
        let cache = cache_over(client.clone());
        assert_eq!(cache.get_children("/nope"), None);
        assert_eq!(cache.get_children("/nope"), None);
        assert_eq!(client.get_children_calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn children_listing_is_ordered() {
        let client = StubClient::new();
        client.insert("/a", b"", 1);
        client.insert("/a/z", b"", 1);
        client.insert("/a/b", b"", 1);
        client.insert("/a/b/deep", b"", 1);
        let cache = cache_over(client);
        assert_eq!(
            cache.get_children("/a"),
            Some(vec!["b".to_string(), "z".to_string()])
        );
    }

    #[test]
    fn clear_prefix_only_touches_matching_slots() {
        let client = StubClient::new();
        client.insert("/a/1", b"x", 1);
        client.insert("/a/2", b"y", 1);
        client.insert("/b/1", b"z", 1);
        let cache = cache_over(client.clone());
        cache.get_data("/a/1");
        cache.get_data("/a/2");
        cache.get_data("/b/1");
        cache.clear_prefix("/a");
        cache.get_data("/b/1");
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 3);
        cache.get_data("/a/1");
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn clear_is_idempotent() {
        let client = StubClient::new();
        client.insert("/a", b"x", 1);
        let cache = cache_over(client.clone());
        cache.get_data("/a");
        cache.clear();
        cache.clear();
        cache.get_data("/a");
        assert_eq!(client.exists_calls.load(Ordering::SeqCst), 2);
    }

    struct StubFactory {
        client: Arc<StubClient>,
        connects: AtomicUsize,
    }

    impl CoordClientFactory for StubFactory {
        fn connect(
            &self,
            _connect: &str,
            _session_timeout: Duration,
            _channel: &Arc<WatchChannel>,
        ) -> Result<Arc<dyn CoordClient>, CoordError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(self.client.clone())
        }
    }

    #[test]
    fn registry_shares_instances_per_key() {
        let factory = Arc::new(StubFactory {
            client: StubClient::new(),
            connects: AtomicUsize::new(0),
        });
        let registry = CacheRegistry::new(factory.clone());
        let first = registry.get("c1:2181", Duration::from_secs(30)).unwrap();
        let again = registry.get("c1:2181", Duration::from_secs(30)).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        let other = registry.get("c1:2181", Duration::from_secs(60)).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 2);
    }
}
