//! In-process counters and gauges for the WAL and coordination subsystems.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug)]
pub struct MetricsRegistry {
    namespace: String,
    counters: HashMap<String, u64>,
    gauges: HashMap<String, u64>,
}

impl MetricsRegistry {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            counters: HashMap::new(),
            gauges: HashMap::new(),
        }
    }

    pub fn inc_counter(&mut self, name: &str, delta: u64) -> u64 {
        let key = self.qualify(name);
        let counter = self.counters.entry(key).or_insert(0);
        *counter = counter.saturating_add(delta);
        *counter
    }

    pub fn set_gauge(&mut self, name: &str, value: u64) {
        let key = self.qualify(name);
        self.gauges.insert(key, value);
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.get(&self.qualify(name)).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            counters: self.counters.clone(),
            gauges: self.gauges.clone(),
        }
    }

    fn qualify(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.namespace, name)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, u64>,
    pub gauges: HashMap<String, u64>,
}

impl MetricsSnapshot {
    /// Counter value by fully-qualified name; zero when never incremented.
    pub fn counter(&self, qualified: &str) -> u64 {
        self.counters.get(qualified).copied().unwrap_or(0)
    }

    pub fn gauge(&self, qualified: &str) -> Option<u64> {
        self.gauges.get(qualified).copied()
    }
}

pub type SharedMetricsRegistry = Arc<Mutex<MetricsRegistry>>;

pub fn shared_registry(namespace: impl Into<String>) -> SharedMetricsRegistry {
    Arc::new(Mutex::new(MetricsRegistry::new(namespace)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_qualify_and_accumulate() {
        let mut registry = MetricsRegistry::new("tessera.wal");
        registry.inc_counter("syncs", 1);
        registry.inc_counter("syncs", 2);
        assert_eq!(registry.counter("syncs"), 3);
        assert_eq!(registry.snapshot().counter("tessera.wal.syncs"), 3);
    }

    #[test]
    fn missing_counter_reads_zero() {
        let registry = MetricsRegistry::new("ns");
        assert_eq!(registry.counter("nothing"), 0);
        assert_eq!(registry.snapshot().counter("ns.nothing"), 0);
    }

    #[test]
    fn gauges_overwrite() {
        let mut registry = MetricsRegistry::new("ns");
        registry.set_gauge("pending", 4);
        registry.set_gauge("pending", 2);
        assert_eq!(registry.snapshot().gauge("ns.pending"), Some(2));
    }
}
