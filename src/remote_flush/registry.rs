//! In-memory discovery of generators, memory nodes, and workers.
//!
//! A single [`DiscoveryRegistry`] is shared (behind a `Mutex`) by every role
//! running in a process or test harness. Production deployments would back
//! this with an external service; nothing here depends on that, so the
//! registry is deliberately just a guarded map plus a few selection helpers.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// `(host, port)` uniquely identifies a registered endpoint.
pub type EndpointKey = (String, u16);

/// A registered memory node and its last-known capacity usage.
#[derive(Debug, Clone)]
pub struct MemNodeEntry {
    /// Endpoint host.
    pub host: String,
    /// Endpoint port.
    pub port: u16,
    /// Total bytes the memory node is configured to hold.
    pub capacity_bytes: u64,
    /// Bytes currently held on behalf of in-flight jobs.
    pub held_bytes: u64,
    /// Last time this entry was confirmed reachable.
    last_seen: Instant,
}

impl MemNodeEntry {
    /// Bytes the memory node can still accept.
    pub fn available_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.held_bytes)
    }
}

/// A registered worker and whether it is currently running a job.
#[derive(Debug, Clone)]
pub struct WorkerEntry {
    /// Endpoint host.
    pub host: String,
    /// Endpoint port.
    pub port: u16,
    /// Whether the worker is currently executing a flush.
    pub busy: bool,
    /// Last time this entry was confirmed reachable.
    last_seen: Instant,
}

struct RegistryState {
    mem_nodes: HashMap<EndpointKey, MemNodeEntry>,
    workers: HashMap<EndpointKey, WorkerEntry>,
}

/// Shared, mutex-guarded table of known memory nodes and workers.
///
/// All mutating operations take the lock for the duration of a linear scan;
/// the registry is sized for dozens to low hundreds of peers, not a large
/// fleet, so this is intentionally simple rather than sharded.
pub struct DiscoveryRegistry {
    state: Mutex<RegistryState>,
    /// Entries not confirmed reachable within this window are treated as
    /// dead by [`DiscoveryRegistry::reap_stale`].
    pub liveness_timeout: Duration,
    /// Per-column-family set of `max_memtable_id`s still awaiting commit,
    /// used to enforce cross-job commit ordering.
    commit_order: Mutex<HashMap<u64, BTreeSet<u64>>>,
    commit_cv: Condvar,
}

impl DiscoveryRegistry {
    /// Creates an empty registry with the given liveness timeout.
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                mem_nodes: HashMap::new(),
                workers: HashMap::new(),
            }),
            liveness_timeout,
            commit_order: Mutex::new(HashMap::new()),
            commit_cv: Condvar::new(),
        }
    }

    /// Spawns a background thread that calls [`DiscoveryRegistry::reap_stale`]
    /// every `interval` for as long as this registry has any other owner.
    /// The thread exits on its own once the last `Arc` is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> thread::JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        thread::spawn(move || loop {
            thread::sleep(interval);
            let Some(registry) = weak.upgrade() else {
                return;
            };
            registry.reap_stale();
        })
    }

    /// Marks `max_memtable_id` as in flight for `column_family_id`. A job
    /// must call this once it has picked memtables, before it may call
    /// [`DiscoveryRegistry::wait_for_commit_turn`].
    pub fn register_pending_commit(&self, column_family_id: u64, max_memtable_id: u64) {
        self.commit_order
            .lock()
            .unwrap()
            .entry(column_family_id)
            .or_default()
            .insert(max_memtable_id);
    }

    /// Blocks until every job registered on `column_family_id` with a
    /// smaller `max_memtable_id` has called
    /// [`DiscoveryRegistry::complete_commit`] — i.e. has committed or
    /// cancelled. Jobs on the same column family therefore commit in the
    /// order their `max_memtable_id`s were assigned.
    pub fn wait_for_commit_turn(&self, column_family_id: u64, max_memtable_id: u64) {
        let mut order = self.commit_order.lock().unwrap();
        loop {
            let is_turn = match order.get(&column_family_id).and_then(|ids| ids.iter().next()) {
                Some(&smallest) => smallest >= max_memtable_id,
                None => true,
            };
            if is_turn {
                return;
            }
            order = self.commit_cv.wait(order).unwrap();
        }
    }

    /// Releases `max_memtable_id`'s place in the commit order, waking any
    /// job blocked in [`DiscoveryRegistry::wait_for_commit_turn`].
    pub fn complete_commit(&self, column_family_id: u64, max_memtable_id: u64) {
        let mut order = self.commit_order.lock().unwrap();
        if let Some(ids) = order.get_mut(&column_family_id) {
            ids.remove(&max_memtable_id);
            if ids.is_empty() {
                order.remove(&column_family_id);
            }
        }
        drop(order);
        self.commit_cv.notify_all();
    }

    /// Registers or refreshes a memory node, resetting its liveness clock.
    pub fn register_mem_node(&self, host: impl Into<String>, port: u16, capacity_bytes: u64) {
        let host = host.into();
        let mut state = self.state.lock().unwrap();
        let entry = state
            .mem_nodes
            .entry((host.clone(), port))
            .or_insert_with(|| MemNodeEntry {
                host,
                port,
                capacity_bytes,
                held_bytes: 0,
                last_seen: Instant::now(),
            });
        entry.capacity_bytes = capacity_bytes;
        entry.last_seen = Instant::now();
    }

    /// Registers or refreshes a worker, resetting its liveness clock.
    pub fn register_worker(&self, host: impl Into<String>, port: u16) {
        let host = host.into();
        let mut state = self.state.lock().unwrap();
        let entry = state
            .workers
            .entry((host.clone(), port))
            .or_insert_with(|| WorkerEntry {
                host,
                port,
                busy: false,
                last_seen: Instant::now(),
            });
        entry.last_seen = Instant::now();
    }

    /// Removes a memory node, e.g. after it reports a fatal error.
    pub fn remove_mem_node(&self, host: &str, port: u16) {
        self.state
            .lock()
            .unwrap()
            .mem_nodes
            .remove(&(host.to_string(), port));
    }

    /// Removes a worker.
    pub fn remove_worker(&self, host: &str, port: u16) {
        self.state
            .lock()
            .unwrap()
            .workers
            .remove(&(host.to_string(), port));
    }

    /// Picks the memory node with the most available headroom that can fit
    /// `size_bytes`, and reserves that space against it.
    pub fn reserve_mem_node(&self, size_bytes: u64) -> Option<(String, u16)> {
        let mut state = self.state.lock().unwrap();
        let chosen = state
            .mem_nodes
            .values_mut()
            .filter(|e| e.available_bytes() >= size_bytes)
            .max_by_key(|e| e.available_bytes())?;
        chosen.held_bytes += size_bytes;
        Some((chosen.host.clone(), chosen.port))
    }

    /// Releases a previously reserved amount back to a memory node's headroom.
    pub fn release_mem_node(&self, host: &str, port: u16, size_bytes: u64) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.mem_nodes.get_mut(&(host.to_string(), port)) {
            entry.held_bytes = entry.held_bytes.saturating_sub(size_bytes);
        }
    }

    /// Claims the first idle worker found, marking it busy.
    pub fn claim_worker(&self) -> Option<(String, u16)> {
        let mut state = self.state.lock().unwrap();
        let chosen = state.workers.values_mut().find(|e| !e.busy)?;
        chosen.busy = true;
        Some((chosen.host.clone(), chosen.port))
    }

    /// Marks a worker idle again, e.g. once its `RunResult` has been received.
    pub fn release_worker(&self, host: &str, port: u16) {
        if let Some(entry) = self
            .state
            .lock()
            .unwrap()
            .workers
            .get_mut(&(host.to_string(), port))
        {
            entry.busy = false;
        }
    }

    /// Drops any memory node or worker not seen within `liveness_timeout`.
    pub fn reap_stale(&self) {
        let mut state = self.state.lock().unwrap();
        let timeout = self.liveness_timeout;
        state
            .mem_nodes
            .retain(|_, e| e.last_seen.elapsed() < timeout);
        state
            .workers
            .retain(|_, e| e.last_seen.elapsed() < timeout);
    }

    /// Records a heartbeat from a known memory node or worker.
    pub fn touch(&self, host: &str, port: u16) {
        let mut state = self.state.lock().unwrap();
        let key = (host.to_string(), port);
        if let Some(e) = state.mem_nodes.get_mut(&key) {
            e.last_seen = Instant::now();
        }
        if let Some(e) = state.workers.get_mut(&key) {
            e.last_seen = Instant::now();
        }
    }

    /// Snapshot of currently registered memory nodes, for diagnostics.
    pub fn mem_node_snapshot(&self) -> Vec<MemNodeEntry> {
        self.state.lock().unwrap().mem_nodes.values().cloned().collect()
    }

    /// Snapshot of currently registered workers, for diagnostics.
    pub fn worker_snapshot(&self) -> Vec<WorkerEntry> {
        self.state.lock().unwrap().workers.values().cloned().collect()
    }
}

impl Default for DiscoveryRegistry {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_picks_node_with_most_headroom() {
        let registry = DiscoveryRegistry::default();
        registry.register_mem_node("a", 1, 1_000);
        registry.register_mem_node("b", 2, 10_000);

        let picked = registry.reserve_mem_node(500).unwrap();
        assert_eq!(picked, ("b".to_string(), 2));
    }

    #[test]
    fn reserve_returns_none_when_nothing_fits() {
        let registry = DiscoveryRegistry::default();
        registry.register_mem_node("a", 1, 100);
        assert!(registry.reserve_mem_node(500).is_none());
    }

    #[test]
    fn release_restores_headroom() {
        let registry = DiscoveryRegistry::default();
        registry.register_mem_node("a", 1, 1_000);
        registry.reserve_mem_node(800).unwrap();
        assert!(registry.reserve_mem_node(500).is_none());
        registry.release_mem_node("a", 1, 800);
        assert!(registry.reserve_mem_node(500).is_some());
    }

    #[test]
    fn claim_worker_marks_busy_until_released() {
        let registry = DiscoveryRegistry::default();
        registry.register_worker("w", 1);
        let claimed = registry.claim_worker().unwrap();
        assert_eq!(claimed, ("w".to_string(), 1));
        assert!(registry.claim_worker().is_none());
        registry.release_worker("w", 1);
        assert!(registry.claim_worker().is_some());
    }

    #[test]
    fn reap_stale_drops_unreachable_entries() {
        let registry = DiscoveryRegistry::new(Duration::from_millis(1));
        registry.register_worker("w", 1);
        std::thread::sleep(Duration::from_millis(5));
        registry.reap_stale();
        assert!(registry.worker_snapshot().is_empty());
    }

    #[test]
    fn spawn_reaper_reaps_in_the_background_and_stops_when_dropped() {
        let registry = Arc::new(DiscoveryRegistry::new(Duration::from_millis(5)));
        registry.register_worker("w", 1);
        let handle = registry.spawn_reaper(Duration::from_millis(2));

        std::thread::sleep(Duration::from_millis(40));
        assert!(registry.worker_snapshot().is_empty());

        drop(registry);
        handle.join().unwrap();
    }

    #[test]
    fn later_max_memtable_id_waits_for_earlier_one_to_complete() {
        let registry = Arc::new(DiscoveryRegistry::default());
        registry.register_pending_commit(0, 5);
        registry.register_pending_commit(0, 7);

        let order = Arc::new(Mutex::new(Vec::new()));

        let r_later = Arc::clone(&registry);
        let order_later = Arc::clone(&order);
        let later = thread::spawn(move || {
            r_later.wait_for_commit_turn(0, 7);
            order_later.lock().unwrap().push(7u64);
            r_later.complete_commit(0, 7);
        });

        thread::sleep(Duration::from_millis(50));
        assert!(order.lock().unwrap().is_empty(), "later job must not commit first");

        registry.wait_for_commit_turn(0, 5);
        order.lock().unwrap().push(5u64);
        registry.complete_commit(0, 5);

        later.join().unwrap();
        assert_eq!(*order.lock().unwrap(), vec![5, 7]);
    }

    #[test]
    fn commit_order_is_independent_per_column_family() {
        let registry = DiscoveryRegistry::default();
        registry.register_pending_commit(0, 9);
        registry.register_pending_commit(1, 3);

        // Column family 1's job has the smaller id but a different family,
        // so it must not block column family 0's only in-flight job.
        registry.wait_for_commit_turn(0, 9);
        registry.complete_commit(0, 9);
    }
}
