use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use crate::compaction::CompactionStrategyType;
use crate::engine::{Engine, EngineConfig};
use crate::remote_flush::registry::DiscoveryRegistry;
use crate::remote_flush::{FlushReason, RemoteFlushConfig};

/// Initialize tracing subscriber controlled by `RUST_LOG` env var.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn small_buffer_config() -> EngineConfig {
    init_tracing();
    EngineConfig {
        write_buffer_size: 128,
        compaction_strategy: CompactionStrategyType::Stcs,
        bucket_low: 0.5,
        bucket_high: 1.5,
        min_sstable_size: 1024,
        min_threshold: 4,
        max_threshold: 32,
        tombstone_ratio_threshold: 0.2,
        tombstone_compaction_interval: 3600,
        tombstone_bloom_fallback: false,
        tombstone_range_drop: false,
        thread_pool_size: 2,
    }
}

pub fn open_engine(path: &std::path::Path) -> Engine {
    Engine::open(path, small_buffer_config()).expect("open")
}

pub fn disabled_config() -> RemoteFlushConfig {
    RemoteFlushConfig {
        remote_enabled: false,
        ..RemoteFlushConfig::default()
    }
}

pub fn enabled_config(
    mem_node_endpoints: Vec<(String, u16)>,
    worker_endpoints: Vec<(String, u16)>,
) -> RemoteFlushConfig {
    RemoteFlushConfig {
        remote_enabled: true,
        memory_node_endpoints: mem_node_endpoints,
        worker_endpoints,
        rdma_enabled: false,
        per_step_timeout: Duration::from_secs(2),
        max_retries: 1,
        max_in_flight_flushes: 1,
    }
}

pub fn fresh_registry() -> Arc<DiscoveryRegistry> {
    Arc::new(DiscoveryRegistry::default())
}

pub fn registry_with_timeout(liveness_timeout: Duration) -> Arc<DiscoveryRegistry> {
    Arc::new(DiscoveryRegistry::new(liveness_timeout))
}

pub fn not_shutting_down() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

pub fn already_shutting_down() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

/// Writes enough keys through the given reason to freeze at least one
/// memtable without crossing the flush threshold, so it lands in `frozen`.
pub fn freeze_one_memtable(engine: &Engine, prefix: &str) {
    for i in 0..32 {
        let key = format!("{prefix}_{i:04}").into_bytes();
        let value = format!("value_with_padding_{i:04}").into_bytes();
        engine.put(key, value).expect("put");
    }
}
