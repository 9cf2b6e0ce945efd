#![allow(dead_code)]

pub mod range_server;

use giga_core::config::{EngineConfig, RetryConfig};

/// Small chunks, fast retries and short timeouts for local tests.
pub fn test_config(block_size: u64) -> EngineConfig {
    EngineConfig {
        block_size,
        connections_per_mission: 3,
        connect_timeout_secs: 2,
        stall_timeout_secs: 5,
        progress_interval_ms: 20,
        retry: Some(RetryConfig {
            max_attempts: 5,
            base_delay_secs: 0.01,
            max_delay_secs: 1,
        }),
        ..EngineConfig::default()
    }
}

/// Deterministic, non-repeating-per-chunk payload.
pub fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
