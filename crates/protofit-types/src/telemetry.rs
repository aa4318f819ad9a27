use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencySample {
    pub seq: u64,
    pub encode_ms: u64,
    pub round_trip_ms: u64,
    pub captured_at: DateTime<Utc>,
}

/// Poll-loop counters.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TickMetrics {
    pub dispatched: u64,
    pub skipped_not_ready: u64,
    pub skipped_in_flight: u64,
    pub replaced: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub stale_discarded: u64,
    pub last_latency: Option<LatencySample>,
}
