//! Decay scheduler configuration.

use std::sync::Arc;
use std::time::Duration;

use strand_clock::{Clock, SystemClock};

/// Base tick period all tag intervals are quantized against.
pub const DEFAULT_RESOLUTION: Duration = Duration::from_secs(60);

/// Capacity of the registry's serialized command queue; the backpressure
/// bound callers block on under bump storms.
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 64;

/// Configuration for the decaying tag registry.
#[derive(Debug, Clone)]
pub struct DecayerConfig {
    /// Scheduler resolution. Tag intervals finer than this are rejected at
    /// registration.
    pub resolution: Duration,
    /// Bound on the serialized command queue.
    pub command_queue_capacity: usize,
    /// Time source; swap in a [`strand_clock::ManualClock`] for
    /// deterministic tests.
    pub clock: Arc<dyn Clock>,
}

impl Default for DecayerConfig {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            command_queue_capacity: DEFAULT_COMMAND_QUEUE_CAPACITY,
            clock: Arc::new(SystemClock),
        }
    }
}

impl DecayerConfig {
    pub fn with_resolution(mut self, resolution: Duration) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_command_queue_capacity(mut self, capacity: usize) -> Self {
        self.command_queue_capacity = capacity;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
