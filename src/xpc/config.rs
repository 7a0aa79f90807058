use std::time::Duration;

use tracing::warn;
use typed_builder::TypedBuilder;

const HEARTBEAT_INTERVAL_MIN: Duration = Duration::from_millis(10);
const HEARTBEAT_INTERVAL_MAX: Duration = Duration::from_secs(10);
const CHECK_INTERVAL_MIN: Duration = Duration::from_millis(20);
const CHECK_INTERVAL_MAX: Duration = Duration::from_secs(120);

fn default_units() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Tunables of the messaging core.
///
/// Only the two heartbeat intervals are meant to be changed in production;
/// the rest exist so tests can run the protocol at a faster pace.
#[derive(TypedBuilder, Clone, Debug)]
pub struct Config {
    /// How often the local heartbeat counter is incremented.
    #[builder(default = Duration::from_millis(200))]
    pub heartbeat_interval: Duration,
    /// How often remote heartbeats are compared against their last sample.
    #[builder(default = Duration::from_secs(1))]
    pub heartbeat_check_interval: Duration,
    /// Consecutive checks without a heartbeat change before an active
    /// partition is deactivated.
    #[builder(default = 3)]
    pub missed_heartbeats: u32,
    /// Period of the dropped-notification recheck.
    #[builder(default = Duration::from_millis(250))]
    pub notify_recheck_interval: Duration,
    /// Period of the channel manager's unsolicited pass.
    #[builder(default = Duration::from_millis(500))]
    pub manager_timeout: Duration,
    #[builder(default = Duration::from_millis(20))]
    pub handshake_backoff: Duration,
    #[builder(default = 250)]
    pub handshake_attempts: u32,
    #[builder(default = Duration::from_millis(5))]
    pub allocate_backoff: Duration,
    #[builder(default = 200)]
    pub allocate_attempts: u32,
    /// Processing units partitions are spread across.
    #[builder(default = default_units())]
    pub processing_units: usize,
    /// Processing units never picked as a partition's affinity.
    #[builder(default)]
    pub disabled_units: Vec<usize>,
    /// Delivery workers allowed across all channels and partitions.
    #[builder(default = 1024)]
    pub max_workers: usize,
    /// Location descriptor published in the reserved page.
    #[builder(default)]
    pub location: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Config {
    /// Clamps the heartbeat tunables into their sane ranges.
    pub fn bounded(mut self) -> Self {
        let hb = self
            .heartbeat_interval
            .clamp(HEARTBEAT_INTERVAL_MIN, HEARTBEAT_INTERVAL_MAX);
        if hb != self.heartbeat_interval {
            warn!(
                "heartbeat interval {:?} out of range, using {:?}",
                self.heartbeat_interval, hb
            );
            self.heartbeat_interval = hb;
        }

        let min_check = CHECK_INTERVAL_MIN.max(self.heartbeat_interval);
        let check = self
            .heartbeat_check_interval
            .clamp(min_check, CHECK_INTERVAL_MAX);
        if check != self.heartbeat_check_interval {
            warn!(
                "heartbeat check interval {:?} out of range, using {:?}",
                self.heartbeat_check_interval, check
            );
            self.heartbeat_check_interval = check;
        }

        if self.missed_heartbeats == 0 {
            warn!("missed heartbeat threshold of 0 is not allowed, using 1");
            self.missed_heartbeats = 1;
        }
        self.handshake_attempts = self.handshake_attempts.max(1);
        self.allocate_attempts = self.allocate_attempts.max(1);
        self.processing_units = self.processing_units.max(1);
        self
    }

    /// Heartbeat silence after which an active partition is declared down.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_check_interval * self.missed_heartbeats
    }
}
