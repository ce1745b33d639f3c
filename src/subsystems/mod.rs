pub mod battery;
pub mod motor;
pub mod charging;

pub use battery::{BatteryDriver, BatterySnapshot};
pub use motor::{MotorCommand, MotorDriver, MotorSnapshot, VescMotor};
pub use charging::{ChargingDriver, ChargingSnapshot, ConnectorType};

use crate::thermal::ReadingMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubsystemId {
    Battery,
    Motor,
    Charging,
}

impl SubsystemId {
    pub const ALL: [SubsystemId; 3] = [SubsystemId::Battery, SubsystemId::Motor, SubsystemId::Charging];

    pub const fn index(self) -> usize {
        match self {
            SubsystemId::Battery => 0,
            SubsystemId::Motor => 1,
            SubsystemId::Charging => 2,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            SubsystemId::Battery => "battery",
            SubsystemId::Motor => "motor",
            SubsystemId::Charging => "charging",
        }
    }
}

/// Failure reading from or commanding an external driver.
///
/// Never fatal: the scheduler keeps the last snapshot and marks it stale.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("driver call timed out after {0} ms")]
    Timeout(u64),
    #[error("driver I/O failure: {0}")]
    Io(String),
    #[error("no data available from driver")]
    NoData,
    #[error("driver disconnected")]
    Disconnected,
    #[error("driver lock poisoned")]
    Poisoned,
    #[error("driver busy with an earlier call")]
    Busy,
}

/// Common view over the immutable snapshots the drivers produce.
pub trait Snapshot: Clone + Send + Sync + 'static {
    fn reports_fault(&self) -> bool;
    fn captured_at_ms(&self) -> u64;
}

/// Latest result of polling one driver.
///
/// Holds the last successful snapshot. A failed poll keeps that snapshot and
/// flips `stale`; `updated_at_ms` only moves on success.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Polled<T> {
    pub snapshot: Option<T>,
    pub stale: bool,
    pub updated_at_ms: u64,
    pub consecutive_failures: u32,
}

impl<T> Polled<T> {
    /// Nothing received yet; age counts from `now_ms`.
    pub fn empty(now_ms: u64) -> Self {
        Self {
            snapshot: None,
            stale: true,
            updated_at_ms: now_ms,
            consecutive_failures: 0,
        }
    }

    pub fn fresh(snapshot: T, now_ms: u64) -> Self {
        Self {
            snapshot: Some(snapshot),
            stale: false,
            updated_at_ms: now_ms,
            consecutive_failures: 0,
        }
    }

    pub fn update(&mut self, snapshot: T, now_ms: u64) {
        self.snapshot = Some(snapshot);
        self.stale = false;
        self.updated_at_ms = now_ms;
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.stale = true;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    pub fn snapshot(&self) -> Option<&T> {
        self.snapshot.as_ref()
    }

    pub fn age_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.updated_at_ms)
    }

    /// True once the last good snapshot is older than `window_ms`.
    pub fn is_expired(&self, now_ms: u64, window_ms: u64) -> bool {
        self.age_ms(now_ms) > window_ms
    }
}

/// Monotonic millisecond clock shared by the scheduler and drivers.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    origin: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

pub trait TemperatureSource: Send {
    /// Raw readings keyed by sensor role, each carrying its own timestamp.
    fn read_temperatures(&mut self) -> Result<ReadingMap, DriverError>;
}
