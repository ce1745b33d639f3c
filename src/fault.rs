use crate::subsystems::SubsystemId;
use heapless::Vec;
use serde::{Deserialize, Serialize};

const MAX_FAULT_HISTORY: usize = 64;

/// Why a subsystem's fault flag is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultCause {
    /// The driver itself reported a fault.
    Reported,
    /// Last good snapshot is older than the staleness window.
    Stale,
    /// No snapshot has ever arrived and the window has passed.
    NoSnapshot,
    /// A temperature sensor of this subsystem is in `Fault`.
    Temperature,
}

/// One fault episode, from the tick the flag rose to the tick it cleared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    pub id: u32,
    pub subsystem: SubsystemId,
    pub cause: FaultCause,
    pub timestamp: u64,
    pub duration_ms: u64,
    pub resolved: bool,
}

#[derive(Debug)]
pub struct FaultLog {
    history: Vec<FaultRecord, MAX_FAULT_HISTORY>,
    next_fault_id: u32,
}

impl FaultLog {
    pub fn new() -> Self {
        Self {
            history: Vec::new(),
            next_fault_id: 1,
        }
    }

    pub fn open(&mut self, subsystem: SubsystemId, cause: FaultCause, timestamp: u64) -> u32 {
        let fault_id = self.next_fault_id;
        self.next_fault_id = self.next_fault_id.wrapping_add(1);

        if self.history.is_full() {
            self.history.remove(0);
        }

        let _ = self.history.push(FaultRecord {
            id: fault_id,
            subsystem,
            cause,
            timestamp,
            duration_ms: 0,
            resolved: false,
        });
        fault_id
    }

    pub fn resolve(&mut self, fault_id: u32, timestamp: u64) -> bool {
        if let Some(fault) = self.history.iter_mut().find(|f| f.id == fault_id) {
            fault.resolved = true;
            fault.duration_ms = timestamp.saturating_sub(fault.timestamp);
            true
        } else {
            false
        }
    }

    pub fn active(&self) -> impl Iterator<Item = &FaultRecord> {
        self.history.iter().filter(|f| !f.resolved)
    }

    pub fn history(&self) -> &[FaultRecord] {
        &self.history
    }

    /// Number of episodes ever opened, including ones rotated out of history.
    pub fn total_opened(&self) -> u32 {
        self.next_fault_id.wrapping_sub(1)
    }
}

impl Default for FaultLog {
    fn default() -> Self {
        Self::new()
    }
}
