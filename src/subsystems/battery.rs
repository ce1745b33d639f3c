use super::{DriverError, Snapshot};
use heapless::Vec;
use serde::{Deserialize, Serialize};

pub const MAX_CELL_GROUPS: usize = 16;

/// One poll of the battery management system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatterySnapshot {
    pub soc_percent: f32,
    pub soh_percent: f32,
    pub pack_voltage_v: f32,
    pub pack_current_a: f32, // positive = discharging
    pub cell_group_temps_c: Vec<f32, MAX_CELL_GROUPS>,
    pub fault: bool,
    pub captured_at_ms: u64,
}

impl BatterySnapshot {
    /// Pack power in kW; positive while discharging.
    pub fn power_kw(&self) -> f32 {
        self.pack_voltage_v * self.pack_current_a / 1000.0
    }

    pub fn max_cell_temp_c(&self) -> Option<f32> {
        self.cell_group_temps_c
            .iter()
            .copied()
            .fold(None, |max, t| Some(max.map_or(t, |m: f32| m.max(t))))
    }
}

impl Snapshot for BatterySnapshot {
    fn reports_fault(&self) -> bool {
        self.fault
    }

    fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }
}

pub trait BatteryDriver: Send {
    fn read_battery(&mut self) -> Result<BatterySnapshot, DriverError>;
}
