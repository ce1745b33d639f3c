use super::{DriverError, Snapshot};
use serde::{Deserialize, Serialize};

const AC_MAX_POWER_KW: f32 = 11.0;
const DC_MAX_POWER_KW: f32 = 150.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ConnectorType {
    Ccs1 = 0,
    Ccs2 = 1,
    Chademo = 2,
    Tesla = 3,
    Type2 = 4,
}

impl ConnectorType {
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(ConnectorType::Ccs1),
            1 => Some(ConnectorType::Ccs2),
            2 => Some(ConnectorType::Chademo),
            3 => Some(ConnectorType::Tesla),
            4 => Some(ConnectorType::Type2),
            _ => None,
        }
    }

    /// Type2 is the only AC-only connector.
    pub const fn max_power_kw(self) -> f32 {
        match self {
            ConnectorType::Type2 => AC_MAX_POWER_KW,
            _ => DC_MAX_POWER_KW,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargingSnapshot {
    pub connector: ConnectorType,
    pub port_temp_c: f32,
    pub connector_temp_c: f32,
    pub connected: bool,
    pub active: bool,
    pub complete: bool,
    pub power_kw: f32,
    pub fault: bool,
    pub captured_at_ms: u64,
}

impl ChargingSnapshot {
    /// Plugged in and not yet finished.
    pub fn wants_charge(&self) -> bool {
        self.connected && !self.complete
    }
}

impl Snapshot for ChargingSnapshot {
    fn reports_fault(&self) -> bool {
        self.fault
    }

    fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }
}

pub trait ChargingDriver: Send {
    fn read_charging(&mut self) -> Result<ChargingSnapshot, DriverError>;
    fn set_charging_enabled(&mut self, enabled: bool) -> Result<(), DriverError>;
}
