use heapless::Deque;
use serde::{Deserialize, Serialize};

const EFFICIENCY_WINDOW: usize = 32;
const SEGMENT_KM: f64 = 0.25;
const MIN_EFFICIENCY_DISTANCE_KM: f64 = 0.1;
// Keeps range finite when regen makes a window net-negative.
const MIN_EFFICIENCY_KWH_PER_KM: f64 = 0.05;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
struct Segment {
    distance_km: f64,
    energy_kwh: f64,
}

/// Trip distance, energy and the derived range estimate.
///
/// Totals only grow; [`EnergyLedger::reset`] is the only way back to zero.
/// Efficiency is a rolling average over recently driven segments, falling
/// back to a configured default until enough distance has been covered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnergyLedger {
    distance_km: f64,
    energy_consumed_kwh: f64,
    energy_regenerated_kwh: f64,
    range_km: f64,
    #[serde(default)]
    driving_time_ms: u64,
    #[serde(skip)]
    window: Deque<Segment, EFFICIENCY_WINDOW>,
    #[serde(skip)]
    pending: Segment,
}

impl EnergyLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Integrate one step of driving. `power_kw` is positive while drawing
    /// from the pack and negative while regenerating.
    pub fn integrate(&mut self, dt_ms: u64, speed_kmh: f32, power_kw: f32) {
        let hours = dt_ms as f64 / 3_600_000.0;
        let distance = f64::from(speed_kmh.max(0.0)) * hours;
        let energy = f64::from(power_kw) * hours;

        self.distance_km += distance;
        self.driving_time_ms = self.driving_time_ms.saturating_add(dt_ms);
        if energy >= 0.0 {
            self.energy_consumed_kwh += energy;
        } else {
            self.energy_regenerated_kwh -= energy;
        }

        self.pending.distance_km += distance;
        self.pending.energy_kwh += energy;
        if self.pending.distance_km >= SEGMENT_KM {
            if self.window.is_full() {
                self.window.pop_front();
            }
            let _ = self.window.push_back(self.pending);
            self.pending = Segment::default();
        }
    }

    /// Rolling average consumption, or `default_kwh_per_km` when too little
    /// distance is on record.
    pub fn efficiency_kwh_per_km(&self, default_kwh_per_km: f64) -> f64 {
        let (distance, energy) = self
            .window
            .iter()
            .chain(core::iter::once(&self.pending))
            .fold((0.0, 0.0), |(d, e), s| (d + s.distance_km, e + s.energy_kwh));

        if distance < MIN_EFFICIENCY_DISTANCE_KM {
            default_kwh_per_km
        } else {
            (energy / distance).max(MIN_EFFICIENCY_KWH_PER_KM)
        }
    }

    /// range = (SOC fraction × capacity) / efficiency
    pub fn refresh_range(&mut self, soc_percent: f32, capacity_kwh: f64, default_kwh_per_km: f64) {
        let soc = f64::from(soc_percent.clamp(0.0, 100.0)) / 100.0;
        let efficiency = self.efficiency_kwh_per_km(default_kwh_per_km).max(MIN_EFFICIENCY_KWH_PER_KM);
        self.range_km = soc * capacity_kwh / efficiency;
    }

    /// Explicit trip reset.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn distance_km(&self) -> f64 {
        self.distance_km
    }

    pub fn energy_consumed_kwh(&self) -> f64 {
        self.energy_consumed_kwh
    }

    pub fn energy_regenerated_kwh(&self) -> f64 {
        self.energy_regenerated_kwh
    }

    pub fn range_km(&self) -> f64 {
        self.range_km
    }

    /// Time spent in `Driving` since the last trip reset.
    pub fn driving_time_ms(&self) -> u64 {
        self.driving_time_ms
    }
}

/// Seconds to charge from `soc_percent` up to `target_percent` at a constant
/// `power_kw`.
///
/// `None` while no power flows into the pack; zero once the target is met.
pub fn charge_time_remaining_s(soc_percent: f32, target_percent: f32, capacity_kwh: f64, power_kw: f32) -> Option<f64> {
    if power_kw.is_nan() || power_kw <= 0.0 {
        return None;
    }
    let remaining_percent = f64::from(target_percent - soc_percent);
    if remaining_percent <= 0.0 {
        return Some(0.0);
    }
    let energy_kwh = remaining_percent / 100.0 * capacity_kwh;
    Some(energy_kwh / f64::from(power_kw) * 3_600.0)
}
