use evbus::subsystems::SubsystemId;
use evbus::thermal::*;

const NOW: u64 = 10_000;
const STALENESS_MS: u64 = 2_000;

fn aggregator() -> TemperatureAggregator {
    TemperatureAggregator::new(SensorLayout::default(), ThresholdTable::default(), STALENESS_MS)
}

fn nominal_readings(layout: &SensorLayout) -> ReadingMap {
    let mut readings = ReadingMap::new();
    for role in layout.expected_roles() {
        readings
            .insert(role, RawReading { value_c: 25.0, timestamp_ms: NOW })
            .unwrap();
    }
    readings
}

fn set(readings: &mut ReadingMap, role: SensorRole, value_c: f32, timestamp_ms: u64) {
    readings.insert(role, RawReading { value_c, timestamp_ms }).unwrap();
}

#[test]
fn test_all_nominal() {
    let aggregator = aggregator();
    let report = aggregator.evaluate(&nominal_readings(aggregator.layout()), NOW);

    assert_eq!(report.readings.len(), SensorLayout::default().expected_count());
    assert_eq!(report.battery, TemperatureStatus::Normal);
    assert_eq!(report.motor, TemperatureStatus::Normal);
    assert_eq!(report.charging, TemperatureStatus::Normal);
    assert_eq!(report.faulted_sensors, 0);
    assert!(report.readings.iter().all(|r| !r.stale && r.value_c == Some(25.0)));
}

#[test]
fn test_missing_expected_sensor_is_fault() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    readings.remove(&SensorRole::stator(1));

    let report = aggregator.evaluate(&readings, NOW);
    let missing = report.reading(SensorRole::stator(1)).unwrap();
    assert_eq!(missing.status, TemperatureStatus::Fault);
    assert!(missing.stale);
    assert_eq!(missing.value_c, None);
    assert_eq!(missing.timestamp_ms, None);

    assert!(report.fault(SubsystemId::Motor));
    assert!(!report.fault(SubsystemId::Battery));
    assert_eq!(report.faulted_sensors, 1);
}

#[test]
fn test_stale_reading_is_fault_even_when_in_range() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::cell_group(3), 25.0, NOW - STALENESS_MS - 1);

    let report = aggregator.evaluate(&readings, NOW);
    let reading = report.reading(SensorRole::cell_group(3)).unwrap();
    assert!(reading.stale);
    assert_eq!(reading.status, TemperatureStatus::Fault);
    assert_eq!(reading.value_c, Some(25.0));
    assert_eq!(report.battery, TemperatureStatus::Fault);
}

#[test]
fn test_reading_exactly_at_staleness_window_is_fresh() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::cell_group(0), 25.0, NOW - STALENESS_MS);

    let report = aggregator.evaluate(&readings, NOW);
    assert!(!report.reading(SensorRole::cell_group(0)).unwrap().stale);
    assert_eq!(report.battery, TemperatureStatus::Normal);
}

#[test]
fn test_future_timestamp_is_not_stale() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::cell_group(0), 25.0, NOW + 500);

    let report = aggregator.evaluate(&readings, NOW);
    assert_eq!(report.battery, TemperatureStatus::Normal);
}

#[test]
fn test_worst_status_wins_per_subsystem() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::cell_group(0), 45.0, NOW); // warning band
    set(&mut readings, SensorRole::stator(0), 90.0, NOW); // warning band

    let report = aggregator.evaluate(&readings, NOW);
    assert_eq!(report.battery, TemperatureStatus::Warning);
    assert_eq!(report.motor, TemperatureStatus::Warning);
    assert_eq!(report.faulted_sensors, 0);

    set(&mut readings, SensorRole::cell_group(5), 55.0, NOW); // above fault high
    let report = aggregator.evaluate(&readings, NOW);
    assert_eq!(report.battery, TemperatureStatus::Fault);
    assert_eq!(report.motor, TemperatureStatus::Warning);
    assert_eq!(report.charging, TemperatureStatus::Normal);
    assert_eq!(report.faulted_sensors, 1);
}

#[test]
fn test_cold_cells_warn_then_fault() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());

    set(&mut readings, SensorRole::cell_group(2), 0.0, NOW);
    assert_eq!(aggregator.evaluate(&readings, NOW).battery, TemperatureStatus::Warning);

    set(&mut readings, SensorRole::cell_group(2), -15.0, NOW);
    assert_eq!(aggregator.evaluate(&readings, NOW).battery, TemperatureStatus::Fault);
}

#[test]
fn test_coolant_rolls_up_to_battery() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::new(SensorKind::CoolantOutlet, 0), 95.0, NOW);

    let report = aggregator.evaluate(&readings, NOW);
    assert_eq!(report.battery, TemperatureStatus::Fault);
    assert_eq!(report.motor, TemperatureStatus::Normal);
}

#[test]
fn test_charging_connector_rolls_up_to_charging() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::new(SensorKind::ChargingConnector, 0), 70.0, NOW);

    let report = aggregator.evaluate(&readings, NOW);
    assert_eq!(report.charging, TemperatureStatus::Warning);
    assert_eq!(report.battery, TemperatureStatus::Normal);
}

#[test]
fn test_nan_reading_is_fault() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::stator(2), f32::NAN, NOW);

    let report = aggregator.evaluate(&readings, NOW);
    assert_eq!(report.reading(SensorRole::stator(2)).unwrap().status, TemperatureStatus::Fault);
    assert!(report.fault(SubsystemId::Motor));
}

#[test]
fn test_unexpected_sensor_is_reported_after_layout() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    let extra = SensorRole::cell_group(12);
    set(&mut readings, extra, 48.0, NOW);

    let report = aggregator.evaluate(&readings, NOW);
    let expected = aggregator.layout().expected_count();
    assert_eq!(report.readings.len(), expected + 1);
    assert_eq!(report.readings[expected].role, extra);
    assert_eq!(report.readings[expected].status, TemperatureStatus::Warning);
    assert_eq!(report.battery, TemperatureStatus::Warning);
}

#[test]
fn test_empty_input_faults_every_subsystem() {
    let report = aggregator().evaluate(&ReadingMap::new(), NOW);

    assert_eq!(report.battery, TemperatureStatus::Fault);
    assert_eq!(report.motor, TemperatureStatus::Fault);
    assert_eq!(report.charging, TemperatureStatus::Fault);
    assert_eq!(usize::from(report.faulted_sensors), SensorLayout::default().expected_count());
}

#[test]
fn test_reduced_layout_ignores_absent_groups() {
    let layout = SensorLayout {
        cell_groups: 2,
        stator_sensors: 1,
        coolant: false,
        charging: false,
    };
    let mut readings = ReadingMap::new();
    for role in [SensorRole::cell_group(0), SensorRole::cell_group(1), SensorRole::stator(0)] {
        set(&mut readings, role, 20.0, NOW);
    }

    let report = aggregate(&readings, &layout, &ThresholdTable::default(), STALENESS_MS, NOW);
    assert_eq!(report.readings.len(), 3);
    assert_eq!(report.charging, TemperatureStatus::Normal);
    assert_eq!(report.faulted_sensors, 0);
}

#[test]
fn test_evaluation_is_pure() {
    let aggregator = aggregator();
    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::stator(0), 85.0, NOW);

    let first = aggregator.evaluate(&readings, NOW);
    let second = aggregator.evaluate(&readings, NOW);
    assert_eq!(first, second);
}

#[test]
fn test_custom_thresholds() {
    let mut thresholds = ThresholdTable::default();
    thresholds.motor_stator = Thresholds::new(10.0, 60.0, 0.0, 100.0);
    let aggregator = TemperatureAggregator::new(SensorLayout::default(), thresholds, STALENESS_MS);

    let mut readings = nominal_readings(aggregator.layout());
    set(&mut readings, SensorRole::stator(0), 70.0, NOW);
    assert_eq!(aggregator.evaluate(&readings, NOW).motor, TemperatureStatus::Warning);
}
