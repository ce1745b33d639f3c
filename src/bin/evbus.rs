use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use evbus::protocol::{self, FrameKind};
use evbus::subsystems::{Clock, ConnectorType, DriverError};
use evbus::telemetry::TelemetrySink;
use evbus::thermal::TemperatureStatus;
use evbus::vehicle::{ControlRequest, DriveMode, VehicleCommand};
use evbus::{CoreConfig, Frame, LoopbackBus, RunSummary, Scheduler, SimulatedVehicle, VehicleReport, VehicleState};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::Level;

const DEFAULT_DURATION_SECS: &str = "20";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("evbus")
        .version("0.1.0")
        .author("Vehicle Systems Engineering Team")
        .about("🚗 EV coordination core - state machine, interlocks and bus protocol")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("JSON configuration file (defaults apply to missing keys)")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table", "compact"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("simulate")
                .about("🔋 Run the coordination loop against a simulated vehicle")
                .long_about("Powers on, drives, brakes, charges and parks a simulated vehicle over an in-memory bus, printing the vehicle report once per second")
                .arg(
                    Arg::with_name("duration")
                        .short("d")
                        .long("duration")
                        .value_name("SECONDS")
                        .help("How long to run before shutting down")
                        .takes_value(true)
                        .default_value(DEFAULT_DURATION_SECS)
                        .validator(|v| match v.parse::<u64>() {
                            Ok(_) => Ok(()),
                            Err(_) => Err("Duration must be a whole number of seconds".into()),
                        }),
                )
                .arg(
                    Arg::with_name("uplink")
                        .long("uplink")
                        .help("Print uplinked JSON reports on the telemetry interval"),
                ),
        )
        .subcommand(SubCommand::with_name("ids").about("📋 List bus identifiers and payload sizes"))
        .subcommand(
            SubCommand::with_name("decode")
                .about("🔍 Decode a single bus frame")
                .arg(Arg::with_name("id").help("Identifier, e.g. 0x310").required(true))
                .arg(
                    Arg::with_name("payload")
                        .help("Payload bytes in hex, e.g. \"0A 00 01 00\"")
                        .required(true)
                        .multiple(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("command")
                .about("🕹️  Encode a vehicle command frame")
                .arg(
                    Arg::with_name("accel")
                        .long("accel")
                        .value_name("PERCENT")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("brake")
                        .long("brake")
                        .value_name("PERCENT")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("mode")
                        .long("mode")
                        .takes_value(true)
                        .possible_values(&["eco", "normal", "sport", "reverse"]),
                )
                .arg(
                    Arg::with_name("request")
                        .long("request")
                        .takes_value(true)
                        .possible_values(&[
                            "none",
                            "power-on",
                            "power-off",
                            "fault-ack",
                            "emergency-stop",
                            "emergency-reset",
                            "trip-reset",
                        ])
                        .default_value("none"),
                ),
        )
        .get_matches();

    let level = if matches.is_present("verbose") { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt().with_max_level(level).init();

    let format = matches.value_of("format").unwrap_or("table");
    let config = match matches.value_of("config") {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };

    match matches.subcommand() {
        ("simulate", Some(sub_matches)) => handle_simulate(sub_matches, config, format).await?,
        ("ids", _) => print_identifier_table(format)?,
        ("decode", Some(sub_matches)) => handle_decode(sub_matches, format)?,
        ("command", Some(sub_matches)) => handle_command(sub_matches)?,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Run the simulated vehicle", "evbus simulate".bright_cyan());
            println!("  {} List bus identifiers", "evbus ids".bright_cyan());
            println!("  {} Decode a frame", "evbus decode 0x310 0A 00 01 00".bright_cyan());
        }
    }

    Ok(())
}

struct StdoutSink;

impl TelemetrySink for StdoutSink {
    fn publish(&mut self, payload: &str) -> Result<(), DriverError> {
        println!("{} {}", "📡".bright_blue(), payload.dimmed());
        Ok(())
    }
}

enum ScriptStep {
    Command(VehicleCommand),
    PlugIn(ConnectorType),
    Unplug,
}

/// Feed a fixed drive cycle into the simulated vehicle and its bus.
async fn drive_script(sim: SimulatedVehicle, bus: LoopbackBus) {
    let script = [
        (500, ScriptStep::Command(VehicleCommand::request(ControlRequest::PowerOn))),
        (1_000, ScriptStep::Command(VehicleCommand::accelerate(40.0).with_mode(DriveMode::Normal))),
        (5_000, ScriptStep::Command(VehicleCommand::brake(60.0))),
        (7_000, ScriptStep::Command(VehicleCommand::coast())),
        (8_000, ScriptStep::PlugIn(ConnectorType::Ccs2)),
        (12_000, ScriptStep::Unplug),
        (13_000, ScriptStep::Command(VehicleCommand::request(ControlRequest::PowerOff))),
    ];

    let start = Instant::now();
    for (at_ms, step) in script {
        time::sleep_until(start + Duration::from_millis(at_ms)).await;
        match step {
            ScriptStep::Command(command) => bus.inject(protocol::encode_command(&command).frame),
            ScriptStep::PlugIn(connector) => sim.plug_in(connector),
            ScriptStep::Unplug => sim.unplug(),
        }
    }
}

async fn handle_simulate(
    matches: &ArgMatches<'_>,
    config: CoreConfig,
    format: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let seconds: u64 = matches.value_of("duration").unwrap_or(DEFAULT_DURATION_SECS).parse()?;

    let clock = Clock::new();
    let sim = SimulatedVehicle::with_layout(clock, config.sensors.clone());
    let bus = LoopbackBus::new();

    let mut scheduler = Scheduler::new(config, sim.drivers(Box::new(bus.clone())))?.with_clock(clock);
    if matches.is_present("uplink") {
        scheduler = scheduler.with_uplink(Box::new(StdoutSink));
    }
    let mut reports = scheduler.reports();

    println!("{} {}", "🚗".bright_blue(), "Simulated vehicle".bright_blue().bold());
    println!("{}", "=================".bright_blue());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(scheduler.run(shutdown_rx));
    let script = tokio::spawn(drive_script(sim.clone(), bus.clone()));

    let deadline = time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut display = time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = &mut ctrl_c => {
                println!("{}", "Ctrl+C received, shutting down".yellow());
                break;
            }
            _ = display.tick() => {
                let latest = reports.borrow_and_update().clone();
                if let Some(report) = latest {
                    print_report(&report, format)?;
                }
            }
        }
    }

    script.abort();
    let _ = shutdown_tx.send(true);
    let summary = run.await??;
    print_summary(&summary, bus.take_sent().len(), format)?;
    Ok(())
}

fn state_label(state: VehicleState) -> ColoredString {
    match state {
        VehicleState::Parked => state.name().dimmed(),
        VehicleState::Ready => state.name().bright_green(),
        VehicleState::Driving => state.name().bright_cyan(),
        VehicleState::Charging => state.name().bright_yellow(),
        VehicleState::Error => state.name().bright_red(),
        VehicleState::Emergency => state.name().bright_red().bold(),
    }
}

fn status_label(status: TemperatureStatus) -> ColoredString {
    match status {
        TemperatureStatus::Normal => "OK".green(),
        TemperatureStatus::Warning => "WARN".yellow(),
        TemperatureStatus::Fault => "FAULT".bright_red(),
    }
}

fn print_report(report: &VehicleReport, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let soc = report.battery.snapshot().map_or(0.0, |b| b.soc_percent);
    match format {
        "json" => println!("{}", serde_json::to_string(report)?),
        "compact" => println!(
            "{} {} {:.1}km/h {:.1}%",
            report.timestamp,
            report.state.name(),
            report.speed_kmh,
            soc
        ),
        _ => {
            println!(
                "{:>7} ms  {:<10} {:<7} {:>6.1} km/h  SOC {:>5.1}%  range {:>6.1} km  temps B:{} M:{} C:{}  motor {:?}",
                report.timestamp,
                state_label(report.state),
                format!("{:?}", report.drive_mode),
                report.speed_kmh,
                soc,
                report.energy.range_km(),
                status_label(report.temperatures.battery),
                status_label(report.temperatures.motor),
                status_label(report.temperatures.charging),
                report.outbound.motor(),
            );
            if let Some(seconds) = report.time_to_full_s {
                println!("  {} full in {:.0} min", "🔌".bright_green(), seconds / 60.0);
            }
            if report.faults.any() {
                println!("  {} faults: {:?} ({} active events)", "⚠️".yellow(), report.faults, report.active_safety_events);
            }
        }
    }
    Ok(())
}

fn print_summary(summary: &RunSummary, frames_sent: usize, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!();
    println!("{} {}", "📊".bright_blue(), "Run Summary".bright_blue().bold());
    println!("{} {}", "Final state:".bright_white(), state_label(summary.final_state));
    println!("{} {}", "Ticks:".bright_white(), summary.ticks);
    println!("{} {}", "Transitions:".bright_white(), summary.transitions);
    println!("{} {}", "Rejected commands:".bright_white(), summary.rejected_commands);
    println!("{} {}", "Driver failures:".bright_white(), summary.driver_failures);
    println!(
        "{} {} sent, {} dropped, {} saturated",
        "Frames:".bright_white(),
        frames_sent,
        summary.protocol.frames_dropped,
        summary.protocol.saturated_frames
    );
    println!(
        "{} {:.3} km, {:.3} kWh used, {:.3} kWh regenerated",
        "Trip:".bright_white(),
        summary.energy.distance_km(),
        summary.energy.energy_consumed_kwh(),
        summary.energy.energy_regenerated_kwh()
    );
    println!("{} {}", "🚀".green(), "Coordination core stopped".bright_green());
    Ok(())
}

fn print_identifier_table(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut kinds = FrameKind::ALL;
    kinds.sort_by_key(|kind| kind.id());

    if format == "json" {
        let table: Vec<_> = kinds
            .iter()
            .map(|kind| serde_json::json!({ "id": kind.id(), "name": kind.name(), "length": kind.payload_len() }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("{} {}", "📋".bright_blue(), "Bus Identifiers".bright_blue().bold());
    for kind in kinds {
        println!(
            "  {}  {:<24} {} bytes",
            format!("0x{:03X}", kind.id()).bright_cyan(),
            kind.name(),
            kind.payload_len()
        );
    }
    Ok(())
}

fn parse_id(text: &str) -> Result<u16, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u16::from_str_radix(digits, 16).map_err(|e| format!("invalid identifier '{text}': {e}"))
}

fn parse_payload<'a>(parts: impl Iterator<Item = &'a str>) -> Result<Vec<u8>, String> {
    let hex: String = parts.flat_map(|part| part.chars()).filter(|c| !c.is_whitespace()).collect();
    if let Some(bad) = hex.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(format!("payload '{hex}' contains non-hex character '{bad}'"));
    }
    if hex.len() % 2 != 0 {
        return Err(format!("payload '{hex}' has an odd number of hex digits"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("invalid payload byte '{}': {e}", &hex[i..i + 2])))
        .collect()
}

fn handle_decode(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let id = parse_id(matches.value_of("id").unwrap_or_default())?;
    let payload = parse_payload(matches.values_of("payload").into_iter().flatten())?;
    let frame = Frame::new(id, &payload)?;

    match protocol::decode(&frame) {
        Ok(message) => match format {
            "json" => println!("{}", serde_json::to_string_pretty(&message)?),
            _ => {
                println!("{} {}", "✅".green(), frame.to_string().bright_cyan());
                println!("{:#?}", message);
            }
        },
        Err(e) => println!("{} {} {}", "❌".red(), frame, e.to_string().bright_red()),
    }
    Ok(())
}

fn handle_command(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    let accel_percent: f32 = matches.value_of("accel").unwrap_or("0").parse()?;
    let brake_percent: f32 = matches.value_of("brake").unwrap_or("0").parse()?;
    let drive_mode = match matches.value_of("mode") {
        Some("eco") => Some(DriveMode::Eco),
        Some("normal") => Some(DriveMode::Normal),
        Some("sport") => Some(DriveMode::Sport),
        Some("reverse") => Some(DriveMode::Reverse),
        _ => None,
    };
    let request = match matches.value_of("request").unwrap_or("none") {
        "power-on" => ControlRequest::PowerOn,
        "power-off" => ControlRequest::PowerOff,
        "fault-ack" => ControlRequest::FaultAck,
        "emergency-stop" => ControlRequest::EmergencyStop,
        "emergency-reset" => ControlRequest::EmergencyReset,
        "trip-reset" => ControlRequest::TripReset,
        _ => ControlRequest::None,
    };

    let encoded = protocol::encode_command(&VehicleCommand {
        accel_percent,
        brake_percent,
        drive_mode,
        request,
    });
    println!("{}", encoded.frame.to_string().bright_cyan());
    if encoded.is_saturated() {
        println!("{} saturated: {:?}", "⚠️".yellow(), encoded.saturated);
    }
    Ok(())
}
