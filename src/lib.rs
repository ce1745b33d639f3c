//! # evbus
//!
//! Coordination core for an electric vehicle: a state machine that keeps the
//! battery, motor and charger in a consistent operating state, and a
//! fixed-layout bus protocol that exposes that state for monitoring and
//! control.
//!
//! ## Features
//!
//! - **Vehicle state machine**: Parked, Ready, Driving, Charging, Error and
//!   Emergency with prioritised transitions and drive/charge interlocks
//! - **Temperature aggregation**: declarative thresholds with staleness and
//!   worst-case rollup per subsystem
//! - **Bus protocol**: 8-byte frames with fixed-point scaling and observable
//!   saturation
//! - **Polling scheduler**: timeout-bounded driver polling on tokio with
//!   latest-value channels and cooperative shutdown
//! - **Bounded memory**: `heapless` collections throughout the core
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use evbus::{CoreConfig, LoopbackBus, Scheduler, SimulatedVehicle};
//! use evbus::subsystems::Clock;
//! use tokio::sync::watch;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let clock = Clock::new();
//! let sim = SimulatedVehicle::new(clock);
//! let scheduler = Scheduler::new(CoreConfig::default(), sim.drivers(Box::new(LoopbackBus::new())))?
//!     .with_clock(clock);
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let run = tokio::spawn(scheduler.run(shutdown_rx));
//! // ...
//! shutdown_tx.send(true)?;
//! let summary = run.await??;
//! println!("{} ticks, final state {}", summary.ticks, summary.final_state);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`thermal`] - Temperature classification and aggregation
//! - [`subsystems`] - Battery, motor and charging snapshots and driver traits
//! - [`protocol`] - Frame identifiers, layouts, encode and decode
//! - [`vehicle`] - State machine and outbound command
//! - [`safety`] - Fault assessment, safety events and interlock escalation
//! - [`energy`] - Trip distance, energy and range
//! - [`scheduler`] - Driver polling and the coordination loop
//! - [`telemetry`] - Report fan-out and uplink

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod bus;
pub mod config;
pub mod energy;
pub mod fault;
pub mod protocol;
pub mod safety;
pub mod scheduler;
pub mod sim;
pub mod subsystems;
pub mod telemetry;
pub mod thermal;
pub mod vehicle;

pub use bus::{BusTransport, LoopbackBus};
pub use config::{ConfigError, CoreConfig};
pub use protocol::{Frame, Message, ProtocolError, ProtocolHandler};
pub use scheduler::{Drivers, RunSummary, Scheduler, SchedulerError};
pub use sim::SimulatedVehicle;
pub use telemetry::{TelemetrySink, VehicleReport};
pub use thermal::{TemperatureAggregator, ThermalReport};
pub use vehicle::{OutboundCommand, VehicleCommand, VehicleState, VehicleStateMachine};
