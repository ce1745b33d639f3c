//! Polling loop.
//!
//! One task per driver publishes [`Polled`] snapshots on latest-value
//! channels; a single coordination task owns the [`VehicleStateMachine`] and
//! ticks it on a fixed period. Every driver call is blocking, so it runs on
//! the blocking pool under a timeout and can never stall the coordination
//! tick.

use crate::bus::BusTransport;
use crate::config::{ConfigError, CoreConfig};
use crate::energy::EnergyLedger;
use crate::protocol::{Frame, ProtocolHandler, ProtocolStats};
use crate::subsystems::{
    BatteryDriver, BatterySnapshot, ChargingDriver, ChargingSnapshot, Clock, DriverError, MotorDriver,
    MotorSnapshot, Polled, TemperatureSource,
};
use crate::telemetry::{spawn_uplink, ReportPublisher, TelemetrySink, VehicleReport};
use crate::thermal::{ReadingMap, TemperatureAggregator};
use crate::vehicle::{OutboundCommand, TickInput, VehicleState, VehicleStateMachine};
use heapless::Vec;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

const INBOUND_QUEUE_CAPACITY: usize = 64;
const OUTBOUND_QUEUE_CAPACITY: usize = 128;
const BUS_BATCH: usize = 32;
const BUS_POLLS_PER_TICK: u32 = 4;
const LOCK_RETRY: Duration = Duration::from_millis(1);

type Shared<D> = Arc<Mutex<Box<D>>>;

/// The hardware the scheduler drives. Each driver is only ever called from
/// the blocking pool.
pub struct Drivers {
    pub battery: Box<dyn BatteryDriver>,
    pub motor: Box<dyn MotorDriver>,
    pub charging: Box<dyn ChargingDriver>,
    pub temperatures: Box<dyn TemperatureSource>,
    pub bus: Box<dyn BusTransport>,
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("task {task} failed: {reason}")]
    TaskJoin { task: &'static str, reason: String },
}

/// What a completed run did.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub ticks: u64,
    pub transitions: u32,
    pub final_state: VehicleState,
    pub rejected_commands: u32,
    pub driver_failures: u32,
    pub protocol: ProtocolStats,
    pub energy: EnergyLedger,
}

/// Wait at most `budget` for the driver lock.
///
/// A hung call keeps the lock, so callers behind it give up with
/// [`DriverError::Busy`] instead of parking a blocking thread indefinitely.
fn acquire<D: ?Sized>(driver: &Mutex<Box<D>>, budget: Duration) -> Result<MutexGuard<'_, Box<D>>, DriverError> {
    let deadline = std::time::Instant::now() + budget;
    loop {
        match driver.try_lock() {
            Ok(guard) => return Ok(guard),
            Err(TryLockError::Poisoned(_)) => return Err(DriverError::Poisoned),
            Err(TryLockError::WouldBlock) if std::time::Instant::now() >= deadline => {
                return Err(DriverError::Busy)
            }
            Err(TryLockError::WouldBlock) => std::thread::sleep(LOCK_RETRY),
        }
    }
}

/// Run a blocking driver call on the blocking pool, bounded by `timeout`.
///
/// A timed-out call keeps running in the background and holds the driver
/// lock until it returns. Later calls spend at most half their timeout
/// waiting for that lock.
pub(crate) async fn call_blocking<D, R, F>(driver: &Shared<D>, timeout: Duration, call: F) -> Result<R, DriverError>
where
    D: ?Sized + Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut D) -> Result<R, DriverError> + Send + 'static,
{
    let driver = Arc::clone(driver);
    let task = tokio::task::spawn_blocking(move || {
        let mut guard = acquire(&*driver, timeout / 2)?;
        call(&mut **guard)
    });

    match time::timeout(timeout, task).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(DriverError::Io(e.to_string())),
        Err(_) => Err(DriverError::Timeout(timeout.as_millis() as u64)),
    }
}

/// Shared by every polling task.
#[derive(Clone)]
struct PollContext {
    clock: Clock,
    period: Duration,
    timeout: Duration,
    failures: Arc<AtomicU32>,
    stop: watch::Receiver<bool>,
}

async fn poll_once<D, T, F>(name: &'static str, driver: &Shared<D>, read: F, tx: &watch::Sender<Polled<T>>, ctx: &PollContext)
where
    D: ?Sized + Send + 'static,
    T: Send + 'static,
    F: FnOnce(&mut D) -> Result<T, DriverError> + Send + 'static,
{
    match call_blocking(driver, ctx.timeout, read).await {
        Ok(snapshot) => {
            let now = ctx.clock.now_ms();
            tx.send_modify(|polled| polled.update(snapshot, now));
        }
        Err(e) => {
            ctx.failures.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️  {} poll failed: {}", name, e);
            tx.send_modify(Polled::record_failure);
        }
    }
}

fn spawn_poller<D, T, F>(
    name: &'static str,
    driver: Shared<D>,
    read: F,
    tx: watch::Sender<Polled<T>>,
    ctx: PollContext,
) -> JoinHandle<()>
where
    D: ?Sized + Send + 'static,
    T: Send + Sync + 'static,
    F: Fn(&mut D) -> Result<T, DriverError> + Copy + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut stop = ctx.stop.clone();
        let mut ticker = time::interval(ctx.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The priming poll already covered the immediate first tick.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => poll_once(name, &driver, read, &tx, &ctx).await,
                _ = stop.changed() => break,
            }
        }
        debug!("{} poller stopped", name);
    })
}

fn spawn_bus_reader(
    bus: Shared<dyn BusTransport>,
    inbound: mpsc::Sender<Frame>,
    dropped: Arc<AtomicU32>,
    ctx: PollContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stop = ctx.stop.clone();
        let period = (ctx.period / BUS_POLLS_PER_TICK).max(Duration::from_millis(1));
        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = stop.changed() => break,
            }

            let received = call_blocking(&bus, ctx.timeout, |bus| {
                let mut frames: Vec<Frame, BUS_BATCH> = Vec::new();
                while !frames.is_full() {
                    match bus.receive()? {
                        Some(frame) => {
                            let _ = frames.push(frame);
                        }
                        None => break,
                    }
                }
                Ok(frames)
            })
            .await;

            match received {
                Ok(frames) => {
                    for frame in frames {
                        match inbound.try_send(frame) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(frame)) => {
                                dropped.fetch_add(1, Ordering::Relaxed);
                                warn!("⚠️  Inbound queue full, dropping {}", frame);
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => return,
                        }
                    }
                }
                Err(e) => {
                    ctx.failures.fetch_add(1, Ordering::Relaxed);
                    warn!("⚠️  Bus receive failed: {}", e);
                }
            }
        }
        debug!("Bus reader stopped");
    })
}

/// Drains the outbound queue until every sender is gone, so frames queued
/// during shutdown still go out.
fn spawn_bus_writer(
    bus: Shared<dyn BusTransport>,
    mut outbound: mpsc::Receiver<Frame>,
    dropped: Arc<AtomicU32>,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(first) = outbound.recv().await {
            let mut batch: Vec<Frame, BUS_BATCH> = Vec::new();
            let _ = batch.push(first);
            while !batch.is_full() {
                match outbound.try_recv() {
                    Ok(frame) => {
                        let _ = batch.push(frame);
                    }
                    Err(_) => break,
                }
            }

            let count = batch.len() as u32;
            let sent = call_blocking(&bus, timeout, move |bus| {
                for frame in &batch {
                    bus.send(frame)?;
                }
                Ok(())
            })
            .await;

            if let Err(e) = sent {
                dropped.fetch_add(count, Ordering::Relaxed);
                warn!("⚠️  Bus send failed, {} frames dropped: {}", count, e);
            }
        }
        debug!("Bus writer stopped");
    })
}

/// Applies the latest outbound command. Whatever is being switched off goes
/// first, so motor and charger are never enabled together even briefly.
///
/// Until a command has been applied in full it is re-applied once per
/// period, so a failed disable cannot leave hardware energized.
fn spawn_actuator(
    motor: Shared<dyn MotorDriver>,
    charging: Shared<dyn ChargingDriver>,
    mut commands: watch::Receiver<OutboundCommand>,
    ctx: PollContext,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stop = ctx.stop.clone();
        let mut retry = time::interval(ctx.period);
        retry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut applied: Option<OutboundCommand> = None;

        loop {
            tokio::select! {
                changed = commands.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let command = *commands.borrow_and_update();
                    applied = apply_outbound(&motor, &charging, command, &ctx).await.then_some(command);
                }
                _ = retry.tick() => {
                    let command = *commands.borrow();
                    if applied != Some(command) {
                        debug!("Re-applying outbound command {:?}", command);
                        applied = apply_outbound(&motor, &charging, command, &ctx).await.then_some(command);
                    }
                }
                _ = stop.changed() => break,
            }
        }

        let last = *commands.borrow();
        apply_outbound(&motor, &charging, last, &ctx).await;
        debug!("Actuator stopped");
    })
}

/// True when both drivers accepted the command.
async fn apply_outbound(
    motor: &Shared<dyn MotorDriver>,
    charging: &Shared<dyn ChargingDriver>,
    command: OutboundCommand,
    ctx: &PollContext,
) -> bool {
    let motor_command = command.motor();
    let enable = command.charging_enable();

    let results = if enable {
        [
            call_blocking(motor, ctx.timeout, move |m| m.send_motor_command(motor_command)).await,
            call_blocking(charging, ctx.timeout, move |c| c.set_charging_enabled(true)).await,
        ]
    } else {
        [
            call_blocking(charging, ctx.timeout, move |c| c.set_charging_enabled(false)).await,
            call_blocking(motor, ctx.timeout, move |m| m.send_motor_command(motor_command)).await,
        ]
    };

    let mut complete = true;
    for result in results {
        if let Err(e) = result {
            complete = false;
            ctx.failures.fetch_add(1, Ordering::Relaxed);
            warn!("⚠️  Failed to apply outbound command: {}", e);
        }
    }
    complete
}

/// State owned by the coordination task.
struct Coordinator {
    vehicle: VehicleStateMachine,
    aggregator: TemperatureAggregator,
    protocol: ProtocolHandler,
    reports: ReportPublisher,
    clock: Clock,

    battery: watch::Receiver<Polled<BatterySnapshot>>,
    motor: watch::Receiver<Polled<MotorSnapshot>>,
    charging: watch::Receiver<Polled<ChargingSnapshot>>,
    temperatures: watch::Receiver<Polled<ReadingMap>>,

    inbound: mpsc::Receiver<Frame>,
    outbound_frames: mpsc::Sender<Frame>,
    outbound: watch::Sender<OutboundCommand>,
    dropped: Arc<AtomicU32>,
    ticks: u64,
}

impl Coordinator {
    fn tick(&mut self) {
        let now = self.clock.now_ms();

        let mut commands = Vec::new();
        while !commands.is_full() {
            let Ok(frame) = self.inbound.try_recv() else {
                break;
            };
            if let Some(command) = self.protocol.decode_command(&frame) {
                let _ = commands.push(command);
            }
        }

        let readings = self.temperatures.borrow().snapshot.clone().unwrap_or_default();
        let thermal = self.aggregator.evaluate(&readings, now);

        let input = TickInput {
            now_ms: now,
            battery: self.battery.borrow().clone(),
            motor: self.motor.borrow().clone(),
            charging: self.charging.borrow().clone(),
            thermal: thermal.clone(),
            commands,
        };
        let outcome = self.vehicle.tick(input);
        self.ticks += 1;

        for violation in &outcome.rejected {
            debug!("Rejected command: {}", violation);
        }

        self.publish_outbound(outcome.outbound);
        let frames = self.protocol.encode_tick(&self.vehicle, &thermal);
        self.transmit(frames);
        self.collect_dropped();
        self.reports
            .publish(&self.vehicle, &thermal, self.protocol.stats(), now);

        debug!(
            "Tick {} state={} speed={:.1} km/h outbound={:?}",
            self.ticks,
            outcome.state,
            self.vehicle.speed_kmh(),
            outcome.outbound
        );
    }

    fn publish_outbound(&self, command: OutboundCommand) {
        self.outbound.send_if_modified(|current| {
            if *current == command {
                false
            } else {
                *current = command;
                true
            }
        });
    }

    fn transmit<I: IntoIterator<Item = Frame>>(&mut self, frames: I) {
        let mut dropped = 0_u32;
        for frame in frames {
            if self.outbound_frames.try_send(frame).is_err() {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("⚠️  Outbound queue full, dropped {} frames", dropped);
            self.protocol.record_dropped(dropped);
        }
    }

    fn collect_dropped(&mut self) {
        let dropped = self.dropped.swap(0, Ordering::Relaxed);
        if dropped > 0 {
            self.protocol.record_dropped(dropped);
        }
    }

    /// Release the motor, disable charging and announce it on the bus.
    fn shutdown(&mut self) {
        self.vehicle.shutdown();
        self.publish_outbound(OutboundCommand::safe());
        let frames = self.protocol.encode_final(&self.vehicle);
        self.transmit(frames);
    }
}

pub struct Scheduler {
    config: CoreConfig,
    drivers: Drivers,
    reports: ReportPublisher,
    uplink: Option<Box<dyn TelemetrySink>>,
    energy: Option<EnergyLedger>,
    clock: Clock,
}

impl Scheduler {
    pub fn new(config: CoreConfig, drivers: Drivers) -> Result<Self, SchedulerError> {
        config.validate()?;
        Ok(Self {
            config,
            drivers,
            reports: ReportPublisher::new(),
            uplink: None,
            energy: None,
            clock: Clock::new(),
        })
    }

    /// Use `clock` for snapshot timestamps, e.g. one shared with drivers.
    #[must_use]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Forward reports to `sink` every `telemetry_interval_ms`.
    #[must_use]
    pub fn with_uplink(mut self, sink: Box<dyn TelemetrySink>) -> Self {
        self.uplink = Some(sink);
        self
    }

    /// Continue trip counters from an earlier run.
    #[must_use]
    pub fn with_energy(mut self, ledger: EnergyLedger) -> Self {
        self.energy = Some(ledger);
        self
    }

    /// Latest report after each tick; `None` until the first tick.
    pub fn reports(&self) -> watch::Receiver<Option<VehicleReport>> {
        self.reports.subscribe()
    }

    /// Run until `shutdown` turns true or its sender is dropped.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary, SchedulerError> {
        let Scheduler {
            config,
            drivers,
            reports,
            uplink,
            energy,
            clock,
        } = self;
        let settings = &config.scheduler;
        let (period, timeout) = (settings.tick_period(), settings.driver_timeout());

        let battery: Shared<dyn BatteryDriver> = Arc::new(Mutex::new(drivers.battery));
        let motor: Shared<dyn MotorDriver> = Arc::new(Mutex::new(drivers.motor));
        let charging: Shared<dyn ChargingDriver> = Arc::new(Mutex::new(drivers.charging));
        let temperatures: Shared<dyn TemperatureSource> = Arc::new(Mutex::new(drivers.temperatures));
        let bus: Shared<dyn BusTransport> = Arc::new(Mutex::new(drivers.bus));

        let (stop_tx, stop_rx) = watch::channel(false);
        let failures = Arc::new(AtomicU32::new(0));
        let dropped = Arc::new(AtomicU32::new(0));
        let ctx = PollContext {
            clock,
            period,
            timeout,
            failures: Arc::clone(&failures),
            stop: stop_rx.clone(),
        };

        let now = clock.now_ms();
        let (battery_tx, battery_rx) = watch::channel(Polled::empty(now));
        let (motor_tx, motor_rx) = watch::channel(Polled::empty(now));
        let (charging_tx, charging_rx) = watch::channel(Polled::empty(now));
        let (temperature_tx, temperature_rx) = watch::channel(Polled::empty(now));

        let read_battery = |d: &mut (dyn BatteryDriver + 'static)| d.read_battery();
        let read_motor = |d: &mut (dyn MotorDriver + 'static)| d.read_motor();
        let read_charging = |d: &mut (dyn ChargingDriver + 'static)| d.read_charging();
        let read_temperatures = |d: &mut (dyn TemperatureSource + 'static)| d.read_temperatures();

        poll_once("battery", &battery, read_battery, &battery_tx, &ctx).await;
        poll_once("motor", &motor, read_motor, &motor_tx, &ctx).await;
        poll_once("charging", &charging, read_charging, &charging_tx, &ctx).await;
        poll_once("temperatures", &temperatures, read_temperatures, &temperature_tx, &ctx).await;
        info!("✅ Priming poll complete");

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (frames_tx, frames_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = watch::channel(OutboundCommand::safe());

        let mut tasks: std::vec::Vec<(&'static str, JoinHandle<()>)> = vec![
            ("battery", spawn_poller("battery", battery, read_battery, battery_tx, ctx.clone())),
            ("motor", spawn_poller("motor", Arc::clone(&motor), read_motor, motor_tx, ctx.clone())),
            (
                "charging",
                spawn_poller("charging", Arc::clone(&charging), read_charging, charging_tx, ctx.clone()),
            ),
            (
                "temperatures",
                spawn_poller("temperatures", temperatures, read_temperatures, temperature_tx, ctx.clone()),
            ),
            (
                "bus-reader",
                spawn_bus_reader(Arc::clone(&bus), inbound_tx, Arc::clone(&dropped), ctx.clone()),
            ),
            ("bus-writer", spawn_bus_writer(bus, frames_rx, Arc::clone(&dropped), timeout)),
            ("actuator", spawn_actuator(motor, charging, outbound_rx, ctx.clone())),
        ];

        if let Some(sink) = uplink {
            tasks.push((
                "uplink",
                spawn_uplink(
                    reports.subscribe(),
                    sink,
                    settings.telemetry_interval(),
                    timeout,
                    stop_rx.clone(),
                ),
            ));
        }

        let mut vehicle = VehicleStateMachine::new(&config);
        if let Some(ledger) = energy {
            vehicle.restore_energy(ledger);
        }

        let mut coordinator = Coordinator {
            vehicle,
            aggregator: TemperatureAggregator::new(
                config.sensors.clone(),
                config.thresholds.clone(),
                config.staleness.temperature_ms,
            ),
            protocol: ProtocolHandler::new(),
            reports,
            clock,
            battery: battery_rx,
            motor: motor_rx,
            charging: charging_rx,
            temperatures: temperature_rx,
            inbound: inbound_rx,
            outbound_frames: frames_tx,
            outbound: outbound_tx,
            dropped: Arc::clone(&dropped),
            ticks: 0,
        };

        let mut ticker = time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("🚗 Coordination loop started ({} ms period)", period.as_millis());

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => coordinator.tick(),
            }
        }

        info!("🔌 Shutdown requested after {} ticks", coordinator.ticks);
        coordinator.shutdown();
        let _ = stop_tx.send(true);

        let Coordinator {
            vehicle,
            mut protocol,
            outbound_frames,
            outbound,
            ticks,
            ..
        } = coordinator;
        drop(outbound_frames);

        let join_limit = period + timeout * 4;
        let mut join_error = None;
        for (task, handle) in tasks {
            match time::timeout(join_limit, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Task {} failed: {}", task, e);
                    join_error.get_or_insert(SchedulerError::TaskJoin {
                        task,
                        reason: e.to_string(),
                    });
                }
                Err(_) => warn!("Task {} did not stop within {:?}", task, join_limit),
            }
        }
        drop(outbound);

        if let Some(e) = join_error {
            return Err(e);
        }

        protocol.record_dropped(dropped.swap(0, Ordering::Relaxed));
        let summary = RunSummary {
            ticks,
            transitions: vehicle.transitions(),
            final_state: vehicle.state(),
            rejected_commands: vehicle.rejected_total(),
            driver_failures: failures.load(Ordering::Relaxed),
            protocol: protocol.stats().clone(),
            energy: vehicle.energy().clone(),
        };
        info!(
            "✅ Stopped in {} after {} ticks ({} transitions, {} driver failures)",
            summary.final_state, summary.ticks, summary.transitions, summary.driver_failures
        );
        Ok(summary)
    }
}
