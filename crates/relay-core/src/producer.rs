//! Producer-side threads feeding sample queues.
//!
//! Producers are plain OS threads sharing one stop signal. A producer
//! finishes the tick it is in before observing the signal, and
//! [`Producers::stop_and_join`] waits for every thread.
//!
//! The bundled simulators stand in for real collectors:
//! - sensors random-walk a reading and derive a status bitmask
//!   (0 ok, 1 warning, 2 critical, 4 offline)
//! - activity simulators emit keys/clicks per minute, pointer travel
//!   and window titles

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use relay_common::sample::format_timestamp;
use relay_common::{
    PressureReading, RawTelemetry, SampleValue, StreamKind, TelemetryType, TemperatureReading,
    VelocityReading,
};

use crate::sample_queue::SampleQueue;

const STOP_POLL: Duration = Duration::from_millis(50);

/// A set of producer threads sharing one stop signal.
pub struct Producers {
    stop: Arc<AtomicBool>,
    threads: Vec<(String, JoinHandle<u64>)>,
}

impl Default for Producers {
    fn default() -> Self {
        Self::new()
    }
}

impl Producers {
    pub fn new() -> Self {
        Self {
            stop: Arc::new(AtomicBool::new(false)),
            threads: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Run `tick` every `period` on a new thread until stopped.
    pub fn spawn<F>(
        &mut self,
        name: impl Into<String>,
        period: Duration,
        mut tick: F,
    ) -> std::io::Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        let stop = Arc::clone(&self.stop);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let mut ticks = 0u64;
            while wait_or_stop(period, &stop) {
                tick();
                ticks += 1;
            }
            ticks
        })?;
        debug!(producer = %name, period_ms = period.as_millis() as u64, "producer started");
        self.threads.push((name, handle));
        Ok(())
    }

    /// Spawn a simulated sensor writing frames into `queue`.
    pub fn spawn_sensor(
        &mut self,
        spec: SensorSpec,
        queue: Arc<SampleQueue<RawTelemetry>>,
    ) -> std::io::Result<()> {
        let mut sim = SensorSimulator::new(spec.clone());
        self.spawn(spec.sensor_id, spec.period, move || queue.put(sim.next_frame()))
    }

    /// Spawn a simulated activity collector for a metric kind.
    pub fn spawn_activity(
        &mut self,
        kind: StreamKind,
        period: Duration,
        queue: Arc<SampleQueue<SampleValue>>,
    ) -> std::io::Result<()> {
        let mut sim = ActivitySimulator::new(kind);
        self.spawn(format!("activity-{}", kind), period, move || {
            if let Some(value) = sim.next_value() {
                queue.put(value);
            }
        })
    }

    /// Signal every producer and wait for them. Returns total ticks.
    pub fn stop_and_join(self) -> u64 {
        self.stop.store(true, Ordering::Release);
        let mut total = 0;
        for (name, handle) in self.threads {
            match handle.join() {
                Ok(ticks) => {
                    debug!(producer = %name, ticks, "producer stopped");
                    total += ticks;
                }
                Err(_) => warn!(producer = %name, "producer thread panicked"),
            }
        }
        info!(ticks = total, "all producers stopped");
        total
    }
}

/// Sleep for `period` in short slices. Returns false once stop is set.
fn wait_or_stop(period: Duration, stop: &AtomicBool) -> bool {
    let deadline = Instant::now() + period;
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(STOP_POLL));
    }
}

// ── Sensors ─────────────────────────────────────────────────────────────

/// Static description of a simulated sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorSpec {
    pub sensor_id: &'static str,
    pub telemetry_type: TelemetryType,
    pub subsystem: &'static str,
    pub unit: &'static str,
    pub period: Duration,
}

const fn sensor(
    sensor_id: &'static str,
    telemetry_type: TelemetryType,
    subsystem: &'static str,
    unit: &'static str,
    period_ms: u64,
) -> SensorSpec {
    SensorSpec {
        sensor_id,
        telemetry_type,
        subsystem,
        unit,
        period: Duration::from_millis(period_ms),
    }
}

/// The default sensor fleet.
pub fn default_sensors() -> Vec<SensorSpec> {
    vec![
        sensor("TEMP_ENG_001", TelemetryType::Temperature, "ENGINE", "celsius", 300),
        sensor("TEMP_FUEL_001", TelemetryType::Temperature, "FUEL_TANK", "celsius", 300),
        sensor("PRESS_ENG_001", TelemetryType::Pressure, "ENGINE", "bar", 450),
        sensor("PRESS_FUEL_002", TelemetryType::Pressure, "FUEL_TANK", "bar", 350),
        sensor("VELO_STAGE1_001", TelemetryType::Velocity, "STAGE1", "m/s", 350),
    ]
}

pub const STATUS_OK: i64 = 0;
pub const STATUS_WARNING: i64 = 1;
pub const STATUS_CRITICAL: i64 = 2;
pub const STATUS_OFFLINE: i64 = 4;

pub fn temperature_status(celsius: f64) -> i64 {
    if (-10.0..=65.0).contains(&celsius) {
        STATUS_OK
    } else if (-20.0..=75.0).contains(&celsius) {
        STATUS_WARNING
    } else if (-30.0..=85.0).contains(&celsius) {
        STATUS_CRITICAL
    } else {
        STATUS_OFFLINE
    }
}

pub fn pressure_status(bar: f64) -> i64 {
    if (180.0..=220.0).contains(&bar) {
        STATUS_OK
    } else if (140.0..=260.0).contains(&bar) {
        STATUS_WARNING
    } else if (100.0..=300.0).contains(&bar) {
        STATUS_CRITICAL
    } else {
        STATUS_OFFLINE
    }
}

pub fn velocity_status(magnitude: f64) -> i64 {
    if magnitude <= 12_000.0 {
        STATUS_OK
    } else if magnitude <= 14_000.0 {
        STATUS_WARNING
    } else if magnitude <= 15_000.0 {
        STATUS_CRITICAL
    } else {
        STATUS_OFFLINE
    }
}

/// Random-walk generator for one sensor.
pub struct SensorSimulator {
    spec: SensorSpec,
    rng: StdRng,
    reading: [f64; 3],
    sequence: i64,
}

impl SensorSimulator {
    pub fn new(spec: SensorSpec) -> Self {
        Self::with_rng(spec, StdRng::from_os_rng())
    }

    pub fn with_rng(spec: SensorSpec, rng: StdRng) -> Self {
        let reading = match spec.telemetry_type {
            TelemetryType::Temperature => [30.0, 0.0, 0.0],
            TelemetryType::Pressure => [200.0, 0.0, 0.0],
            TelemetryType::Velocity => [8000.0, 8000.0, 8000.0],
        };
        Self {
            spec,
            rng,
            reading,
            sequence: 0,
        }
    }

    /// Advance the walk and produce the next upstream frame.
    pub fn next_frame(&mut self) -> RawTelemetry {
        self.sequence += 1;
        let sensor_id = Some(self.spec.sensor_id.to_string());
        let subsystem = Some(self.spec.subsystem.to_string());
        let unit = Some(self.spec.unit.to_string());
        let mut frame = RawTelemetry {
            timestamp: Some(format_timestamp(&chrono::Utc::now())),
            type_hint: Some(self.spec.telemetry_type.as_str().to_string()),
            ..Default::default()
        };

        match self.spec.telemetry_type {
            TelemetryType::Temperature => {
                self.reading[0] += self.rng.random_range(-10.0..=10.0);
                let t = self.reading[0];
                frame.temperature = Some(TemperatureReading {
                    sensor_id,
                    subsystem,
                    temperature: Some(t),
                    unit,
                    status_bitmask: Some(temperature_status(t)),
                    sequence_number: Some(self.sequence),
                });
            }
            TelemetryType::Pressure => {
                self.reading[0] += self.rng.random_range(-5.0..=5.0);
                let p = self.reading[0];
                frame.pressure = Some(PressureReading {
                    sensor_id,
                    subsystem,
                    pressure: Some(p),
                    unit,
                    status_bitmask: Some(pressure_status(p)),
                    leak_detected: None,
                    sequence_number: Some(self.sequence),
                });
            }
            TelemetryType::Velocity => {
                for axis in self.reading.iter_mut() {
                    *axis += self.rng.random_range(-5.0..=5.0);
                }
                let [x, y, z] = self.reading;
                let magnitude = (x * x + y * y + z * z).sqrt();
                frame.velocity = Some(VelocityReading {
                    sensor_id,
                    subsystem,
                    velocity_x: Some(x),
                    velocity_y: Some(y),
                    velocity_z: Some(z),
                    unit,
                    vibration_mag: None,
                    status_bitmask: Some(velocity_status(magnitude)),
                    sequence_number: Some(self.sequence),
                });
            }
        }
        frame
    }
}

// ── Activity ────────────────────────────────────────────────────────────

const WINDOW_TITLES: [&str; 6] = [
    "Terminal",
    "Editor - main.rs",
    "Browser - Documentation",
    "Music - Now Playing",
    "Mail - Inbox",
    "Dashboard",
];

/// Default emission period per activity kind.
pub fn activity_period(kind: StreamKind) -> Duration {
    match kind {
        StreamKind::Kpm | StreamKind::Cpm => Duration::from_secs(60),
        StreamKind::Pxm => Duration::from_secs(1),
        StreamKind::Title | StreamKind::Telemetry => Duration::from_secs(10),
    }
}

/// Synthetic user-activity readings.
pub struct ActivitySimulator {
    kind: StreamKind,
    rng: StdRng,
}

impl ActivitySimulator {
    pub fn new(kind: StreamKind) -> Self {
        Self::with_rng(kind, StdRng::from_os_rng())
    }

    pub fn with_rng(kind: StreamKind, rng: StdRng) -> Self {
        Self { kind, rng }
    }

    /// Next value, or `None` for kinds that are not activity metrics.
    pub fn next_value(&mut self) -> Option<SampleValue> {
        let value = match self.kind {
            StreamKind::Kpm => SampleValue::Int(self.rng.random_range(0..=400)),
            StreamKind::Cpm => SampleValue::Int(self.rng.random_range(0..=120)),
            StreamKind::Pxm => SampleValue::Float(self.rng.random_range(0.0..5_000.0)),
            StreamKind::Title => {
                let idx = self.rng.random_range(0..WINDOW_TITLES.len());
                SampleValue::Text(WINDOW_TITLES[idx].to_string())
            }
            StreamKind::Telemetry => return None,
        };
        Some(value)
    }
}
