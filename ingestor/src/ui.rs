//! UI path consumer: pushes live data to dashboard clients.
//!
//! Three loops run side by side and only share the client registry and the
//! active sensor table:
//! - the roster loop broadcasts the live sensor list on a fixed period,
//! - the relay loop forwards time-domain data and heartbeats,
//! - the FFT loop keeps a sliding window per sensor and pushes spectra.

use crate::clients::{ClientRegistry, Subscription, UiMode};
use crate::fft::compute_fft;
use crate::metrics::FFT_COMPUTATIONS_TOTAL;
use crate::model::{Heartbeat, StreamingFrame, TelemetryEvent};
use crate::sensors::{ActiveSensor, ActiveSensors};
use crate::window::SlidingFftWindow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const MIN_ROSTER_PERIOD: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    TimeDomain {
        sensor: String,
        frequency: u16,
        data: Vec<TimePoint>,
    },
    Heartbeat {
        sensor: String,
        lqi: u8,
        temperature: f64,
        data_logger: f64,
        battery_volts: i16,
        channel_status: [u8; 3],
    },
    FftData {
        sensor: String,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
        data: Spectrum,
    },
    AvailableSensors {
        connected_sensors: Vec<ActiveSensor>,
        #[serde(with = "chrono::serde::ts_milliseconds")]
        timestamp: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TimePoint {
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub ts: DateTime<Utc>,
    pub vals: Axes,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Axes {
    #[serde(rename = "X")]
    pub x: f64,
    #[serde(rename = "Y")]
    pub y: f64,
    #[serde(rename = "Z")]
    pub z: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Spectrum {
    pub frequencies: Vec<f64>,
    #[serde(rename = "X")]
    pub x: Vec<f64>,
    #[serde(rename = "Y")]
    pub y: Vec<f64>,
    #[serde(rename = "Z")]
    pub z: Vec<f64>,
}

impl From<&Heartbeat> for ServerMessage {
    fn from(h: &Heartbeat) -> Self {
        ServerMessage::Heartbeat {
            sensor: h.sensor.clone(),
            lqi: h.network.lqi,
            temperature: h.network.internal_temperature,
            data_logger: h.data_logger_memory_pct,
            battery_volts: h.battery_millivolts,
            channel_status: h.channel_status,
        }
    }
}

fn time_domain_message(frame: &StreamingFrame) -> ServerMessage {
    ServerMessage::TimeDomain {
        sensor: frame.sensor.clone(),
        frequency: frame.sample_rate,
        data: frame
            .samples
            .iter()
            .map(|s| TimePoint {
                ts: s.time,
                vals: Axes {
                    x: s.x,
                    y: s.y,
                    z: s.z,
                },
            })
            .collect(),
    }
}

/// Refreshes liveness and pushes the time-domain or heartbeat view of `event`.
/// Streaming frames are handed back for the FFT loop.
pub fn relay_event(
    registry: &ClientRegistry,
    sensors: &ActiveSensors,
    event: TelemetryEvent,
    now: DateTime<Utc>,
) -> Option<StreamingFrame> {
    sensors.touch(event.sensor(), now);

    match event {
        TelemetryEvent::Streaming(frame) => {
            debug!(
                sensor = %frame.sensor,
                device_time = %frame.timestamp,
                samples = frame.samples.len(),
                "Streaming frame received"
            );
            let wants = |s: &Subscription| s.wants(UiMode::TimeDomain, &frame.sensor);
            if registry.has_subscriber(wants) {
                registry.broadcast_filtered(&time_domain_message(&frame), wants);
            }
            Some(frame)
        }
        TelemetryEvent::Heartbeat(heartbeat) => {
            debug!(
                sensor = %heartbeat.sensor,
                device_time = %heartbeat.device_time,
                packet_error_rate = heartbeat.network.packet_error_rate,
                available_channels = heartbeat.available_channels,
                "Heartbeat received"
            );
            registry.broadcast(&ServerMessage::from(&heartbeat));
            None
        }
        TelemetryEvent::DaqProfile(profile) => {
            info!(
                sensor = %profile.sensor,
                mode = ?profile.mode,
                streaming_type = ?profile.options.streaming_type,
                data_logger = profile.options.data_logger,
                store_and_forward = profile.options.store_and_forward,
                transmission = profile.options.transmission,
                stand_alone = profile.options.stand_alone,
                sample_rate = profile.sample_rate,
                max_sample_rate = profile.max_sample_rate,
                "DAQ profile received"
            );
            None
        }
    }
}

#[derive(Debug)]
struct SensorWindow {
    samples: SlidingFftWindow,
    last_seen: DateTime<Utc>,
}

/// Per-sensor sliding windows feeding the spectrum view. A sensor's window is
/// dropped once it has been silent for longer than `idle`.
#[derive(Debug)]
pub struct FftRelay {
    capacity: usize,
    idle: chrono::Duration,
    windows: HashMap<String, SensorWindow>,
}

impl FftRelay {
    pub fn new(capacity: usize, idle: chrono::Duration) -> Self {
        Self {
            capacity,
            idle,
            windows: HashMap::new(),
        }
    }

    fn evict_idle(&mut self, now: DateTime<Utc>) {
        let idle = self.idle;
        self.windows.retain(|sensor, w| {
            let keep = now - w.last_seen <= idle;
            if !keep {
                debug!(sensor = %sensor, "Dropping idle FFT window");
            }
            keep
        });
    }

    /// Appends the frame's samples and, once the sensor's window is full,
    /// pushes a spectrum to its FFT subscribers. Returns whether one was sent.
    pub fn process(&mut self, frame: &StreamingFrame, registry: &ClientRegistry, now: DateTime<Utc>) -> bool {
        self.evict_idle(now);

        let capacity = self.capacity;
        let entry = self
            .windows
            .entry(frame.sensor.clone())
            .or_insert_with(|| SensorWindow {
                samples: SlidingFftWindow::new(capacity),
                last_seen: now,
            });
        entry.last_seen = now;
        let window = &mut entry.samples;
        for sample in &frame.samples {
            window.push(sample);
        }

        if !window.is_full() || window.len() == 0 {
            return false;
        }
        let wants = |s: &Subscription| s.wants(UiMode::Fft, &frame.sensor);
        if !registry.has_subscriber(wants) {
            return false;
        }

        let rate = f64::from(frame.sample_rate);
        let x = compute_fft(&window.x.to_vec(), rate);
        let y = compute_fft(&window.y.to_vec(), rate);
        let z = compute_fft(&window.z.to_vec(), rate);
        FFT_COMPUTATIONS_TOTAL.inc();

        let message = ServerMessage::FftData {
            sensor: frame.sensor.clone(),
            timestamp: now,
            data: Spectrum {
                frequencies: x.iter().map(|b| b.frequency).collect(),
                x: x.iter().map(|b| b.magnitude).collect(),
                y: y.iter().map(|b| b.magnitude).collect(),
                z: z.iter().map(|b| b.magnitude).collect(),
            },
        };
        registry.broadcast_filtered(&message, wants) > 0
    }
}

#[derive(Debug, Clone)]
pub struct UiDistributor {
    registry: Arc<ClientRegistry>,
    sensors: Arc<ActiveSensors>,
    fft_window: usize,
    roster_interval: Duration,
}

impl UiDistributor {
    pub fn new(
        registry: Arc<ClientRegistry>,
        sensors: Arc<ActiveSensors>,
        fft_window: usize,
        roster_interval: Duration,
    ) -> Self {
        Self {
            registry,
            sensors,
            fft_window,
            roster_interval,
        }
    }

    /// Runs until `shutdown` fires.
    pub async fn run(self, rx: mpsc::UnboundedReceiver<TelemetryEvent>, shutdown: CancellationToken) {
        info!(
            "Starting UI distributor with fft_window={}, roster_interval={:?}",
            self.fft_window, self.roster_interval
        );
        let (fft_tx, fft_rx) = mpsc::unbounded_channel();

        let roster = tokio::spawn(roster_loop(
            self.registry.clone(),
            self.sensors.clone(),
            self.roster_interval,
            shutdown.clone(),
        ));
        let relay = tokio::spawn(relay_loop(
            self.registry.clone(),
            self.sensors.clone(),
            rx,
            fft_tx,
            shutdown.clone(),
        ));
        let fft = tokio::spawn(fft_loop(
            self.registry.clone(),
            self.fft_window,
            self.sensors.idle(),
            fft_rx,
            shutdown.clone(),
        ));

        tokio::join!(
            supervise("roster", roster, &shutdown),
            supervise("relay", relay, &shutdown),
            supervise("fft", fft, &shutdown),
        );
        info!("UI distributor stopped");
    }
}

/// Waits for a loop and logs how it ended. The other loops keep running.
async fn supervise(name: &str, handle: JoinHandle<()>, shutdown: &CancellationToken) {
    match handle.await {
        Ok(()) => debug!("UI {} loop stopped", name),
        Err(e) => error!("UI {} loop crashed: {}", name, e),
    }
    if !shutdown.is_cancelled() {
        error!("UI {} loop ended unexpectedly", name);
    }
}

async fn roster_loop(
    registry: Arc<ClientRegistry>,
    sensors: Arc<ActiveSensors>,
    period: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period.max(MIN_ROSTER_PERIOD));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let now = Utc::now();
                let connected_sensors = sensors.evict_stale(now);
                registry.broadcast(&ServerMessage::AvailableSensors {
                    connected_sensors,
                    timestamp: now,
                });
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

async fn relay_loop(
    registry: Arc<ClientRegistry>,
    sensors: Arc<ActiveSensors>,
    mut rx: mpsc::UnboundedReceiver<TelemetryEvent>,
    fft_tx: mpsc::UnboundedSender<StreamingFrame>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            event = rx.recv() => event,
            _ = shutdown.cancelled() => break,
        };
        let Some(event) = event else {
            info!("UI channel closed");
            break;
        };

        if let Some(frame) = relay_event(&registry, &sensors, event, Utc::now()) {
            if fft_tx.send(frame).is_err() {
                debug!("FFT loop is gone, dropping frame");
            }
        }
    }
}

async fn fft_loop(
    registry: Arc<ClientRegistry>,
    capacity: usize,
    idle: chrono::Duration,
    mut rx: mpsc::UnboundedReceiver<StreamingFrame>,
    shutdown: CancellationToken,
) {
    let mut relay = FftRelay::new(capacity, idle);
    loop {
        let frame = tokio::select! {
            frame = rx.recv() => frame,
            _ = shutdown.cancelled() => break,
        };
        let Some(frame) = frame else { break };
        relay.process(&frame, &registry, Utc::now());
    }
}
