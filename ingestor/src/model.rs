use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// One decoded sensor frame.
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Heartbeat(Heartbeat),
    DaqProfile(DaqProfile),
    Streaming(StreamingFrame),
}

impl TelemetryEvent {
    pub fn sensor(&self) -> &str {
        match self {
            TelemetryEvent::Heartbeat(h) => &h.sensor,
            TelemetryEvent::DaqProfile(p) => &p.sensor,
            TelemetryEvent::Streaming(s) => &s.sensor,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::Heartbeat(_) => "heartbeat",
            TelemetryEvent::DaqProfile(_) => "daq_profile",
            TelemetryEvent::Streaming(_) => "streaming",
        }
    }
}

/// Periodic status report from a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Heartbeat {
    pub sensor: String,
    /// Device clock, no timezone information on the wire.
    pub device_time: NaiveDateTime,
    pub network: NetworkStatus,
    /// Free data-logger memory in percent.
    pub data_logger_memory_pct: f64,
    pub battery_millivolts: i16,
    pub available_channels: u8,
    pub channel_status: [u8; 3],
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkStatus {
    pub packet_error_rate: i16,
    pub lqi: u8,
    /// Degrees Celsius.
    pub internal_temperature: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaqMode {
    Commissioning,
    LowDutyCycle,
    Streaming,
    Alarm,
    SetMode,
    ShockDetection,
}

impl DaqMode {
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DaqMode::Commissioning),
            0x02 => Some(DaqMode::LowDutyCycle),
            0x03 => Some(DaqMode::Streaming),
            0x04 => Some(DaqMode::Alarm),
            0x05 => Some(DaqMode::SetMode),
            0x06 => Some(DaqMode::ShockDetection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingType {
    Continuous,
    OneShot,
    Burst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaqOptions {
    pub data_logger: bool,
    pub store_and_forward: bool,
    pub streaming_type: StreamingType,
    pub transmission: bool,
    pub stand_alone: bool,
}

/// Acquisition profile announced by a sensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DaqProfile {
    pub sensor: String,
    pub mode: DaqMode,
    pub options: DaqOptions,
    pub max_sample_rate: u32,
    pub sample_rate: u32,
}

/// A packet of accelerometer samples.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamingFrame {
    pub sensor: String,
    /// Device time embedded in the packet.
    pub timestamp: DateTime<Utc>,
    pub sample_rate: u16,
    pub samples: Vec<Sample>,
    /// Packets missed since the previous frame from this sensor.
    pub lost_packets: u32,
}

/// Three-axis acceleration with its back-dated acquisition time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub time: DateTime<Utc>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// All samples of one sensor accumulated for a single storage write.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorBatch {
    pub sensor: String,
    pub samples: Vec<Sample>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FrequencyBin {
    pub frequency: f64,
    pub magnitude: f64,
}

/// Alarm thresholds for one sensor, stored as an opaque JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalAlarmConfig {
    pub acc: MetricConfig,
    pub vel: MetricConfig,
    pub disp: MetricConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    pub enabled: bool,
    pub min: f64,
    pub max: f64,
    #[serde(alias = "hysteresis_percent")]
    pub hysteresis_percent: f64,
    #[serde(alias = "delay_ms")]
    pub delay_ms: f64,
    #[serde(default)]
    pub axes: AxisConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisConfig {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl Default for AxisConfig {
    fn default() -> Self {
        Self {
            x: true,
            y: true,
            z: true,
        }
    }
}
