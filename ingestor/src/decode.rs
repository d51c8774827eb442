//! Binary frame decoder for the accelerometer wire protocol.
//!
//! Frames are fixed shapes keyed by marker bytes, all multi-byte fields
//! little-endian:
//!
//! | marker                         | frame        |
//! |--------------------------------|--------------|
//! | `[1] == 0x0E`                  | heartbeat    |
//! | `[1] == 0x4F` and `[17] == 0x10` | DAQ profile |
//! | `[0] == 0x01` and `[1] == 0x03`  | streaming   |
//!
//! The sensor MAC is the first segment of the MQTT topic.

use crate::model::{
    DaqMode, DaqOptions, DaqProfile, Heartbeat, NetworkStatus, Sample, StreamingFrame,
    StreamingType, TelemetryEvent,
};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

const HEARTBEAT_MARKER: u8 = 0x0E;
const PROFILE_MARKER: u8 = 0x4F;
const DAQ_PROFILE_MARKER: u8 = 0x10;
const STREAMING_HEADER: [u8; 2] = [0x01, 0x03];

const SAMPLES_OFFSET: usize = 29;
const SAMPLE_LEN: usize = 9;
const DEFAULT_SAMPLE_RATE: u16 = 200;
const SIGN_BIT: u8 = 0x80;
const ACCEL_SCALE: f64 = 1000.0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame truncated: needed byte {offset} but payload has {len} bytes")]
    Truncated { offset: usize, len: usize },

    #[error("unknown DAQ mode 0x{0:02X}")]
    UnknownDaqMode(u8),

    #[error("invalid streaming type bits in DAQ options 0x{0:04X}")]
    InvalidStreamingType(u16),

    #[error("heartbeat carries an invalid device date/time")]
    InvalidDeviceTime,

    #[error("streaming frame carries an invalid timestamp")]
    InvalidTimestamp,
}

type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// Last sequence number seen per sensor, used for packet loss detection.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last: HashMap<String, u32>,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `sequence` for `sensor` and returns how many packets were skipped.
    pub fn observe(&mut self, sensor: &str, sequence: u32) -> u32 {
        let lost = match self.last.get(sensor) {
            Some(&previous) if sequence > previous.saturating_add(1) => sequence - previous - 1,
            _ => 0,
        };
        self.last.insert(sensor.to_string(), sequence);
        lost
    }

    #[cfg(test)]
    pub fn last(&self, sensor: &str) -> Option<u32> {
        self.last.get(sensor).copied()
    }
}

/// Bounds-checked little-endian reads over a frame.
struct FrameReader<'a> {
    bytes: &'a [u8],
}

impl<'a> FrameReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn slice(&self, offset: usize, n: usize) -> DecodeResult<&'a [u8]> {
        self.bytes
            .get(offset..offset + n)
            .ok_or(DecodeError::Truncated {
                offset: offset + n - 1,
                len: self.bytes.len(),
            })
    }

    fn u8(&self, offset: usize) -> DecodeResult<u8> {
        Ok(self.slice(offset, 1)?[0])
    }

    fn u16(&self, offset: usize) -> DecodeResult<u16> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&self, offset: usize) -> DecodeResult<i16> {
        let b = self.slice(offset, 2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u24(&self, offset: usize) -> DecodeResult<u32> {
        let b = self.slice(offset, 3)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], 0]))
    }

    fn u32(&self, offset: usize) -> DecodeResult<u32> {
        let b = self.slice(offset, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn accel(&self, offset: usize) -> DecodeResult<f64> {
        let b = self.slice(offset, 3)?;
        Ok(sign_magnitude_24([b[0], b[1], b[2]]) / ACCEL_SCALE)
    }
}

/// Decodes a 24-bit sign-magnitude value: bit 7 of the last byte is the sign.
pub fn sign_magnitude_24(bytes: [u8; 3]) -> f64 {
    let magnitude = u32::from_le_bytes([bytes[0], bytes[1], bytes[2] & !SIGN_BIT, 0]) as f64;
    if bytes[2] & SIGN_BIT != 0 {
        -magnitude
    } else {
        magnitude
    }
}

/// Extracts the sensor MAC from a `<mac>/...` topic.
pub fn sensor_from_topic(topic: &str) -> Option<&str> {
    match topic.split_once('/') {
        Some((mac, _)) if !mac.is_empty() => Some(mac),
        _ => None,
    }
}

/// Decodes one bus payload.
///
/// Returns `Ok(None)` when the topic or the frame shape is not recognized,
/// and an error when a recognized frame is truncated or violates the protocol.
/// `arrival` is the wall-clock time used to back-date streaming samples.
pub fn decode_frame(
    topic: &str,
    payload: &[u8],
    sequences: &mut SequenceTracker,
    arrival: DateTime<Utc>,
) -> DecodeResult<Option<TelemetryEvent>> {
    let Some(sensor) = sensor_from_topic(topic) else {
        return Ok(None);
    };
    let frame = FrameReader::new(payload);

    let marker = frame.u8(1)?;
    if marker == HEARTBEAT_MARKER {
        return decode_heartbeat(sensor, &frame).map(|h| Some(TelemetryEvent::Heartbeat(h)));
    }
    if marker == PROFILE_MARKER {
        if frame.u8(17)? != DAQ_PROFILE_MARKER {
            return Ok(None);
        }
        return decode_daq_profile(sensor, &frame).map(|p| Some(TelemetryEvent::DaqProfile(p)));
    }
    if frame.u8(0)? == STREAMING_HEADER[0] && marker == STREAMING_HEADER[1] {
        return decode_streaming(sensor, &frame, sequences, arrival)
            .map(|s| Some(TelemetryEvent::Streaming(s)));
    }

    Ok(None)
}

fn decode_heartbeat(sensor: &str, frame: &FrameReader<'_>) -> DecodeResult<Heartbeat> {
    let year = i32::from(frame.i16(17)?);
    let (month, day) = (u32::from(frame.u8(19)?), u32::from(frame.u8(20)?));
    let (hour, minute, second) = (
        u32::from(frame.u8(21)?),
        u32::from(frame.u8(22)?),
        u32::from(frame.u8(23)?),
    );
    let device_time = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|date| date.and_hms_opt(hour, minute, second))
        .ok_or(DecodeError::InvalidDeviceTime)?;

    let status = frame.slice(45, 3)?;
    Ok(Heartbeat {
        sensor: sensor.to_string(),
        device_time,
        network: NetworkStatus {
            packet_error_rate: frame.i16(26)?,
            lqi: frame.u8(28)?,
            internal_temperature: f64::from(frame.i16(33)?) / 2.0,
        },
        data_logger_memory_pct: f64::from(frame.u8(37)?) / 200.0 * 100.0,
        battery_millivolts: frame.i16(42)?,
        available_channels: frame.u8(44)?,
        channel_status: [status[0], status[1], status[2]],
    })
}

fn decode_daq_profile(sensor: &str, frame: &FrameReader<'_>) -> DecodeResult<DaqProfile> {
    let options = frame.u16(19)?;
    let bit = |n: u16| options & (1 << n) != 0;

    let streaming_type = match (bit(2), bit(3), bit(4)) {
        (true, false, false) => StreamingType::Continuous,
        (false, true, false) => StreamingType::OneShot,
        (false, true, true) => StreamingType::Burst,
        _ => return Err(DecodeError::InvalidStreamingType(options)),
    };
    let mode_byte = frame.u8(18)?;
    let mode = DaqMode::from_wire(mode_byte).ok_or(DecodeError::UnknownDaqMode(mode_byte))?;

    Ok(DaqProfile {
        sensor: sensor.to_string(),
        mode,
        options: DaqOptions {
            data_logger: bit(0),
            store_and_forward: bit(1),
            streaming_type,
            transmission: bit(5),
            stand_alone: bit(6),
        },
        max_sample_rate: frame.u24(31)?,
        sample_rate: frame.u24(34)?,
    })
}

fn decode_streaming(
    sensor: &str,
    frame: &FrameReader<'_>,
    sequences: &mut SequenceTracker,
    arrival: DateTime<Utc>,
) -> DecodeResult<StreamingFrame> {
    let sample_rate = match frame.u16(8)? {
        0 => DEFAULT_SAMPLE_RATE,
        rate => rate,
    };
    let step_ms = 1000.0 / f64::from(sample_rate);

    let seconds = frame.u32(2)?;
    let millis = frame.u16(6)?;
    let timestamp = DateTime::<Utc>::from_timestamp(i64::from(seconds), 0)
        .ok_or(DecodeError::InvalidTimestamp)?
        + Duration::milliseconds(i64::from(millis));

    let sequence = frame.u24(14)?;
    let declared = frame.u16(17)?;

    let lost_packets = sequences.observe(sensor, sequence);
    if lost_packets > 0 {
        warn!(sensor, sequence, lost_packets, "{} packets were lost", lost_packets);
    }

    // The device stamps packets, not samples: spread the declared samples
    // backwards from the arrival time.
    let base = arrival - millis_duration(f64::from(declared) * step_ms);

    let mut samples = Vec::with_capacity(usize::from(declared));
    let mut offset = SAMPLES_OFFSET;
    while offset + SAMPLE_LEN <= frame.len() {
        let index = samples.len() as f64;
        samples.push(Sample {
            z: frame.accel(offset)?,
            x: frame.accel(offset + 3)?,
            y: frame.accel(offset + 6)?,
            time: base + millis_duration((index + 1.0) * step_ms),
        });
        offset += SAMPLE_LEN;
    }

    Ok(StreamingFrame {
        sensor: sensor.to_string(),
        timestamp,
        sample_rate,
        samples,
        lost_packets,
    })
}

fn millis_duration(ms: f64) -> Duration {
    Duration::microseconds((ms * 1000.0).round() as i64)
}


#[cfg(test)]
mod tests {
    use super::fixtures::{self, HeartbeatFields, TOPIC};
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    fn arrival() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 14, 12, 0, 0).unwrap()
    }

    fn decode(payload: &[u8], tracker: &mut SequenceTracker) -> DecodeResult<Option<TelemetryEvent>> {
        decode_frame(TOPIC, payload, tracker, arrival())
    }

    #[test]
    fn test_heartbeat_fields_match_offsets() {
        let fields = HeartbeatFields::default();
        let payload = fixtures::heartbeat(&fields);

        let event = decode(&payload, &mut SequenceTracker::new()).unwrap().unwrap();
        let TelemetryEvent::Heartbeat(h) = event else {
            panic!("expected heartbeat, got {:?}", event);
        };

        assert_eq!(h.sensor, "AA:BB");
        assert_eq!(
            h.device_time,
            NaiveDate::from_ymd_opt(2025, 3, 14)
                .unwrap()
                .and_hms_opt(9, 26, 53)
                .unwrap()
        );
        assert_eq!(h.network.packet_error_rate, 12);
        assert_eq!(h.network.lqi, 200);
        assert_eq!(h.network.internal_temperature, 28.5);
        assert_eq!(h.data_logger_memory_pct, 75.0);
        assert_eq!(h.battery_millivolts, 3600);
        assert_eq!(h.available_channels, 3);
        assert_eq!(h.channel_status, [1, 0, 2]);
    }

    #[test]
    fn test_heartbeat_negative_temperature() {
        let fields = HeartbeatFields {
            temperature_raw: -21,
            ..Default::default()
        };
        let payload = fixtures::heartbeat(&fields);

        match decode(&payload, &mut SequenceTracker::new()).unwrap() {
            Some(TelemetryEvent::Heartbeat(h)) => {
                assert_eq!(h.network.internal_temperature, -10.5)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_heartbeat_invalid_date() {
        let fields = HeartbeatFields {
            month: 13,
            ..Default::default()
        };
        let payload = fixtures::heartbeat(&fields);

        assert_eq!(
            decode(&payload, &mut SequenceTracker::new()),
            Err(DecodeError::InvalidDeviceTime)
        );
    }

    #[test]
    fn test_truncated_heartbeat_is_an_error_not_a_panic() {
        let payload = fixtures::heartbeat(&HeartbeatFields::default());

        let result = decode(&payload[..30], &mut SequenceTracker::new());
        assert!(matches!(result, Err(DecodeError::Truncated { len: 30, .. })));
    }

    #[test]
    fn test_daq_profile_burst() {
        // data logger, burst (bits 3 and 4), transmission
        let options = 0b0011_1001;
        let payload = fixtures::daq_profile(0x03, options, 25_600, 3_200);

        match decode(&payload, &mut SequenceTracker::new()).unwrap() {
            Some(TelemetryEvent::DaqProfile(p)) => {
                assert_eq!(p.mode, DaqMode::Streaming);
                assert_eq!(p.max_sample_rate, 25_600);
                assert_eq!(p.sample_rate, 3_200);
                assert_eq!(
                    p.options,
                    DaqOptions {
                        data_logger: true,
                        store_and_forward: false,
                        streaming_type: StreamingType::Burst,
                        transmission: true,
                        stand_alone: false,
                    }
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_daq_profile_streaming_types() {
        let cases = [
            (0b0000_0100, StreamingType::Continuous),
            (0b0000_1000, StreamingType::OneShot),
            (0b0101_1010, StreamingType::Burst),
        ];
        for (options, expected) in cases {
            let payload = fixtures::daq_profile(0x01, options, 0, 0);
            match decode(&payload, &mut SequenceTracker::new()).unwrap() {
                Some(TelemetryEvent::DaqProfile(p)) => {
                    assert_eq!(p.options.streaming_type, expected)
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_daq_profile_bits_two_and_three_is_a_protocol_violation() {
        let payload = fixtures::daq_profile(0x03, 0b0000_1100, 0, 0);

        assert_eq!(
            decode(&payload, &mut SequenceTracker::new()),
            Err(DecodeError::InvalidStreamingType(0b0000_1100))
        );
    }

    #[test]
    fn test_daq_profile_unknown_mode() {
        let payload = fixtures::daq_profile(0x07, 0b0000_0100, 0, 0);

        assert_eq!(
            decode(&payload, &mut SequenceTracker::new()),
            Err(DecodeError::UnknownDaqMode(0x07))
        );
    }

    #[test]
    fn test_profile_frame_without_daq_marker_is_ignored() {
        let mut payload = fixtures::daq_profile(0x03, 0b0000_0100, 0, 0);
        payload[17] = 0x11;

        assert_eq!(decode(&payload, &mut SequenceTracker::new()), Ok(None));
    }

    #[test]
    fn test_streaming_samples_and_timestamps() {
        let payload = fixtures::streaming(7, 100, &[(1.5, -2.25, 0.001), (-0.5, 0.0, 9.81)]);

        let frame = match decode(&payload, &mut SequenceTracker::new()).unwrap() {
            Some(TelemetryEvent::Streaming(s)) => s,
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(frame.sample_rate, 100);
        assert_eq!(frame.samples.len(), 2);
        assert_eq!((frame.samples[0].x, frame.samples[0].y, frame.samples[0].z), (1.5, -2.25, 0.001));
        assert_eq!((frame.samples[1].x, frame.samples[1].y, frame.samples[1].z), (-0.5, 0.0, 9.81));

        // 2 samples at 100 Hz: window of 20 ms back-dated from arrival
        assert_eq!(frame.samples[0].time, arrival() - Duration::milliseconds(10));
        assert_eq!(frame.samples[1].time, arrival());
        assert_eq!(
            frame.timestamp,
            Utc.timestamp_opt(1_700_000_000, 250_000_000).unwrap()
        );
    }

    #[test]
    fn test_streaming_zero_rate_defaults_to_200hz() {
        let payload = fixtures::streaming(1, 0, &[(0.0, 0.0, 0.0)]);

        match decode(&payload, &mut SequenceTracker::new()).unwrap() {
            Some(TelemetryEvent::Streaming(s)) => {
                assert_eq!(s.sample_rate, 200);
                assert_eq!(s.samples[0].time, arrival());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_streaming_ignores_trailing_partial_sample() {
        let mut payload = fixtures::streaming(1, 200, &[(1.0, 2.0, 3.0)]);
        payload.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);

        match decode(&payload, &mut SequenceTracker::new()).unwrap() {
            Some(TelemetryEvent::Streaming(s)) => assert_eq!(s.samples.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_lost_packets_reported() {
        let mut tracker = SequenceTracker::new();

        let first = fixtures::streaming(10, 200, &[(0.0, 0.0, 0.0)]);
        let second = fixtures::streaming(14, 200, &[(0.0, 0.0, 0.0)]);
        let third = fixtures::streaming(15, 200, &[(0.0, 0.0, 0.0)]);

        let lost: Vec<u32> = [first, second, third]
            .iter()
            .map(|p| match decode(p, &mut tracker).unwrap() {
                Some(TelemetryEvent::Streaming(s)) => s.lost_packets,
                other => panic!("unexpected {:?}", other),
            })
            .collect();

        assert_eq!(lost, vec![0, 3, 0]);
        assert_eq!(tracker.last("AA:BB"), Some(15));
    }

    #[test]
    fn test_sequence_tracked_per_sensor() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(tracker.observe("A", 100), 0);
        assert_eq!(tracker.observe("B", 5), 0);
        assert_eq!(tracker.observe("A", 101), 0);
        assert_eq!(tracker.observe("B", 6), 0);
        // a backwards jump (wrap or reboot) is not counted as loss
        assert_eq!(tracker.observe("A", 3), 0);
        assert_eq!(tracker.last("A"), Some(3));
    }

    #[test]
    fn test_sign_magnitude_negative_zero() {
        let value = sign_magnitude_24([0x00, 0x00, 0x80]) / 1000.0;
        assert_eq!(value, 0.0);
        assert!(value.is_sign_negative());
    }

    #[test]
    fn test_sign_magnitude_values() {
        assert_eq!(sign_magnitude_24([0xE8, 0x03, 0x00]), 1000.0);
        assert_eq!(sign_magnitude_24([0xE8, 0x03, 0x80]), -1000.0);
        assert_eq!(sign_magnitude_24([0xFF, 0xFF, 0x7F]), 8_388_607.0);
        assert_eq!(sign_magnitude_24([0xFF, 0xFF, 0xFF]), -8_388_607.0);
    }

    #[test]
    fn test_unrecognized_frames() {
        let mut tracker = SequenceTracker::new();
        assert_eq!(decode(&[0x00, 0x00, 0x00], &mut tracker), Ok(None));
        assert_eq!(decode(&[0x02, 0x03, 0x00], &mut tracker), Ok(None));
    }

    #[test]
    fn test_empty_payload_is_truncated() {
        assert!(matches!(
            decode(&[], &mut SequenceTracker::new()),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn test_topic_without_sensor_prefix_is_ignored() {
        let payload = fixtures::heartbeat(&HeartbeatFields::default());
        let mut tracker = SequenceTracker::new();

        assert_eq!(decode_frame("status", &payload, &mut tracker, arrival()), Ok(None));
        assert_eq!(decode_frame("/x", &payload, &mut tracker, arrival()), Ok(None));
    }
}
