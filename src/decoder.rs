//! Byte-stream decoder for frames sent by the device.
//!
//! Two frame kinds share the same start marker and are told apart by the second
//! byte:
//!
//! ```text
//! data:    AA AA <counter lo> <counter hi> <payload ...> 55
//! message: AA A5 <total len> <marker> [args ...] 55
//! ```
//!
//! The data payload layout is fixed by the active [`DeviceConfig`] (see
//! [`raw_frame_len`]). Messages are at most [`MAX_MESSAGE_LEN`] bytes long.
//!
//! Malformed input never fails the decoder: it is reported as a
//! [`MessageKind::FrameBroken`] event and decoding resumes with a fresh frame.
//!
//! # Record numbers
//!
//! The device numbers data records with a 16-bit counter that wraps every 65536
//! records. [`RecordSequence`] turns it back into a monotonic record number. When
//! the link stalls (e.g. a wireless dropout) and buffered frames arrive in a burst,
//! the counter alone cannot tell how many wraps were missed, so the wall-clock gap
//! between frames is used to estimate it.

use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::config::{
    decoded_frame_len, raw_frame_len, DeviceConfig, DeviceType, ACCELEROMETER_AXES,
    DATA_FRAME_HEADER_LEN,
};

// ============================================================================
// Constants
// ============================================================================

pub const START_MARKER: u8 = 0xAA;
pub const MESSAGE_MARKER: u8 = 0xA5;
pub const STOP_MARKER: u8 = 0x55;

/// Smallest message frame: `AA A5 05 <marker> 55`.
pub const MIN_MESSAGE_LEN: usize = 5;
pub const MAX_MESSAGE_LEN: usize = 7;

// Message markers (byte 3 of a message frame)
pub const MSG_HELLO: u8 = 0xA0;
pub const MSG_FIRMWARE: u8 = 0xA1;
pub const MSG_WARNING: u8 = 0xA3;
pub const MSG_HARDWARE: u8 = 0xA4;
pub const MSG_STOP_RECORDING: u8 = 0xA5;

// Second argument of a warning message
pub const WARNING_LOW_BATTERY: u8 = 0x01;
pub const WARNING_TX_FAIL: u8 = 0x02;

/// Period of the raw record counter.
pub const COUNTER_WRAP: i64 = 1 << 16;

// ============================================================================
// Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Answer to a hello request or keep-alive.
    Hello,
    /// The device acknowledged a stop command.
    StopRecording,
    Firmware,
    HardwareType(DeviceType),
    LowBattery,
    TxFail,
    /// Well-formed message with an unknown marker. Still proves the device is alive.
    Unknown,
    /// Decoding error; the frame was dropped.
    FrameBroken,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMessage {
    pub kind: MessageKind,
    pub detail: String,
}

/// One decoded data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// Values laid out as described by [`decoded_frame_len`].
    pub samples: Vec<i32>,
    /// Monotonic record number, 0 for the first record of the session.
    pub number: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    Record(DataRecord),
    Message(DeviceMessage),
}

// ============================================================================
// Record sequence reconstruction
// ============================================================================

/// Rebuilds monotonic record numbers from the wrapping 16-bit frame counter.
#[derive(Debug, Clone)]
pub struct RecordSequence {
    record_duration_ms: i64,
    previous: Option<(u16, Instant)>,
    origin: u16,
    wraps: i64,
}

impl RecordSequence {
    pub fn new(record_duration: Duration) -> Self {
        Self {
            record_duration_ms: (record_duration.as_millis() as i64).max(1),
            previous: None,
            origin: 0,
            wraps: 0,
        }
    }

    /// Record number for `counter`, received at `now`.
    pub fn next(&mut self, counter: u16, now: Instant) -> i64 {
        let Some((prev_counter, prev_time)) = self.previous else {
            self.previous = Some((counter, now));
            self.origin = counter;
            return 0;
        };

        let mut distance = counter as i64 - prev_counter as i64;
        if distance <= 0 {
            self.wraps += 1;
            distance += COUNTER_WRAP;
        }

        let wrap_period_ms = self.record_duration_ms * COUNTER_WRAP;
        let elapsed_ms = now.saturating_duration_since(prev_time).as_millis() as i64;
        if elapsed_ms > wrap_period_ms / 2 {
            let mut wraps = elapsed_ms / wrap_period_ms;
            let time_distance = elapsed_ms % wrap_period_ms / self.record_duration_ms;
            // counter says "almost a full wrap", clock says "just past a wrap":
            // the raw wrap above already counted that one
            if distance > COUNTER_WRAP * 2 / 3 && time_distance < COUNTER_WRAP / 3 {
                wraps -= 1;
            }
            if distance < COUNTER_WRAP / 3 && time_distance > COUNTER_WRAP * 2 / 3 {
                wraps += 1;
            }
            debug!(
                "record counter gap after {} ms stall: counter distance={}, extra wraps={}",
                elapsed_ms, distance, wraps
            );
            self.wraps += wraps;
        }

        self.previous = Some((counter, now));
        self.wraps * COUNTER_WRAP + counter as i64 - self.origin as i64
    }
}

// ============================================================================
// Frame decoder
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    WaitStart0,
    WaitStart1,
    ReadingData,
    ReadingMessageLength,
    ReadingMessageBody,
}

/// Byte-at-a-time frame decoder.
///
/// Without a configuration only message frames can be decoded; data frames are
/// reported as broken. One decoder is created per recording session so the record
/// numbering and accelerometer state start fresh.
pub struct FrameDecoder {
    config: Option<DeviceConfig>,
    raw_len: usize,
    decoded_len: usize,
    state: DecodeState,
    frame: Vec<u8>,
    expected_len: usize,
    accelerometer_prev: [i32; ACCELEROMETER_AXES],
    sequence: RecordSequence,
}

impl FrameDecoder {
    pub fn new(config: Option<DeviceConfig>) -> Self {
        let (raw_len, decoded_len, record_duration) = match &config {
            Some(c) => (
                raw_frame_len(c),
                decoded_frame_len(c),
                Duration::from_millis(c.record_duration_ms()),
            ),
            None => (0, 0, Duration::from_millis(1)),
        };
        Self {
            config,
            raw_len,
            decoded_len,
            state: DecodeState::WaitStart0,
            frame: Vec::with_capacity(raw_len.max(MAX_MESSAGE_LEN)),
            expected_len: 0,
            accelerometer_prev: [0; ACCELEROMETER_AXES],
            sequence: RecordSequence::new(record_duration),
        }
    }

    /// Decoder that only understands message frames.
    pub fn for_messages() -> Self {
        Self::new(None)
    }

    pub fn with_config(config: DeviceConfig) -> Self {
        Self::new(Some(config))
    }

    pub fn config(&self) -> Option<&DeviceConfig> {
        self.config.as_ref()
    }

    /// Feed one byte; returns an event when it completes (or breaks) a frame.
    pub fn push_byte(&mut self, byte: u8) -> Option<FrameEvent> {
        self.push(byte, None)
    }

    /// Like [`push_byte`](Self::push_byte) with an explicit receive time for record
    /// numbering.
    pub fn push_byte_at(&mut self, byte: u8, now: Instant) -> Option<FrameEvent> {
        self.push(byte, Some(now))
    }

    /// Feed a slice, collecting every event it produces.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        bytes.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    fn push(&mut self, byte: u8, now: Option<Instant>) -> Option<FrameEvent> {
        match self.state {
            DecodeState::WaitStart0 => {
                if byte != START_MARKER {
                    return self.broken(format!("unrecognized byte received: {byte:#04X}"));
                }
                self.frame.clear();
                self.frame.push(byte);
                self.state = DecodeState::WaitStart1;
                None
            }
            DecodeState::WaitStart1 => match byte {
                START_MARKER if self.config.is_some() => {
                    self.frame.push(byte);
                    self.expected_len = self.raw_len;
                    self.state = DecodeState::ReadingData;
                    None
                }
                START_MARKER => {
                    self.broken("data frame received but no recording is configured".into())
                }
                MESSAGE_MARKER => {
                    self.frame.push(byte);
                    self.state = DecodeState::ReadingMessageLength;
                    None
                }
                _ => self.broken(format!(
                    "unrecognized byte received after start marker: {byte:#04X}"
                )),
            },
            DecodeState::ReadingMessageLength => {
                let len = byte as usize;
                if !(MIN_MESSAGE_LEN..=MAX_MESSAGE_LEN).contains(&len) {
                    return self.broken(format!(
                        "invalid message frame: size {len} outside {MIN_MESSAGE_LEN}..={MAX_MESSAGE_LEN}"
                    ));
                }
                self.frame.push(byte);
                self.expected_len = len;
                self.state = DecodeState::ReadingMessageBody;
                None
            }
            DecodeState::ReadingData | DecodeState::ReadingMessageBody => {
                self.frame.push(byte);
                if self.frame.len() < self.expected_len {
                    return None;
                }
                let is_data = self.state == DecodeState::ReadingData;
                if byte != STOP_MARKER {
                    let kind = if is_data { "data" } else { "message" };
                    return self.broken(format!(
                        "invalid {kind} frame: no stop marker, received {byte:#04X} at index {}",
                        self.frame.len() - 1
                    ));
                }
                self.state = DecodeState::WaitStart0;
                if is_data {
                    let now = now.unwrap_or_else(Instant::now);
                    Some(FrameEvent::Record(self.decode_data_frame(now)))
                } else {
                    Some(FrameEvent::Message(classify_message(&self.frame)))
                }
            }
        }
    }

    fn broken(&mut self, detail: String) -> Option<FrameEvent> {
        debug!("frame broken: {}", detail);
        self.state = DecodeState::WaitStart0;
        self.frame.clear();
        Some(FrameEvent::Message(DeviceMessage {
            kind: MessageKind::FrameBroken,
            detail,
        }))
    }

    fn decode_data_frame(&mut self, now: Instant) -> DataRecord {
        let Self {
            config,
            frame,
            accelerometer_prev,
            sequence,
            decoded_len,
            ..
        } = self;
        let Some(config) = config.as_ref() else {
            return DataRecord {
                samples: Vec::new(),
                number: 0,
            };
        };

        let noise_divider = config.noise_divider.max(1);
        let mut samples = Vec::with_capacity(*decoded_len);
        let mut offset = DATA_FRAME_HEADER_LEN;

        for ch in config.enabled_channels() {
            for _ in 0..ch.divider.samples_per_record() {
                samples.push(read_i24_le(frame, offset) / noise_divider);
                offset += 3;
            }
        }

        if config.accelerometer_enabled {
            let mut axes = [0i32; ACCELEROMETER_AXES];
            for axis in axes.iter_mut() {
                *axis = read_i16_le(frame, offset);
                offset += 2;
            }
            if config.accelerometer_one_channel_mode {
                let mut movement = 0;
                for (value, prev) in axes.iter().zip(accelerometer_prev.iter_mut()) {
                    movement += (value - *prev).abs();
                    *prev = *value;
                }
                samples.push(movement);
            } else {
                samples.extend_from_slice(&axes);
            }
        }

        if config.battery_voltage_enabled {
            samples.push(read_i16_le(frame, offset));
            offset += 2;
        }

        if config.is_lead_off_enabled() {
            match config.device_type() {
                DeviceType::TwoChannel => samples.push(frame[offset] as i32),
                DeviceType::EightChannel => {
                    samples.push(u16::from_le_bytes([frame[offset], frame[offset + 1]]) as i32)
                }
            }
        }

        let counter = u16::from_le_bytes([frame[2], frame[3]]);
        let number = sequence.next(counter, now);
        trace!("data record: counter={}, number={}", counter, number);

        DataRecord { samples, number }
    }
}

fn read_i24_le(data: &[u8], offset: usize) -> i32 {
    let raw = (data[offset] as u32) | ((data[offset + 1] as u32) << 8) | ((data[offset + 2] as u32) << 16);
    ((raw << 8) as i32) >> 8
}

fn read_i16_le(data: &[u8], offset: usize) -> i32 {
    i16::from_le_bytes([data[offset], data[offset + 1]]) as i32
}

/// Match a complete message frame against the known message table.
fn classify_message(frame: &[u8]) -> DeviceMessage {
    // strip AA A5 <len> ... 55
    let body = &frame[3..frame.len() - 1];
    let (kind, detail) = match body[0] {
        MSG_HELLO => (MessageKind::Hello, "hello".to_string()),
        MSG_STOP_RECORDING => (MessageKind::StopRecording, "recording stopped".to_string()),
        MSG_FIRMWARE => (
            MessageKind::Firmware,
            format!("firmware version {:02X?}", &body[1..]),
        ),
        MSG_HARDWARE => match body.get(1).copied().and_then(DeviceType::from_hardware_code) {
            Some(device_type) => (
                MessageKind::HardwareType(device_type),
                format!("{device_type} device"),
            ),
            None => (
                MessageKind::Unknown,
                format!("unknown hardware report {:02X?}", frame),
            ),
        },
        MSG_WARNING => match body.get(2).copied() {
            Some(WARNING_LOW_BATTERY) => (MessageKind::LowBattery, "low battery".to_string()),
            Some(WARNING_TX_FAIL) => (
                MessageKind::TxFail,
                "device failed to transmit data".to_string(),
            ),
            _ => (
                MessageKind::Unknown,
                format!("unknown warning {:02X?}", frame),
            ),
        },
        _ => (MessageKind::Unknown, format!("unknown message {:02X?}", frame)),
    };
    DeviceMessage { kind, detail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Divider, DeviceType};
    use proptest::prelude::*;

    struct Payload {
        channels: Vec<i32>,
        accelerometer: [i16; 3],
        battery: i16,
        lead_off: u16,
    }

    fn build_frame(config: &DeviceConfig, counter: u16, payload: &Payload) -> Vec<u8> {
        let mut frame = vec![START_MARKER, START_MARKER];
        frame.extend_from_slice(&counter.to_le_bytes());
        for v in &payload.channels {
            frame.extend_from_slice(&v.to_le_bytes()[..3]);
        }
        if config.accelerometer_enabled {
            for a in payload.accelerometer {
                frame.extend_from_slice(&a.to_le_bytes());
            }
        }
        if config.battery_voltage_enabled {
            frame.extend_from_slice(&payload.battery.to_le_bytes());
        }
        if config.is_lead_off_enabled() {
            let bytes = payload.lead_off.to_le_bytes();
            match config.device_type() {
                DeviceType::TwoChannel => frame.push(bytes[0]),
                DeviceType::EightChannel => frame.extend_from_slice(&bytes),
            }
        }
        frame.push(STOP_MARKER);
        frame
    }

    fn scenario_config() -> DeviceConfig {
        let mut config = DeviceConfig::new(DeviceType::TwoChannel);
        config.channel_mut(0).unwrap().divider = Divider::D1;
        config.channel_mut(1).unwrap().enabled = false;
        config.accelerometer_enabled = true;
        config.battery_voltage_enabled = true;
        config
    }

    fn records(events: Vec<FrameEvent>) -> Vec<DataRecord> {
        events
            .into_iter()
            .filter_map(|e| match e {
                FrameEvent::Record(r) => Some(r),
                FrameEvent::Message(m) => panic!("unexpected message {m:?}"),
            })
            .collect()
    }

    fn message(bytes: &[u8]) -> DeviceMessage {
        let mut decoder = FrameDecoder::for_messages();
        match decoder.push_bytes(bytes).as_slice() {
            [FrameEvent::Message(m)] => m.clone(),
            other => panic!("expected one message, got {other:?}"),
        }
    }

    #[test]
    fn decodes_two_channel_scenario() {
        let config = scenario_config();
        let channels: Vec<i32> = (0..10).map(|i| i * 1000 - 4000).collect();
        let payload = Payload {
            channels: channels.clone(),
            accelerometer: [100, -200, 300],
            battery: 8000,
            lead_off: 0,
        };
        let frame = build_frame(&config, 7, &payload);
        assert_eq!(frame.len(), raw_frame_len(&config));

        let mut decoder = FrameDecoder::with_config(config.clone());
        let recs = records(decoder.push_bytes(&frame));
        assert_eq!(recs.len(), 1);
        let samples = &recs[0].samples;
        assert_eq!(samples.len(), decoded_frame_len(&config));
        let expected: Vec<i32> = channels.iter().map(|v| v / 2).collect();
        assert_eq!(&samples[..10], expected.as_slice());
        assert_eq!(&samples[10..13], &[100, -200, 300]);
        assert_eq!(samples[13], 8000);
        assert_eq!(recs[0].number, 0);
    }

    #[test]
    fn negative_24_bit_samples_are_sign_extended() {
        let data = [0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x80];
        assert_eq!(read_i24_le(&data, 0), -1);
        assert_eq!(read_i24_le(&data, 3), -(1 << 23));
    }

    #[test]
    fn one_channel_accelerometer_sums_axis_deltas() {
        let mut config = scenario_config();
        config.channel_mut(0).unwrap().divider = Divider::D10;
        config.battery_voltage_enabled = false;
        config.accelerometer_one_channel_mode = true;
        let mut decoder = FrameDecoder::with_config(config.clone());

        let axes = |accelerometer| Payload {
            channels: vec![0],
            accelerometer,
            battery: 0,
            lead_off: 0,
        };
        let mut bytes = build_frame(&config, 1, &axes([10, -10, 5]));
        bytes.extend(build_frame(&config, 2, &axes([12, -15, 5])));
        let recs = records(decoder.push_bytes(&bytes));
        assert_eq!(recs[0].samples, vec![0, 25]);
        assert_eq!(recs[1].samples, vec![0, 2 + 5]);
    }

    #[test]
    fn eight_channel_lead_off_is_two_bytes_wide() {
        let mut config = DeviceConfig::new(DeviceType::EightChannel);
        config.accelerometer_enabled = false;
        for i in 0..8 {
            let ch = config.channel_mut(i).unwrap();
            ch.divider = Divider::D10;
            ch.lead_off_enabled = true;
        }
        let payload = Payload {
            channels: vec![2; 8],
            accelerometer: [0; 3],
            battery: 0,
            lead_off: 0x8001,
        };
        let mut decoder = FrameDecoder::with_config(config.clone());
        let recs = records(decoder.push_bytes(&build_frame(&config, 0, &payload)));
        assert_eq!(recs[0].samples.len(), 9);
        assert_eq!(recs[0].samples[8], 0x8001);
    }

    #[test]
    fn missing_stop_marker_is_reported_and_decoding_resumes() {
        let config = scenario_config();
        let payload = Payload {
            channels: vec![1; 10],
            accelerometer: [0; 3],
            battery: 0,
            lead_off: 0,
        };
        let mut bad = build_frame(&config, 1, &payload);
        *bad.last_mut().unwrap() = 0x00;
        let good = build_frame(&config, 2, &payload);

        let mut decoder = FrameDecoder::with_config(config.clone());
        let mut events = decoder.push_bytes(&bad);
        assert_eq!(events.len(), 1);
        match events.remove(0) {
            FrameEvent::Message(m) => {
                assert_eq!(m.kind, MessageKind::FrameBroken);
                assert!(m.detail.contains("no stop marker"));
            }
            other => panic!("unexpected {other:?}"),
        }
        let recs = records(decoder.push_bytes(&good));
        assert_eq!(recs.len(), 1);
    }

    #[test]
    fn data_frame_without_config_is_broken() {
        let mut decoder = FrameDecoder::for_messages();
        let events = decoder.push_bytes(&[START_MARKER, START_MARKER]);
        assert!(matches!(
            events.as_slice(),
            [FrameEvent::Message(DeviceMessage { kind: MessageKind::FrameBroken, .. })]
        ));
        // still decodes messages afterwards
        assert_eq!(
            decoder.push_bytes(&[0xAA, 0xA5, 0x05, MSG_HELLO, 0x55]),
            vec![FrameEvent::Message(DeviceMessage {
                kind: MessageKind::Hello,
                detail: "hello".into()
            })]
        );
    }

    #[test]
    fn oversized_message_length_is_rejected() {
        let mut decoder = FrameDecoder::for_messages();
        let events = decoder.push_bytes(&[0xAA, 0xA5, 0x09]);
        assert!(matches!(
            events.as_slice(),
            [FrameEvent::Message(DeviceMessage { kind: MessageKind::FrameBroken, .. })]
        ));
    }

    #[test]
    fn stray_bytes_are_reported_one_by_one() {
        let mut decoder = FrameDecoder::for_messages();
        let events = decoder.push_bytes(&[0x01, 0x02]);
        assert_eq!(events.len(), 2);
        let events = decoder.push_bytes(&[0xAA, 0x13]);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn message_table() {
        assert_eq!(message(&[0xAA, 0xA5, 0x05, 0xA0, 0x55]).kind, MessageKind::Hello);
        assert_eq!(
            message(&[0xAA, 0xA5, 0x05, 0xA5, 0x55]).kind,
            MessageKind::StopRecording
        );
        assert_eq!(
            message(&[0xAA, 0xA5, 0x07, 0xA1, 0x02, 0x05, 0x55]).kind,
            MessageKind::Firmware
        );
        assert_eq!(
            message(&[0xAA, 0xA5, 0x07, 0xA4, 0x02, 0x01, 0x55]).kind,
            MessageKind::HardwareType(DeviceType::TwoChannel)
        );
        assert_eq!(
            message(&[0xAA, 0xA5, 0x07, 0xA4, 0x08, 0x01, 0x55]).kind,
            MessageKind::HardwareType(DeviceType::EightChannel)
        );
        assert_eq!(
            message(&[0xAA, 0xA5, 0x07, 0xA3, 0x00, 0x01, 0x55]).kind,
            MessageKind::LowBattery
        );
        assert_eq!(
            message(&[0xAA, 0xA5, 0x07, 0xA3, 0x00, 0x02, 0x55]).kind,
            MessageKind::TxFail
        );
        assert_eq!(message(&[0xAA, 0xA5, 0x05, 0x42, 0x55]).kind, MessageKind::Unknown);
        assert_eq!(
            message(&[0xAA, 0xA5, 0x05, 0xA4, 0x55]).kind,
            MessageKind::Unknown
        );
    }

    #[test]
    fn record_numbers_follow_the_counter() {
        let config = scenario_config();
        let payload = Payload {
            channels: vec![0; 10],
            accelerometer: [0; 3],
            battery: 0,
            lead_off: 0,
        };
        let mut decoder = FrameDecoder::with_config(config.clone());
        let start = Instant::now();
        let mut numbers = Vec::new();
        for (i, counter) in [65534u16, 65535, 0, 1].into_iter().enumerate() {
            let at = start + Duration::from_millis(20 * i as u64);
            for b in build_frame(&config, counter, &payload) {
                if let Some(FrameEvent::Record(r)) = decoder.push_byte_at(b, at) {
                    numbers.push(r.number);
                }
            }
        }
        assert_eq!(numbers, vec![0, 1, 2, 3]);
    }

    #[test]
    fn sequence_adds_wraps_missed_during_a_stall() {
        let mut seq = RecordSequence::new(Duration::from_millis(20));
        let t0 = Instant::now();
        assert_eq!(seq.next(100, t0), 0);
        // 1.2 wrap periods pass; the counter moved 0.2 of a wrap
        let advance = COUNTER_WRAP * 12 / 10;
        let counter = ((100 + advance) % COUNTER_WRAP) as u16;
        let later = t0 + Duration::from_millis((advance * 20) as u64);
        assert_eq!(seq.next(counter, later), advance);
    }

    #[test]
    fn sequence_does_not_double_count_a_raw_wrap() {
        let mut seq = RecordSequence::new(Duration::from_millis(20));
        let t0 = Instant::now();
        seq.next(1000, t0);
        // the device advanced 0.98 of a wrap but the clock saw 1.01 wrap periods
        let advance = COUNTER_WRAP * 98 / 100;
        let counter = (1000 + advance) as u16;
        let elapsed_ms = (COUNTER_WRAP * 20) * 101 / 100;
        let number = seq.next(counter, t0 + Duration::from_millis(elapsed_ms as u64));
        assert_eq!(number, advance);
    }

    #[test]
    fn sequence_treats_repeated_counter_as_full_wrap() {
        let mut seq = RecordSequence::new(Duration::from_millis(20));
        let t0 = Instant::now();
        seq.next(5, t0);
        assert_eq!(seq.next(5, t0 + Duration::from_millis(20)), COUNTER_WRAP);
    }

    fn arb_config() -> impl Strategy<Value = DeviceConfig> {
        (
            prop::bool::ANY,
            prop::collection::vec((prop::bool::ANY, 0..4usize, prop::bool::ANY), 8),
            prop::bool::ANY,
            prop::bool::ANY,
            prop::bool::ANY,
            1..5i32,
        )
            .prop_map(|(eight, channels, acc, one_channel, battery, noise)| {
                let device_type = if eight {
                    DeviceType::EightChannel
                } else {
                    DeviceType::TwoChannel
                };
                let mut config = DeviceConfig::new(device_type);
                for (i, (enabled, divider, lead_off)) in
                    channels.into_iter().take(device_type.channel_count()).enumerate()
                {
                    let ch = config.channel_mut(i).unwrap();
                    ch.enabled = enabled;
                    ch.divider = Divider::ALL[divider];
                    ch.lead_off_enabled = lead_off;
                }
                config.accelerometer_enabled = acc;
                config.accelerometer_one_channel_mode = one_channel;
                config.battery_voltage_enabled = battery;
                config.noise_divider = noise;
                config.normalized()
            })
    }

    proptest! {
        #[test]
        fn synthetic_frames_decode_to_expected_layout(
            config in arb_config(),
            values in prop::collection::vec(-(1i32 << 23)..(1i32 << 23), 80),
            counter in any::<u16>(),
        ) {
            let n_samples: usize = config
                .enabled_channels()
                .map(|ch| ch.divider.samples_per_record())
                .sum();
            let payload = Payload {
                channels: values[..n_samples].to_vec(),
                accelerometer: [1, 2, 3],
                battery: 5000,
                lead_off: 0x0102,
            };
            let frame = build_frame(&config, counter, &payload);
            prop_assert_eq!(frame.len(), raw_frame_len(&config));

            let mut decoder = FrameDecoder::with_config(config.clone());
            let events = decoder.push_bytes(&frame);
            prop_assert_eq!(events.len(), 1);
            let FrameEvent::Record(record) = &events[0] else {
                return Err(TestCaseError::fail(format!("not a record: {:?}", events[0])));
            };
            prop_assert_eq!(record.samples.len(), decoded_frame_len(&config));
            for (decoded, raw) in record.samples.iter().zip(&payload.channels) {
                prop_assert_eq!(*decoded, raw / config.noise_divider);
            }
        }

        #[test]
        fn constant_step_counters_reconstruct_monotonically(
            start in any::<u16>(),
            step in 1u16..20_000,
            count in 2usize..400,
            gap_ms in 0u64..=20,
        ) {
            let mut seq = RecordSequence::new(Duration::from_millis(20));
            let t0 = Instant::now();
            let mut counter = start;
            let mut previous = seq.next(counter, t0);
            for i in 1..count {
                counter = counter.wrapping_add(step);
                let number = seq.next(counter, t0 + Duration::from_millis(gap_ms * i as u64));
                prop_assert_eq!(number - previous, step as i64);
                previous = number;
            }
        }
    }
}
