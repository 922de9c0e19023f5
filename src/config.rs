//! Recording configuration for the 2- and 8-channel recorders.
//!
//! A [`DeviceConfig`] fully determines two things on the wire: the bytes of the
//! configuration command sent to the firmware (see [`crate::command`]) and the
//! layout of every data frame the device streams back (see [`crate::decoder`]).
//!
//! # Data record period
//!
//! The device packs `max_divider / divider` samples of every enabled channel into
//! one data frame. The frame period is therefore pinned to the coarsest divider,
//! `Divider::MAX / sample_rate`, so that every channel's sample count divides it
//! evenly.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

// ============================================================================
// Constants
// ============================================================================

/// Default divisor applied to every raw 24-bit channel sample to drop noise bits.
pub const DEFAULT_NOISE_DIVIDER: i32 = 2;

/// Bytes before the payload of a data frame: two start markers + 16-bit counter.
pub const DATA_FRAME_HEADER_LEN: usize = 4;
/// Bytes after the payload of a data frame: the stop marker.
pub const DATA_FRAME_FOOTER_LEN: usize = 1;

const BYTES_PER_CHANNEL_SAMPLE: usize = 3;
const BYTES_PER_ACCELEROMETER_AXIS: usize = 2;
const BYTES_BATTERY: usize = 2;
pub(crate) const ACCELEROMETER_AXES: usize = 3;

// ============================================================================
// Enumerations
// ============================================================================

/// Hardware variant of the recorder. Each variant has a fixed channel count
/// and its own register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    TwoChannel,
    EightChannel,
}

impl DeviceType {
    pub fn channel_count(self) -> usize {
        match self {
            DeviceType::TwoChannel => 2,
            DeviceType::EightChannel => 8,
        }
    }

    /// Code the firmware uses for this variant in its hardware report.
    pub fn hardware_code(self) -> u8 {
        match self {
            DeviceType::TwoChannel => 0x02,
            DeviceType::EightChannel => 0x08,
        }
    }

    pub fn from_hardware_code(code: u8) -> Option<Self> {
        match code {
            0x02 => Some(DeviceType::TwoChannel),
            0x08 => Some(DeviceType::EightChannel),
            _ => None,
        }
    }

    /// Width in bytes of the lead-off status field in a data frame.
    pub(crate) fn lead_off_status_len(self) -> usize {
        match self {
            DeviceType::TwoChannel => 1,
            DeviceType::EightChannel => 2,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceType::TwoChannel => write!(f, "2-channel"),
            DeviceType::EightChannel => write!(f, "8-channel"),
        }
    }
}

/// Device sampling rate, before per-channel division.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SampleRate {
    #[default]
    Hz500 = 500,
    Hz1000 = 1000,
    Hz2000 = 2000,
}

impl SampleRate {
    pub fn hz(self) -> u32 {
        self as u32
    }

    /// Parse a rate in Hz, rejecting anything the firmware does not support.
    pub fn from_hz(value: u32) -> Result<Self> {
        match value {
            500 => Ok(SampleRate::Hz500),
            1000 => Ok(SampleRate::Hz1000),
            2000 => Ok(SampleRate::Hz2000),
            _ => Err(DriverError::InvalidArgument(format!(
                "unsupported sample rate {value}. Supported: 500, 1000, 2000"
            ))),
        }
    }
}

/// Factor by which a channel's rate is reduced from the device rate.
///
/// Variants are ordered; the last one is the maximum divider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Divider {
    #[default]
    D1 = 1,
    D2 = 2,
    D5 = 5,
    D10 = 10,
}

impl Divider {
    pub const ALL: [Divider; 4] = [Divider::D1, Divider::D2, Divider::D5, Divider::D10];
    pub const MAX: Divider = Divider::D10;

    pub fn value(self) -> u8 {
        self as u8
    }

    /// Number of samples this divider contributes to one data record.
    pub fn samples_per_record(self) -> usize {
        (Divider::MAX.value() / self.value()) as usize
    }
}

/// Programmable amplifier gain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Gain {
    G1,
    G2,
    G3,
    G4,
    #[default]
    G6,
    G8,
    G12,
}

impl Gain {
    /// Physical amplification factor.
    pub fn value(self) -> u8 {
        match self {
            Gain::G1 => 1,
            Gain::G2 => 2,
            Gain::G3 => 3,
            Gain::G4 => 4,
            Gain::G6 => 6,
            Gain::G8 => 8,
            Gain::G12 => 12,
        }
    }

    /// 3-bit code for the GAIN field of a channel settings register.
    pub fn register_code(self) -> u8 {
        match self {
            Gain::G6 => 0b000,
            Gain::G1 => 0b001,
            Gain::G2 => 0b010,
            Gain::G3 => 0b011,
            Gain::G4 => 0b100,
            Gain::G8 => 0b101,
            Gain::G12 => 0b110,
        }
    }
}

/// Channel input multiplexer setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Commutator {
    /// Normal electrode input.
    #[default]
    Input,
    /// Inputs shorted together (noise measurement).
    InputShort,
    /// Internal test signal.
    TestSignal,
}

impl Commutator {
    /// MUX bits of a channel settings register.
    pub fn register_code(self) -> u8 {
        match self {
            Commutator::Input => 0x00,
            Commutator::InputShort => 0x01,
            Commutator::TestSignal => 0x05,
        }
    }
}

// ============================================================================
// Channel / Device configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    pub divider: Divider,
    pub gain: Gain,
    pub commutator: Commutator,
    pub enabled: bool,
    pub lead_off_enabled: bool,
    pub rld_sense_enabled: bool,
}

impl ChannelConfig {
    fn with_name(name: String) -> Self {
        Self {
            name,
            divider: Divider::default(),
            gain: Gain::default(),
            commutator: Commutator::default(),
            enabled: true,
            lead_off_enabled: false,
            rld_sense_enabled: false,
        }
    }

    /// Whether lead-off status for this channel's electrodes is meaningful.
    pub fn reports_lead_off(&self) -> bool {
        self.enabled && self.lead_off_enabled && self.commutator == Commutator::Input
    }
}

/// Full recording configuration for one session attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    device_type: DeviceType,
    channels: Vec<ChannelConfig>,
    pub sample_rate: SampleRate,
    pub noise_divider: i32,
    pub accelerometer_enabled: bool,
    pub accelerometer_one_channel_mode: bool,
    pub battery_voltage_enabled: bool,
}

impl DeviceConfig {
    pub fn new(device_type: DeviceType) -> Self {
        let channels = (0..device_type.channel_count())
            .map(|i| ChannelConfig::with_name((i + 1).to_string()))
            .collect();
        Self {
            device_type,
            channels,
            sample_rate: SampleRate::default(),
            noise_divider: DEFAULT_NOISE_DIVIDER,
            accelerometer_enabled: true,
            accelerometer_one_channel_mode: false,
            battery_voltage_enabled: false,
        }
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn channel(&self, index: usize) -> Option<&ChannelConfig> {
        self.channels.get(index)
    }

    pub fn channel_mut(&mut self, index: usize) -> Option<&mut ChannelConfig> {
        self.channels.get_mut(index)
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|ch| ch.enabled)
    }

    pub fn is_all_channels_disabled(&self) -> bool {
        !self.channels.iter().any(|ch| ch.enabled)
    }

    /// True if at least one enabled channel has lead-off detection on, which makes
    /// the device append a lead-off status field to every data frame.
    pub fn is_lead_off_enabled(&self) -> bool {
        self.channels.iter().any(|ch| ch.enabled && ch.lead_off_enabled)
    }

    pub fn is_test_signal_enabled(&self) -> bool {
        self.channels
            .iter()
            .any(|ch| ch.enabled && ch.commutator == Commutator::TestSignal)
    }

    /// Length of one data record in seconds: `Divider::MAX / sample_rate`.
    pub fn duration_of_data_record(&self) -> f64 {
        Divider::MAX.value() as f64 / self.sample_rate.hz() as f64
    }

    /// Same as [`duration_of_data_record`](Self::duration_of_data_record), in whole
    /// milliseconds.
    pub fn record_duration_ms(&self) -> u64 {
        Divider::MAX.value() as u64 * 1000 / self.sample_rate.hz() as u64
    }

    pub fn channel_sample_rate(&self, index: usize) -> Option<f64> {
        self.channels
            .get(index)
            .map(|ch| self.sample_rate.hz() as f64 / ch.divider.value() as f64)
    }

    /// The accelerometer delivers one sample per axis per record, i.e. it always
    /// runs at `Divider::MAX`.
    pub fn accelerometer_sample_rate(&self) -> f64 {
        self.sample_rate.hz() as f64 / Divider::MAX.value() as f64
    }

    /// Copy with lead-off and RLD-sense switched off on every disabled channel.
    pub fn normalized(&self) -> Self {
        let mut copy = self.clone();
        for ch in copy.channels.iter_mut().filter(|ch| !ch.enabled) {
            ch.lead_off_enabled = false;
            ch.rld_sense_enabled = false;
        }
        copy
    }

    /// Check invariants that deserialized configs may violate.
    pub fn validate(&self) -> Result<()> {
        if self.channels.len() != self.device_type.channel_count() {
            return Err(DriverError::InvalidArgument(format!(
                "{} device needs {} channels, config has {}",
                self.device_type,
                self.device_type.channel_count(),
                self.channels.len()
            )));
        }
        if self.noise_divider < 1 {
            return Err(DriverError::InvalidArgument(format!(
                "noise divider must be >= 1, got {}",
                self.noise_divider
            )));
        }
        Ok(())
    }
}

/// Number of bytes in one data frame produced under `config`, markers included.
pub fn raw_frame_len(config: &DeviceConfig) -> usize {
    let mut len = DATA_FRAME_HEADER_LEN;
    for ch in config.enabled_channels() {
        len += ch.divider.samples_per_record() * BYTES_PER_CHANNEL_SAMPLE;
    }
    if config.accelerometer_enabled {
        len += ACCELEROMETER_AXES * BYTES_PER_ACCELEROMETER_AXIS;
    }
    if config.battery_voltage_enabled {
        len += BYTES_BATTERY;
    }
    if config.is_lead_off_enabled() {
        len += config.device_type().lead_off_status_len();
    }
    len + DATA_FRAME_FOOTER_LEN
}

/// Number of values in one decoded data record under `config`.
pub fn decoded_frame_len(config: &DeviceConfig) -> usize {
    let mut len: usize = config
        .enabled_channels()
        .map(|ch| ch.divider.samples_per_record())
        .sum();
    if config.accelerometer_enabled {
        len += if config.accelerometer_one_channel_mode {
            1
        } else {
            ACCELEROMETER_AXES
        };
    }
    if config.battery_voltage_enabled {
        len += 1;
    }
    if config.is_lead_off_enabled() {
        len += 1;
    }
    len
}

// ============================================================================
// Device state
// ============================================================================

/// Recording state of the device as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeviceState {
    /// Never explicitly stopped, or a start attempt failed.
    #[default]
    Undefined = 0,
    /// The device acknowledged a stop command.
    Stopped = 1,
    Recording = 2,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => DeviceState::Stopped,
            2 => DeviceState::Recording,
            _ => DeviceState::Undefined,
        }
    }
}

/// [`DeviceState`] cell shared between the transport reader and the caller.
///
/// Transitions go through [`compare_exchange`](Self::compare_exchange) so that a
/// teardown and an in-flight callback cannot overwrite each other.
#[derive(Debug, Default)]
pub struct AtomicDeviceState(AtomicU8);

impl AtomicDeviceState {
    pub fn new(state: DeviceState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Set `new` if the current value is `current`. Returns the previous value on
    /// success and the actual value on failure.
    pub fn compare_exchange(
        &self,
        current: DeviceState,
        new: DeviceState,
    ) -> std::result::Result<DeviceState, DeviceState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(DeviceState::from_u8)
            .map_err(DeviceState::from_u8)
    }
}
