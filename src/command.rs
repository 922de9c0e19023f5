//! Host → device commands.
//!
//! Besides a handful of single-byte requests, the host configures the device with
//! one binary command built from a [`DeviceConfig`]:
//!
//! ```text
//! <len> F0 11  F1 01 <n> <n register bytes>  F2 <divider per channel>
//! F3 <acc>  F4 <battery>  F5 <lead-off>  F6 <reset timeout>  F0 10  FE  55 55
//! ```
//!
//! `F0 11` stops the converter's continuous mode so the register block can be
//! written, `F0 10` resumes it and `FE` commits the configuration. The register
//! block differs per hardware variant: 10 registers on the 2-channel device, 23 on
//! the 8-channel device. Encoding is total: disabled channels are written as "off"
//! instead of being rejected.

use crate::config::{ChannelConfig, DeviceConfig, DeviceType, SampleRate};

// Single-byte requests
pub const HELLO_REQUEST: u8 = 0xFD;
pub const HARDWARE_REQUEST: u8 = 0xFA;
pub const STOP_REQUEST: u8 = 0xFF;
pub const PING_COMMAND: u8 = 0xFB;

// Sub-commands of the configuration command
const CMD_CONVERTER: u8 = 0xF0;
const CONVERTER_STOP_CONTINUOUS: u8 = 0x11;
const CONVERTER_START_CONTINUOUS: u8 = 0x10;
const CMD_WRITE_REGISTERS: u8 = 0xF1;
const FIRST_REGISTER_ADDRESS: u8 = 0x01;
const CMD_DIVIDERS: u8 = 0xF2;
const CMD_ACCELEROMETER: u8 = 0xF3;
const CMD_BATTERY: u8 = 0xF4;
const CMD_LEAD_OFF_STATUS: u8 = 0xF5;
const CMD_RESET_TIMEOUT: u8 = 0xF6;
const CMD_COMMIT: u8 = 0xFE;
const FOOTER: u8 = 0x55;

/// Seconds without host traffic after which the firmware resets itself.
const RESET_TIMEOUT_SECS: u8 = 20;

/// CHnSET value for a channel that is switched off: power-down bit + shorted input.
pub const CHANNEL_DISABLED_REGISTER: u8 = 0x81;

/// Serializes a [`DeviceConfig`] into the firmware configuration command for one
/// hardware variant.
pub trait ConfigEncoder: Sync {
    /// Number of registers written by the register block.
    fn register_count(&self) -> u8;

    /// Register block contents, starting at register address 0x01.
    fn registers(&self, config: &DeviceConfig) -> Vec<u8>;

    /// Full configuration command.
    fn encode(&self, config: &DeviceConfig) -> Vec<u8> {
        let registers = self.registers(config);
        debug_assert_eq!(registers.len(), self.register_count() as usize);

        let mut cmd = Vec::with_capacity(registers.len() + config.channel_count() + 24);
        cmd.push(0); // length, patched below
        cmd.extend_from_slice(&[CMD_CONVERTER, CONVERTER_STOP_CONTINUOUS]);
        cmd.extend_from_slice(&[CMD_WRITE_REGISTERS, FIRST_REGISTER_ADDRESS, self.register_count()]);
        cmd.extend_from_slice(&registers);

        cmd.push(CMD_DIVIDERS);
        cmd.extend(config.channels().iter().map(divider_byte));

        cmd.extend_from_slice(&[CMD_ACCELEROMETER, config.accelerometer_enabled as u8]);
        cmd.extend_from_slice(&[CMD_BATTERY, config.battery_voltage_enabled as u8]);
        cmd.extend_from_slice(&[CMD_LEAD_OFF_STATUS, config.is_lead_off_enabled() as u8]);
        cmd.extend_from_slice(&[CMD_RESET_TIMEOUT, RESET_TIMEOUT_SECS]);
        cmd.extend_from_slice(&[CMD_CONVERTER, CONVERTER_START_CONTINUOUS]);
        cmd.push(CMD_COMMIT);
        cmd.extend_from_slice(&[FOOTER, FOOTER]);

        cmd[0] = cmd.len() as u8;
        cmd
    }
}

/// Register layout of the 2-channel device.
pub struct TwoChannelEncoder;

/// Register layout of the 8-channel device.
pub struct EightChannelEncoder;

impl DeviceType {
    pub fn encoder(self) -> &'static dyn ConfigEncoder {
        match self {
            DeviceType::TwoChannel => &TwoChannelEncoder,
            DeviceType::EightChannel => &EightChannelEncoder,
        }
    }
}

/// Encode `config` with the encoder of its device variant.
pub fn encode_config(config: &DeviceConfig) -> Vec<u8> {
    config.device_type().encoder().encode(config)
}

fn divider_byte(ch: &ChannelConfig) -> u8 {
    if ch.enabled {
        ch.divider.value()
    } else {
        0
    }
}

/// CHnSET register: gain in bits 6..4, input mux in bits 2..0.
pub fn channel_register(ch: &ChannelConfig) -> u8 {
    if !ch.enabled {
        return CHANNEL_DISABLED_REGISTER;
    }
    (ch.gain.register_code() << 4) | ch.commutator.register_code()
}

/// One bit per channel, `1 << index`, for every channel matching `flag`.
fn channel_bits(config: &DeviceConfig, flag: impl Fn(&ChannelConfig) -> bool) -> u8 {
    config
        .channels()
        .iter()
        .enumerate()
        .filter(|(_, ch)| ch.enabled && flag(ch))
        .fold(0u8, |bits, (i, _)| bits | (1 << i))
}

impl ConfigEncoder for TwoChannelEncoder {
    fn register_count(&self) -> u8 {
        10
    }

    fn registers(&self, config: &DeviceConfig) -> Vec<u8> {
        let config1 = match config.sample_rate {
            SampleRate::Hz500 => 0x02,
            SampleRate::Hz1000 => 0x03,
            SampleRate::Hz2000 => 0x04,
        };

        let mut config2 = 0xA0; // reserved bit + reference buffer on
        if config.is_lead_off_enabled() {
            config2 |= 0x40; // lead-off comparators
        }
        if config.is_test_signal_enabled() {
            config2 |= 0x03; // internal 1 Hz test signal
        }

        let mut rld_sens = channel_bits(config, |ch| ch.rld_sense_enabled);
        if rld_sens != 0 {
            rld_sens |= 0x20; // RLD buffer power
        }
        let loff_sens = channel_bits(config, |ch| ch.lead_off_enabled);

        let ch = config.channels();
        vec![
            config1,
            config2,
            0x10, // LOFF
            channel_register(&ch[0]),
            channel_register(&ch[1]),
            rld_sens,
            loff_sens,
            0x00, // LOFF_STAT
            0x02, // RESP1
            0x03, // RESP2: internal RLD reference
        ]
    }
}

impl ConfigEncoder for EightChannelEncoder {
    fn register_count(&self) -> u8 {
        23
    }

    fn registers(&self, config: &DeviceConfig) -> Vec<u8> {
        // high-resolution mode + data rate
        let config1 = match config.sample_rate {
            SampleRate::Hz500 => 0x86,
            SampleRate::Hz1000 => 0x85,
            SampleRate::Hz2000 => 0x84,
        };
        let config2 = if config.is_test_signal_enabled() { 0x10 } else { 0x00 };
        let config3 = 0xCC; // reference buffer, internal RLD reference, RLD buffer
        let config4 = if config.is_lead_off_enabled() { 0x02 } else { 0x00 };

        let rld = channel_bits(config, |ch| ch.rld_sense_enabled);
        let loff = channel_bits(config, |ch| ch.lead_off_enabled);

        let mut regs = Vec::with_capacity(23);
        regs.extend_from_slice(&[config1, config2, config3, 0x00 /* LOFF */]);
        regs.extend(config.channels().iter().map(channel_register));
        regs.extend_from_slice(&[
            rld,  // RLD_SENSP
            rld,  // RLD_SENSN
            loff, // LOFF_SENSP
            loff, // LOFF_SENSN
            0x00, // LOFF_FLIP
            0x00, // LOFF_STATP
            0x00, // LOFF_STATN
            0x00, // GPIO
            0x00, // PACE
            0x20, // RESP
            config4,
        ]);
        regs
    }
}
