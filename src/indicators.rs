//! Physiological indicators derived from decoded data records.

use crate::config::{decoded_frame_len, DeviceConfig, DeviceType};
use crate::errors::{DriverError, Result};

/// Digital range of the battery sample.
pub const BATTERY_DIGITAL_MIN: i32 = 0;
pub const BATTERY_DIGITAL_MAX: i32 = 10240;
/// Voltage at [`BATTERY_DIGITAL_MAX`].
const BATTERY_PHYSICAL_MAX_VOLTS: f64 = 5.12;

/// Lithium cell voltage reported as the lowest percentage.
const LITHIUM_EMPTY_VOLTS: f64 = 3.6;
/// Lithium cell voltage reported as 100%.
const LITHIUM_FULL_VOLTS: f64 = 4.2;
const MIN_PERCENTAGE: f64 = 10.0;
const MAX_PERCENTAGE: f64 = 100.0;

fn check_record_len(record: &[i32], config: &DeviceConfig) -> Result<()> {
    let expected = decoded_frame_len(config);
    if record.len() != expected {
        return Err(DriverError::InvalidArgument(format!(
            "record has {} values, config expects {}",
            record.len(),
            expected
        )));
    }
    Ok(())
}

/// Per-electrode contact status, two entries per channel (positive then negative).
///
/// `Some(true)` = electrode disconnected, `Some(false)` = connected, `None` = not
/// applicable (channel disabled, lead-off detection off, or input not routed to
/// the electrodes).
pub fn extract_lead_off_mask(record: &[i32], config: &DeviceConfig) -> Result<Vec<Option<bool>>> {
    if !config.is_lead_off_enabled() {
        return Err(DriverError::InvalidArgument(
            "lead-off detection is disabled in this config".into(),
        ));
    }
    check_record_len(record, config)?;

    // lead-off status is always the last value of the record
    let status = record[record.len() - 1] as u32;
    let bits = match config.device_type() {
        DeviceType::TwoChannel => status,
        // first byte: negative electrodes, second byte: positive electrodes
        DeviceType::EightChannel => (0..8).fold(0u32, |bits, i| {
            bits | (((status >> (8 + i)) & 1) << (2 * i)) | (((status >> i) & 1) << (2 * i + 1))
        }),
    };

    let mut mask = vec![None; config.channel_count() * 2];
    for (i, ch) in config.channels().iter().enumerate() {
        if !ch.reports_lead_off() {
            continue;
        }
        for electrode in [2 * i, 2 * i + 1] {
            mask[electrode] = Some((bits >> electrode) & 1 == 1);
        }
    }
    Ok(mask)
}

/// Raw battery sample of `record`, range-checked.
fn battery_sample(record: &[i32], config: &DeviceConfig) -> Result<i32> {
    if !config.battery_voltage_enabled {
        return Err(DriverError::InvalidArgument(
            "battery voltage measurement is disabled in this config".into(),
        ));
    }
    check_record_len(record, config)?;

    let index = if config.is_lead_off_enabled() {
        record.len() - 2
    } else {
        record.len() - 1
    };
    let value = record[index];
    if !(BATTERY_DIGITAL_MIN..=BATTERY_DIGITAL_MAX).contains(&value) {
        return Err(DriverError::InvalidArgument(format!(
            "battery value {value} outside {BATTERY_DIGITAL_MIN}..={BATTERY_DIGITAL_MAX}"
        )));
    }
    Ok(value)
}

/// Battery voltage carried by `record`.
pub fn battery_voltage(record: &[i32], config: &DeviceConfig) -> Result<f64> {
    let value = battery_sample(record, config)?;
    Ok(digital_to_volts(value))
}

/// Battery charge in percent, 10..=100.
pub fn extract_battery_percentage(record: &[i32], config: &DeviceConfig) -> Result<u8> {
    let volts = battery_voltage(record, config)?;
    let fraction = (volts - LITHIUM_EMPTY_VOLTS) / (LITHIUM_FULL_VOLTS - LITHIUM_EMPTY_VOLTS);
    let percentage = MIN_PERCENTAGE + fraction * (MAX_PERCENTAGE - MIN_PERCENTAGE);
    Ok(percentage.clamp(MIN_PERCENTAGE, MAX_PERCENTAGE).round() as u8)
}

fn digital_to_volts(value: i32) -> f64 {
    let span = (BATTERY_DIGITAL_MAX - BATTERY_DIGITAL_MIN) as f64;
    (value - BATTERY_DIGITAL_MIN) as f64 / span * BATTERY_PHYSICAL_MAX_VOLTS
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Commutator, Divider};

    fn eight_channel_lead_off() -> DeviceConfig {
        let mut config = DeviceConfig::new(DeviceType::EightChannel);
        config.accelerometer_enabled = false;
        for i in 0..8 {
            let ch = config.channel_mut(i).unwrap();
            ch.divider = Divider::D10;
            ch.lead_off_enabled = true;
        }
        config
    }

    fn record_with_tail(config: &DeviceConfig, tail: &[i32]) -> Vec<i32> {
        let mut record = vec![0; decoded_frame_len(config) - tail.len()];
        record.extend_from_slice(tail);
        record
    }

    #[test]
    fn eight_channel_status_bytes_are_interleaved() {
        let mut config = eight_channel_lead_off();
        config.channel_mut(1).unwrap().enabled = false;
        let record = record_with_tail(&config, &[0x0101 | 0x0202]);

        let mask = extract_lead_off_mask(&record, &config).unwrap();
        assert_eq!(mask.len(), 16);
        assert_eq!(mask[0], Some(true));
        assert_eq!(mask[1], Some(true));
        // channel 1 is disabled: not applicable regardless of raw bits
        assert_eq!(mask[2], None);
        assert_eq!(mask[3], None);
        assert!(mask[4..].iter().all(|m| *m == Some(false)));
    }

    #[test]
    fn eight_channel_positive_and_negative_come_from_different_bytes() {
        let config = eight_channel_lead_off();
        // negative electrode of channel 2 (first byte), positive of channel 5 (second byte)
        let record = record_with_tail(&config, &[(1 << 2) | (1 << (8 + 5))]);
        let mask = extract_lead_off_mask(&record, &config).unwrap();
        let disconnected: Vec<usize> = (0..16).filter(|&i| mask[i] == Some(true)).collect();
        assert_eq!(disconnected, vec![2 * 2 + 1, 2 * 5]);
    }

    #[test]
    fn two_channel_bits_map_directly() {
        let mut config = DeviceConfig::new(DeviceType::TwoChannel);
        config.accelerometer_enabled = false;
        config.channel_mut(0).unwrap().lead_off_enabled = true;
        config.channel_mut(1).unwrap().lead_off_enabled = true;
        config.channel_mut(1).unwrap().commutator = Commutator::TestSignal;
        let record = record_with_tail(&config, &[0b0110]);

        let mask = extract_lead_off_mask(&record, &config).unwrap();
        assert_eq!(mask, vec![Some(false), Some(true), None, None]);
    }

    #[test]
    fn lead_off_requires_lead_off_config() {
        let config = DeviceConfig::new(DeviceType::TwoChannel);
        let record = vec![0; decoded_frame_len(&config)];
        assert!(matches!(
            extract_lead_off_mask(&record, &config),
            Err(DriverError::InvalidArgument(_))
        ));
    }

    #[test]
    fn record_length_must_match_config() {
        let config = eight_channel_lead_off();
        assert!(extract_lead_off_mask(&[0, 1], &config).is_err());
    }

    fn battery_config(lead_off: bool) -> DeviceConfig {
        let mut config = DeviceConfig::new(DeviceType::TwoChannel);
        config.battery_voltage_enabled = true;
        config.channel_mut(0).unwrap().lead_off_enabled = lead_off;
        config
    }

    #[test]
    fn battery_range_ends_clamp() {
        let config = battery_config(false);
        let low = record_with_tail(&config, &[BATTERY_DIGITAL_MIN]);
        let high = record_with_tail(&config, &[BATTERY_DIGITAL_MAX]);
        assert_eq!(extract_battery_percentage(&low, &config).unwrap(), 10);
        assert_eq!(extract_battery_percentage(&high, &config).unwrap(), 100);
    }

    #[test]
    fn battery_out_of_range_is_rejected() {
        let config = battery_config(false);
        for value in [BATTERY_DIGITAL_MIN - 1, BATTERY_DIGITAL_MAX + 1] {
            let record = record_with_tail(&config, &[value]);
            assert!(matches!(
                extract_battery_percentage(&record, &config),
                Err(DriverError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn battery_scales_linearly_within_lithium_range() {
        let config = battery_config(true);
        // 3.9 V is halfway between empty and full; lead-off status follows it
        let value = (3.9 / BATTERY_PHYSICAL_MAX_VOLTS * BATTERY_DIGITAL_MAX as f64).round() as i32;
        let record = record_with_tail(&config, &[value, 0xFF]);
        assert_eq!(extract_battery_percentage(&record, &config).unwrap(), 55);
        let volts = battery_voltage(&record, &config).unwrap();
        assert!((volts - 3.9).abs() < 0.001);
    }

    #[test]
    fn battery_requires_battery_config() {
        let config = DeviceConfig::new(DeviceType::TwoChannel);
        let record = vec![0; decoded_frame_len(&config)];
        assert!(extract_battery_percentage(&record, &config).is_err());
    }
}
