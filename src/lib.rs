//! Driver for 2- and 8-channel biopotential recorders.
//!
//! The device streams signals sampled by an ADS1298-class converter over a serial
//! link (USB cable or Bluetooth SPP). This crate covers the host side of its
//! protocol:
//!
//! - [`command`] builds the binary configuration command from a [`DeviceConfig`].
//! - [`decoder`] turns the received byte stream into data records and device
//!   messages, rebuilding monotonic record numbers from the 16-bit frame counter.
//! - [`session`] drives a device through connect → configure → record → stop and
//!   keeps the link alive while idle or recording.
//! - [`indicators`] derives battery charge and electrode contact from records.
//!
//! # Timing
//!
//! The device samples at a rate fixed by its crystal, but the link delivers frames
//! with variable latency, sometimes in bursts after a stall. Use the record number
//! passed to the data listener, not arrival time, to place samples: record `n`
//! starts at `n * config.duration_of_data_record()` seconds after the first one.

pub mod command;
pub mod config;
pub mod decoder;
mod errors;
pub mod indicators;
pub mod logging;
pub mod session;
pub mod transport;
pub mod worker;

pub use command::encode_config;
pub use config::{
    decoded_frame_len, raw_frame_len, ChannelConfig, Commutator, DeviceConfig, DeviceState,
    DeviceType, Divider, Gain, SampleRate,
};
pub use decoder::{DataRecord, DeviceMessage, FrameDecoder, FrameEvent, MessageKind};
pub use errors::*;
pub use indicators::{battery_voltage, extract_battery_percentage, extract_lead_off_mask};
pub use session::{DeviceSession, SessionTiming, StartHandle};
pub use transport::{SerialTransport, Transport};
