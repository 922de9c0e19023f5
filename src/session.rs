//! Connection lifecycle of one device.
//!
//! [`DeviceSession`] sits between a [`Transport`] and the caller. Received bytes
//! are decoded on the transport's reader thread and dispatched to the registered
//! listeners; commands and background activities (monitoring, the starting
//! sequence, keep-alive) run on a single [`Worker`] so that at most one of them is
//! active at a time.
//!
//! ```no_run
//! use biorecorder_rs::{DeviceConfig, DeviceSession, DeviceType};
//!
//! # fn main() -> biorecorder_rs::Result<()> {
//! let session = DeviceSession::open_serial("/dev/ttyUSB0")?;
//! session.set_data_listener(|samples, number| println!("#{number}: {samples:?}"));
//! session
//!     .start_recording(&DeviceConfig::new(DeviceType::EightChannel))?
//!     .wait()?;
//! std::thread::sleep(std::time::Duration::from_secs(10));
//! session.disconnect()?;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::command::{encode_config, HARDWARE_REQUEST, HELLO_REQUEST, PING_COMMAND, STOP_REQUEST};
use crate::config::{AtomicDeviceState, DeviceConfig, DeviceState, DeviceType};
use crate::decoder::{DataRecord, DeviceMessage, FrameDecoder, FrameEvent, MessageKind};
use crate::errors::{DriverError, Result};
use crate::indicators;
use crate::transport::{SerialTransport, Transport};
use crate::worker::{lock, CancelToken, Worker};

/// Timing of the background activities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// Period of hello requests while monitoring or waiting for the device.
    pub hello_period: Duration,
    /// How often waits recheck their condition, deadline and cancellation.
    pub poll_interval: Duration,
    /// The device counts as active if it sent anything within this window.
    pub liveness_window: Duration,
    /// Overall deadline of the starting sequence.
    pub start_timeout: Duration,
    /// Pause after a hardware request or a stop during the starting sequence.
    pub settle_interval: Duration,
    /// Period of keep-alive pings while recording.
    pub keep_alive_period: Duration,
    /// How long `stop()` blocks for the device to acknowledge.
    pub stop_wait: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            hello_period: Duration::from_secs(1),
            poll_interval: Duration::from_millis(100),
            liveness_window: Duration::from_secs(2),
            start_timeout: Duration::from_secs(30),
            settle_interval: Duration::from_secs(1),
            keep_alive_period: Duration::from_secs(1),
            stop_wait: Duration::from_secs(1),
        }
    }
}

type DataFn = dyn Fn(&[i32], i64) + Send + Sync;
type MessageFn = dyn Fn(MessageKind, &str) + Send + Sync;
type BatteryFn = dyn Fn(u8) + Send + Sync;
type LeadOffFn = dyn Fn(&[Option<bool>]) + Send + Sync;

/// Holds at most one listener; setting a new one replaces the old.
struct Listener<T: ?Sized>(Mutex<Option<Arc<T>>>);

impl<T: ?Sized> Default for Listener<T> {
    fn default() -> Self {
        Self(Mutex::new(None))
    }
}

impl<T: ?Sized> Listener<T> {
    fn set(&self, listener: Arc<T>) {
        *lock(&self.0) = Some(listener);
    }

    // cloned out so the listener runs without the slot locked
    fn get(&self) -> Option<Arc<T>> {
        lock(&self.0).clone()
    }

    fn clear(&self) {
        lock(&self.0).take();
    }
}

const NO_EVENT_YET: u64 = u64::MAX;
const DEVICE_TYPE_UNKNOWN: u8 = 0;

/// Metrics computed from one record under the decoder's config.
#[derive(Default)]
struct RecordIndicators {
    battery: Option<u8>,
    lead_off: Option<Vec<Option<bool>>>,
}

impl RecordIndicators {
    fn compute(record: &DataRecord, config: &DeviceConfig) -> Self {
        let mut out = Self::default();
        if config.battery_voltage_enabled {
            match indicators::extract_battery_percentage(&record.samples, config) {
                Ok(percentage) => out.battery = Some(percentage),
                Err(e) => debug!("record {}: no battery level: {}", record.number, e),
            }
        }
        if config.is_lead_off_enabled() {
            match indicators::extract_lead_off_mask(&record.samples, config) {
                Ok(mask) => out.lead_off = Some(mask),
                Err(e) => debug!("record {}: no lead-off mask: {}", record.number, e),
            }
        }
        out
    }
}

/// State shared between the caller, the worker and the transport reader.
struct SessionShared {
    epoch: Instant,
    state: AtomicDeviceState,
    device_type: AtomicU8,
    /// Milliseconds since `epoch` of the last received event.
    last_event_ms: AtomicU64,
    data_received: AtomicBool,
    decoder: Mutex<FrameDecoder>,
    data_listener: Listener<DataFn>,
    message_listener: Listener<MessageFn>,
    battery_listener: Listener<BatteryFn>,
    lead_off_listener: Listener<LeadOffFn>,
}

impl SessionShared {
    fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: AtomicDeviceState::new(DeviceState::Undefined),
            device_type: AtomicU8::new(DEVICE_TYPE_UNKNOWN),
            last_event_ms: AtomicU64::new(NO_EVENT_YET),
            data_received: AtomicBool::new(false),
            decoder: Mutex::new(FrameDecoder::for_messages()),
            data_listener: Listener::default(),
            message_listener: Listener::default(),
            battery_listener: Listener::default(),
            lead_off_listener: Listener::default(),
        }
    }

    fn device_type(&self) -> Option<DeviceType> {
        DeviceType::from_hardware_code(self.device_type.load(Ordering::SeqCst))
    }

    fn is_active(&self, window: Duration) -> bool {
        let last = self.last_event_ms.load(Ordering::SeqCst);
        if last == NO_EVENT_YET {
            return false;
        }
        let now = self.epoch.elapsed().as_millis() as u64;
        now.saturating_sub(last) <= window.as_millis() as u64
    }

    fn install_decoder(&self, decoder: FrameDecoder) {
        *lock(&self.decoder) = decoder;
    }

    fn clear_listeners(&self) {
        self.data_listener.clear();
        self.message_listener.clear();
        self.battery_listener.clear();
        self.lead_off_listener.clear();
    }

    /// Transport callback.
    fn on_byte(&self, byte: u8) {
        let (event, indicators) = {
            let mut decoder = lock(&self.decoder);
            let Some(event) = decoder.push_byte(byte) else {
                return;
            };
            let indicators = match (&event, decoder.config()) {
                (FrameEvent::Record(record), Some(config)) => {
                    RecordIndicators::compute(record, config)
                }
                _ => RecordIndicators::default(),
            };
            (event, indicators)
        };

        self.last_event_ms
            .store(self.epoch.elapsed().as_millis() as u64, Ordering::SeqCst);
        match event {
            FrameEvent::Record(record) => self.on_record(&record, indicators),
            FrameEvent::Message(message) => self.on_message(&message),
        }
    }

    fn on_record(&self, record: &DataRecord, indicators: RecordIndicators) {
        if !self.data_received.swap(true, Ordering::SeqCst) {
            debug!("first data record: number={}", record.number);
        }
        if let Some(listener) = self.data_listener.get() {
            listener(&record.samples, record.number);
        }
        if let (Some(percentage), Some(listener)) = (indicators.battery, self.battery_listener.get()) {
            listener(percentage);
        }
        if let (Some(mask), Some(listener)) = (indicators.lead_off, self.lead_off_listener.get()) {
            listener(&mask);
        }
    }

    fn on_message(&self, message: &DeviceMessage) {
        match message.kind {
            MessageKind::HardwareType(device_type) => {
                let previous = self
                    .device_type
                    .swap(device_type.hardware_code(), Ordering::SeqCst);
                if previous != device_type.hardware_code() {
                    info!("device reports hardware type {}", device_type);
                }
            }
            MessageKind::StopRecording => {
                if self
                    .state
                    .compare_exchange(DeviceState::Undefined, DeviceState::Stopped)
                    .is_ok()
                {
                    debug!("device acknowledged stop");
                }
            }
            MessageKind::LowBattery => warn!("device reports low battery"),
            MessageKind::TxFail => warn!("device reports transmit failure"),
            MessageKind::FrameBroken => debug!("broken frame: {}", message.detail),
            MessageKind::Hello | MessageKind::Firmware | MessageKind::Unknown => {}
        }
        if let Some(listener) = self.message_listener.get() {
            listener(message.kind, &message.detail);
        }
    }
}

/// Terminal outcome of a [`DeviceSession::start_recording`] call.
pub struct StartHandle {
    outcome: Receiver<Result<()>>,
}

impl StartHandle {
    fn aborted() -> DriverError {
        DriverError::Cancelled("starting sequence was aborted".into())
    }

    /// Block until the starting sequence has finished.
    pub fn wait(self) -> Result<()> {
        self.outcome.recv().unwrap_or_else(|_| Err(Self::aborted()))
    }

    /// Block for at most `timeout`. `None` if the sequence is still running.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        match self.outcome.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Self::aborted())),
        }
    }

    /// Non-blocking poll. The outcome is returned once.
    pub fn try_result(&self) -> Option<Result<()>> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Self::aborted())),
        }
    }
}

/// One connected device.
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    shared: Arc<SessionShared>,
    worker: Worker,
    timing: SessionTiming,
    disconnected: AtomicBool,
}

impl DeviceSession {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::with_timing(transport, SessionTiming::default())
    }

    pub fn with_timing(transport: Arc<dyn Transport>, timing: SessionTiming) -> Self {
        let shared = Arc::new(SessionShared::new());
        let reader_shared = shared.clone();
        transport.set_byte_handler(Arc::new(move |byte| reader_shared.on_byte(byte)));
        Self {
            transport,
            shared,
            worker: Worker::new("session"),
            timing,
            disconnected: AtomicBool::new(false),
        }
    }

    /// Open a serial port at the device's speed and wrap it in a session.
    pub fn open_serial(path: &str) -> Result<Self> {
        let transport = SerialTransport::open(path)?;
        Ok(Self::new(Arc::new(transport)))
    }

    pub fn state(&self) -> DeviceState {
        self.shared.state.load()
    }

    /// Hardware type last reported by the device.
    pub fn device_type(&self) -> Option<DeviceType> {
        self.shared.device_type()
    }

    /// Whether the device sent anything within the liveness window.
    pub fn is_active(&self) -> bool {
        self.shared.is_active(self.timing.liveness_window)
    }

    pub fn timing(&self) -> &SessionTiming {
        &self.timing
    }

    /// Receives (samples, record number) for every decoded data frame.
    pub fn set_data_listener<F>(&self, listener: F)
    where
        F: Fn(&[i32], i64) + Send + Sync + 'static,
    {
        self.shared.data_listener.set(Arc::new(listener));
    }

    /// Receives every message frame and every decode error.
    pub fn set_message_listener<F>(&self, listener: F)
    where
        F: Fn(MessageKind, &str) + Send + Sync + 'static,
    {
        self.shared.message_listener.set(Arc::new(listener));
    }

    /// Receives the battery percentage of every record, if measured.
    pub fn set_battery_listener<F>(&self, listener: F)
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        self.shared.battery_listener.set(Arc::new(listener));
    }

    /// Receives the lead-off mask of every record, if reported.
    pub fn set_lead_off_listener<F>(&self, listener: F)
    where
        F: Fn(&[Option<bool>]) + Send + Sync + 'static,
    {
        self.shared.lead_off_listener.set(Arc::new(listener));
    }

    pub fn clear_listeners(&self) {
        self.shared.clear_listeners();
    }

    fn check_open(&self) -> Result<()> {
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(DriverError::InvalidState("session is disconnected".into()));
        }
        if !self.transport.is_open() {
            return Err(DriverError::InvalidState("transport is closed".into()));
        }
        Ok(())
    }

    fn check_not_recording(&self) -> Result<()> {
        if self.shared.state.load() == DeviceState::Recording {
            return Err(DriverError::InvalidState("device is already recording".into()));
        }
        Ok(())
    }

    /// Probe the device periodically while idle.
    ///
    /// Keeps an idle connection alive and learns the hardware type and liveness
    /// of the device. Runs until recording starts or the session stops.
    pub fn start_monitoring(&self) -> Result<()> {
        self.check_open()?;
        self.check_not_recording()?;

        let transport = self.transport.clone();
        let shared = self.shared.clone();
        let period = self.timing.hello_period;
        self.worker.spawn("monitor", move |token| {
            info!("monitoring started");
            loop {
                send_best_effort(transport.as_ref(), HELLO_REQUEST);
                if shared.device_type().is_none() {
                    send_best_effort(transport.as_ref(), HARDWARE_REQUEST);
                }
                if !token.sleep(period) {
                    break;
                }
            }
            debug!("monitoring stopped");
        })
    }

    /// Configure the device and start streaming.
    ///
    /// Returns once the starting sequence has been scheduled; its outcome is
    /// reported through the returned [`StartHandle`]. On failure the state is
    /// rolled back to [`DeviceState::Undefined`] and a stop command is sent.
    pub fn start_recording(&self, config: &DeviceConfig) -> Result<StartHandle> {
        self.check_open()?;
        self.check_not_recording()?;
        let config = config.normalized();
        config.validate()?;
        if config.is_all_channels_disabled() && !config.accelerometer_enabled {
            return Err(DriverError::InvalidArgument(
                "all channels and the accelerometer are disabled".into(),
            ));
        }

        self.worker.cancel();
        let previous_state = loop {
            let current = self.shared.state.load();
            if current == DeviceState::Recording {
                return Err(DriverError::InvalidState("device is already recording".into()));
            }
            if let Ok(previous) = self
                .shared
                .state
                .compare_exchange(current, DeviceState::Recording)
            {
                break previous;
            }
        };
        info!(
            "starting recording: device={}, rate={} Hz, previous state={:?}",
            config.device_type(),
            config.sample_rate.hz(),
            previous_state
        );

        self.shared
            .install_decoder(FrameDecoder::with_config(config.clone()));
        let (tx, rx) = mpsc::sync_channel(1);
        let starter = Starter {
            transport: self.transport.clone(),
            shared: self.shared.clone(),
            timing: self.timing.clone(),
            config,
            previous_state,
        };
        let spawned = self.worker.spawn("starter", move |token| {
            let outcome = starter.run(&token);
            let started = outcome.is_ok();
            match &outcome {
                Ok(()) => info!("recording started"),
                Err(DriverError::Cancelled(_)) => debug!("starting sequence cancelled"),
                Err(e) => {
                    warn!("starting sequence failed: {}", e);
                    starter.roll_back();
                }
            }
            let _ = tx.send(outcome);
            if started {
                starter.keep_alive(&token);
            }
        });
        if let Err(e) = spawned {
            self.shared
                .state
                .compare_exchange(DeviceState::Recording, DeviceState::Undefined)
                .ok();
            self.shared.install_decoder(FrameDecoder::for_messages());
            return Err(e);
        }
        Ok(StartHandle { outcome: rx })
    }

    /// Stop recording and any background activity.
    ///
    /// Blocks for the configured stop wait so the device can acknowledge.
    pub fn stop(&self) -> Result<()> {
        self.check_open()?;
        self.stop_device()
    }

    fn stop_device(&self) -> Result<()> {
        self.worker.cancel();
        if self
            .shared
            .state
            .compare_exchange(DeviceState::Recording, DeviceState::Undefined)
            .is_ok()
        {
            info!("recording stopped");
        }
        let sent = self.transport.write_byte(STOP_REQUEST);
        thread::sleep(self.timing.stop_wait);
        self.shared.install_decoder(FrameDecoder::for_messages());
        sent
    }

    /// Stop if recording, close the transport and drop all listeners.
    ///
    /// Calling it again is a no-op.
    pub fn disconnect(&self) -> Result<()> {
        if self.disconnected.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.shared.state.load() == DeviceState::Recording && self.transport.is_open() {
            if let Err(e) = self.stop_device() {
                warn!("stop before disconnect failed: {}", e);
            }
        }
        self.worker.cancel();
        if self
            .shared
            .state
            .compare_exchange(DeviceState::Recording, DeviceState::Undefined)
            .is_ok()
        {
            info!("recording abandoned: transport already closed");
        }
        self.shared.clear_listeners();
        self.transport.set_byte_handler(Arc::new(|_: u8| {}));
        let closed = if self.transport.is_open() {
            self.transport.close()
        } else {
            Ok(())
        };
        info!("session disconnected");
        closed
    }

    /// See [`indicators::extract_lead_off_mask`].
    pub fn extract_lead_off_mask(
        record: &[i32],
        config: &DeviceConfig,
    ) -> Result<Vec<Option<bool>>> {
        indicators::extract_lead_off_mask(record, config)
    }

    /// See [`indicators::extract_battery_percentage`].
    pub fn extract_battery_percentage(record: &[i32], config: &DeviceConfig) -> Result<u8> {
        indicators::extract_battery_percentage(record, config)
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            warn!("disconnect on drop failed: {}", e);
        }
    }
}

fn send_best_effort(transport: &dyn Transport, byte: u8) {
    if let Err(e) = transport.write_byte(byte) {
        debug!("write of 0x{:02X} failed: {}", byte, e);
    }
}

/// The starting sequence and the keep-alive that follows it.
struct Starter {
    transport: Arc<dyn Transport>,
    shared: Arc<SessionShared>,
    timing: SessionTiming,
    config: DeviceConfig,
    previous_state: DeviceState,
}

impl Starter {
    fn run(&self, token: &CancelToken) -> Result<()> {
        let deadline = Instant::now() + self.timing.start_timeout;
        self.wait_until_active(token, deadline)?;

        if self.shared.device_type().is_none() {
            send_best_effort(self.transport.as_ref(), HARDWARE_REQUEST);
            self.pause(token, self.timing.settle_interval)?;
        }
        let expected = self.config.device_type();
        match self.shared.device_type() {
            Some(found) if found != expected => {
                return Err(DriverError::WrongDevice {
                    expected: expected.to_string(),
                    found: found.to_string(),
                })
            }
            Some(_) => {}
            None => warn!("device did not report its hardware type, assuming {}", expected),
        }

        if self.previous_state == DeviceState::Undefined {
            send_best_effort(self.transport.as_ref(), STOP_REQUEST);
            self.pause(token, self.timing.settle_interval)?;
        }

        self.shared.data_received.store(false, Ordering::SeqCst);
        let command = encode_config(&self.config);
        debug!("writing config command: {} bytes", command.len());
        self.transport.write_bytes(&command)?;
        self.wait_for_data(token, deadline)
    }

    fn pause(&self, token: &CancelToken, duration: Duration) -> Result<()> {
        if token.sleep(duration) {
            Ok(())
        } else {
            Err(DriverError::Cancelled("starting sequence cancelled".into()))
        }
    }

    fn wait_until_active(&self, token: &CancelToken, deadline: Instant) -> Result<()> {
        let mut next_hello = Instant::now();
        loop {
            if self.shared.is_active(self.timing.liveness_window) {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(DriverError::Timeout(format!(
                    "device did not answer within {:?}",
                    self.timing.start_timeout
                )));
            }
            if now >= next_hello {
                send_best_effort(self.transport.as_ref(), HELLO_REQUEST);
                next_hello = now + self.timing.hello_period;
            }
            self.pause(token, self.timing.poll_interval)?;
        }
    }

    fn wait_for_data(&self, token: &CancelToken, deadline: Instant) -> Result<()> {
        while !self.shared.data_received.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout(format!(
                    "no data within {:?} of the start request",
                    self.timing.start_timeout
                )));
            }
            self.pause(token, self.timing.poll_interval)?;
        }
        Ok(())
    }

    fn roll_back(&self) {
        self.shared
            .state
            .compare_exchange(DeviceState::Recording, DeviceState::Undefined)
            .ok();
        send_best_effort(self.transport.as_ref(), STOP_REQUEST);
        self.shared.install_decoder(FrameDecoder::for_messages());
    }

    /// Ping until cancelled or the link fails. A failed link ends the recording.
    fn keep_alive(&self, token: &CancelToken) {
        while token.sleep(self.timing.keep_alive_period) {
            let sent = if self.transport.is_open() {
                self.transport.write_byte(PING_COMMAND)
            } else {
                Err(DriverError::Transport("transport is closed".into()))
            };
            if let Err(e) = sent {
                warn!("keep-alive failed, recording lost: {}", e);
                self.shared
                    .state
                    .compare_exchange(DeviceState::Recording, DeviceState::Undefined)
                    .ok();
                self.shared.install_decoder(FrameDecoder::for_messages());
                break;
            }
        }
        debug!("keep-alive stopped");
    }
}
