//! Byte transport between the host and the device.
//!
//! The protocol layer only needs to write bytes and to be called back once per
//! received byte. [`SerialTransport`] provides that over a serial port (USB cable
//! or a bound Bluetooth SPP device such as `/dev/rfcomm0`), with a reader thread
//! pumping received bytes into the registered handler.

use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::SerialPort;

use crate::errors::{DriverError, Result};
use crate::worker::lock;

/// Serial speed of the device.
pub const BAUD_RATE: u32 = 460_800;

/// Read timeout of the reader thread; bounds how long `close()` waits for it.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

const READ_BUFFER_SIZE: usize = 256;

/// Called once per received byte, from the transport's reader thread.
pub type ByteHandler = Arc<dyn Fn(u8) + Send + Sync>;

pub trait Transport: Send + Sync {
    fn is_open(&self) -> bool;

    fn write_bytes(&self, bytes: &[u8]) -> Result<()>;

    fn write_byte(&self, byte: u8) -> Result<()> {
        self.write_bytes(&[byte])
    }

    fn close(&self) -> Result<()>;

    /// Register the receive callback, replacing any previous one.
    fn set_byte_handler(&self, handler: ByteHandler);
}

/// [`Transport`] over a serial port.
pub struct SerialTransport {
    port_name: String,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    handler: Arc<Mutex<Option<ByteHandler>>>,
    open: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl SerialTransport {
    /// Open `path` at the device's default speed.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_baud(path, BAUD_RATE)
    }

    pub fn open_with_baud(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(READ_TIMEOUT)
            .open()?;
        let reader_port = port.try_clone()?;

        let handler: Arc<Mutex<Option<ByteHandler>>> = Arc::new(Mutex::new(None));
        let open = Arc::new(AtomicBool::new(true));
        let reader = thread::Builder::new()
            .name(format!("serial-reader-{path}"))
            .spawn({
                let handler = handler.clone();
                let open = open.clone();
                let path = path.to_string();
                move || read_loop(&path, reader_port, &handler, &open)
            })?;

        info!("serial port opened: path={}, baud={}", path, baud_rate);
        Ok(Self {
            port_name: path.to_string(),
            writer: Mutex::new(Some(port)),
            handler,
            open,
            reader: Mutex::new(Some(reader)),
        })
    }
}

fn read_loop(
    path: &str,
    mut port: Box<dyn SerialPort>,
    handler: &Mutex<Option<ByteHandler>>,
    open: &AtomicBool,
) {
    let mut buf = [0u8; READ_BUFFER_SIZE];
    while open.load(Ordering::SeqCst) {
        match port.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => dispatch(handler, &buf[..n]),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("serial read failed, closing: path={}, error={}", path, e);
                open.store(false, Ordering::SeqCst);
                break;
            }
        }
    }
    debug!("serial reader exited: path={}", path);
}

/// Hand `bytes` to the registered handler. The slot is unlocked while the handler
/// runs, so it may replace itself or close the transport.
fn dispatch(handler: &Mutex<Option<ByteHandler>>, bytes: &[u8]) {
    let Some(handler) = lock(handler).clone() else {
        return;
    };
    for &byte in bytes {
        handler(byte);
    }
}

impl Transport for SerialTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(DriverError::Transport(format!(
                "{} is closed",
                self.port_name
            )));
        }
        let mut writer = lock(&self.writer);
        let port = writer
            .as_mut()
            .ok_or_else(|| DriverError::Transport(format!("{} is closed", self.port_name)))?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        lock(&self.writer).take();
        if let Some(reader) = lock(&self.reader).take() {
            // closed from a callback: the reader exits on its own once it returns
            if reader.thread().id() == thread::current().id() {
                info!("serial port closed from its reader: path={}", self.port_name);
                return Ok(());
            }
            if reader.join().is_err() {
                return Err(DriverError::Transport(format!(
                    "reader thread of {} panicked",
                    self.port_name
                )));
            }
        }
        info!("serial port closed: path={}", self.port_name);
        Ok(())
    }

    fn set_byte_handler(&self, handler: ByteHandler) {
        *lock(&self.handler) = Some(handler);
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        if self.is_open() {
            let _ = self.close();
        }
    }
}
