//! Serial Port Adapter (spec §4.1).
//!
//! Opens/closes/configures a named port, toggles RTS/DTR for hardware
//! reset, and moves bytes in and out. The teacher talks to `Box<dyn
//! serialport::SerialPort>` directly inside `stm32_uart.rs`; here the same
//! handful of calls are behind a small trait so the Board Session and Line
//! Inspector can be exercised in tests against an in-memory fake instead of
//! real hardware.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::error::{Result, SessionError};

/// Everything the Board Session needs from a physical or simulated serial
/// link. Implemented for the real `serialport` crate's port type, and for
/// [`MockTransport`] in tests.
pub trait SerialTransport: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;
    fn set_bitrate(&mut self, bps: u32) -> io::Result<()>;
    fn set_rts(&mut self, level: bool) -> io::Result<()>;
    fn set_dtr(&mut self, level: bool) -> io::Result<()>;
    /// Liveness probe: bytes currently buffered for read, or an error if
    /// the underlying device has gone away (unplugged).
    fn input_waiting(&self) -> io::Result<u32>;
    fn try_clone_box(&self) -> io::Result<Box<dyn SerialTransport>>;
}

/// Adapter over the real `serialport` crate.
pub struct NativeTransport {
    port: Box<dyn SerialPort>,
}

impl NativeTransport {
    /// Opens `name` at `baud` 8-N-1, no flow control, with DTR and RTS
    /// both deasserted — matching the original agent's `attach`, which
    /// opens with `DTR = DTR_OFF, RTS = RTS_OFF`.
    pub fn open(name: &str, baud: u32, read_timeout: Duration) -> Result<Self> {
        let mut port = serialport::new(name, baud)
            .timeout(read_timeout)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .open()
            .map_err(SessionError::PortIo)?;

        port.write_data_terminal_ready(false)?;
        port.write_request_to_send(false)?;

        Ok(Self { port })
    }
}

impl SerialTransport for NativeTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }

    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()
    }

    fn set_bitrate(&mut self, bps: u32) -> io::Result<()> {
        self.port
            .set_baud_rate(bps)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }

    fn set_rts(&mut self, level: bool) -> io::Result<()> {
        self.port.write_request_to_send(level)
    }

    fn set_dtr(&mut self, level: bool) -> io::Result<()> {
        self.port.write_data_terminal_ready(level)
    }

    fn input_waiting(&self) -> io::Result<u32> {
        self.port.bytes_to_read()
    }

    fn try_clone_box(&self) -> io::Result<Box<dyn SerialTransport>> {
        let cloned = self
            .port
            .try_clone()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(Box::new(NativeTransport { port: cloned }))
    }
}

/// Discovered port, ephemeral, owned by its discoverer until attach
/// succeeds (spec §3 "Port info").
#[derive(Debug, Clone)]
pub struct PortInfo {
    pub device_name: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Enumerates all serial ports currently visible to the OS, regardless of
/// whether they carry USB VID/PID information.
pub fn enumerate_ports() -> Result<Vec<PortInfo>> {
    let ports = serialport::available_ports().map_err(SessionError::PortIo)?;
    let mut out = Vec::with_capacity(ports.len());
    for p in ports {
        if let serialport::SerialPortType::UsbPort(usb) = p.port_type {
            out.push(PortInfo {
                device_name: p.port_name,
                vendor_id: usb.vid,
                product_id: usb.pid,
            });
        }
    }
    Ok(out)
}

/// In-memory fake used by unit tests: a pair of byte queues standing in for
/// the board side of the wire. Tests drive `board_write`/`board_read` to
/// play the part of the attached board while the code under test talks to
/// this transport exactly as it would to real hardware.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    pub struct MockTransport {
        /// Bytes the host has written to the "board".
        pub to_board: Arc<Mutex<VecDeque<u8>>>,
        /// Bytes the "board" has queued for the host to read.
        pub to_host: Arc<Mutex<VecDeque<u8>>>,
        pub rts: Arc<Mutex<bool>>,
        pub dtr: Arc<Mutex<bool>>,
        pub bitrate: Arc<Mutex<u32>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue bytes as if the board had sent them.
        pub fn push_from_board(&self, bytes: &[u8]) {
            self.to_host.lock().unwrap().extend(bytes.iter().copied());
        }

        /// Pop everything the host has written so far.
        pub fn drain_to_board(&self) -> Vec<u8> {
            self.to_board.lock().unwrap().drain(..).collect()
        }
    }

    impl SerialTransport for MockTransport {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut q = self.to_host.lock().unwrap();
            if q.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
            }
            let n = buf.len().min(q.len());
            for slot in buf.iter_mut().take(n) {
                *slot = q.pop_front().unwrap();
            }
            Ok(n)
        }

        fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
            self.to_board.lock().unwrap().extend(buf.iter().copied());
            Ok(())
        }

        fn set_bitrate(&mut self, bps: u32) -> io::Result<()> {
            *self.bitrate.lock().unwrap() = bps;
            Ok(())
        }

        fn set_rts(&mut self, level: bool) -> io::Result<()> {
            *self.rts.lock().unwrap() = level;
            Ok(())
        }

        fn set_dtr(&mut self, level: bool) -> io::Result<()> {
            *self.dtr.lock().unwrap() = level;
            Ok(())
        }

        fn input_waiting(&self) -> io::Result<u32> {
            Ok(self.to_host.lock().unwrap().len() as u32)
        }

        fn try_clone_box(&self) -> io::Result<Box<dyn SerialTransport>> {
            Ok(Box::new(self.clone()))
        }
    }
}
