// src/io/serial/transport.rs
//
// Transport seam used by the negotiator, and the serialport-backed implementation.

use async_trait::async_trait;
use std::io::{Read, Write};
use std::time::Duration;

use super::utils::{
    to_serialport_data_bits, to_serialport_flow_control, to_serialport_parity,
    to_serialport_stop_bits, LineSettings,
};
use crate::error::{Result, SerialError};

/// Read timeout on open handles. Short so the read loop can service writes and close requests.
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Anything the read loop can drive: a byte stream in both directions.
pub trait PortIo: Read + Write + Send {}

impl<T: Read + Write + Send + ?Sized> PortIo for T {}

/// An open device handle. Dropping it closes the device.
pub type BoxedPort = Box<dyn PortIo>;

/// Opens a device at a given speed.
#[async_trait]
pub trait SerialTransport: Send + Sync {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedPort>;
}

/// Opens real serial devices through the serialport crate
#[derive(Debug, Clone)]
pub struct SerialportTransport {
    line: LineSettings,
    read_timeout: Duration,
}

impl Default for SerialportTransport {
    fn default() -> Self {
        SerialportTransport {
            line: LineSettings::default(),
            read_timeout: READ_TIMEOUT,
        }
    }
}

impl SerialportTransport {
    pub fn new(line: LineSettings, read_timeout: Duration) -> Self {
        SerialportTransport { line, read_timeout }
    }
}

#[async_trait]
impl SerialTransport for SerialportTransport {
    async fn open(&self, path: &str, baud_rate: u32) -> Result<BoxedPort> {
        let line = self.line;
        let read_timeout = self.read_timeout;
        let port_path = path.to_string();

        // The blocking open cannot be interrupted. A caller that stops waiting
        // should keep polling the open for a while so the late handle is closed.
        let opened = tokio::task::spawn_blocking(move || {
            serialport::new(&port_path, baud_rate)
                .data_bits(to_serialport_data_bits(line.data_bits))
                .stop_bits(to_serialport_stop_bits(line.stop_bits))
                .parity(to_serialport_parity(&line.parity))
                .flow_control(to_serialport_flow_control(line.flow_control))
                .timeout(read_timeout)
                .open()
        })
        .await
        .map_err(|e| SerialError::Open {
            path: path.to_string(),
            baud_rate,
            message: format!("open task failed: {}", e),
        })?;

        match opened {
            Ok(port) => {
                tlog!(
                    "[serial] Opened {} at {} baud ({})",
                    path,
                    baud_rate,
                    line.describe()
                );
                let port: BoxedPort = Box::new(port);
                Ok(port)
            }
            Err(e) => Err(SerialError::Open {
                path: path.to_string(),
                baud_rate,
                message: e.to_string(),
            }),
        }
    }
}
