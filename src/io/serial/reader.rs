// src/io/serial/reader.rs
//
// Blocking read/transmit loop for an open controller link, plus device
// enumeration for the port picker.

use serde::Serialize;
use std::io::{Read, Write};
use std::sync::mpsc as std_mpsc;
use tokio::task::JoinHandle;

use super::link::{InboundPump, TransmitRequest};
use super::transport::BoxedPort;
use crate::error::{Result, SerialError};

const READ_CHUNK: usize = 256;

// ============================================================================
// Read Loop
// ============================================================================

/// Run the read loop for `port` on the blocking pool.
/// The loop exits once the link is closed or the device goes away; the port
/// is dropped, and therefore closed, when it does.
pub(crate) fn spawn_link_reader(
    port: BoxedPort,
    pump: InboundPump,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    port_name: String,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || run_link_blocking(port, pump, transmit_rx, &port_name))
}

fn run_link_blocking(
    mut port: BoxedPort,
    mut pump: InboundPump,
    transmit_rx: std_mpsc::Receiver<TransmitRequest>,
    port_name: &str,
) {
    let mut buf = [0u8; READ_CHUNK];
    let reason;

    'outer: loop {
        // Pending writes go out one at a time, before the next read
        while let Ok(req) = transmit_rx.try_recv() {
            let result = port.write_all(&req.data).and_then(|_| port.flush());
            let failure = result.as_ref().err().map(|e| format!("write error: {}", e));
            let _ = req.result_tx.send(result);
            if let Some(failure) = failure {
                pump.fail(&failure);
                reason = failure;
                break 'outer;
            }
        }

        if pump.is_closed() {
            reason = "stopped".to_string();
            break;
        }

        match port.read(&mut buf) {
            Ok(n) if n > 0 => {
                if !pump.on_data(&buf[..n]) {
                    reason = "stopped".to_string();
                    break;
                }
            }
            Ok(_) => {
                // EOF - device unplugged or reset
                pump.fail("device disconnected");
                reason = "disconnected".to_string();
                break;
            }
            Err(ref e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::Interrupted
                ) =>
            {
                // Timeout is expected for serial reads
            }
            Err(e) => {
                let failure = format!("read error: {}", e);
                pump.fail(&failure);
                reason = failure;
                break;
            }
        }
    }

    tlog!("[serial] Read loop for {} ended: {}", port_name, reason);
}

// ============================================================================
// Device Enumeration
// ============================================================================

/// Information about an available serial port
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SerialPortInfo {
    pub port_name: String,
    pub port_type: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

const CONTROLLER_VENDOR_IDS: [u16; 12] = [
    0x10c4, // Silicon Labs CP210x
    0x1a86, // QinHeng CH340/CH341
    0x0403, // FTDI
    0x2341, // Arduino
    0x1b4f, // SparkFun
    0x303a, // Espressif native USB
    0x067b, // Prolific
    0x1cf1, // Dresden Elektronik
    0x0483, // STMicroelectronics
    0x239a, // Adafruit
    0x16c0, // Teensy
    0x04d8, // Microchip
];

const CONTROLLER_PRODUCT_IDS: [u16; 7] = [0xea60, 0x6001, 0x7523, 0x1001, 0x0001, 0x8036, 0x2303];

const CONTROLLER_MANUFACTURERS: [&str; 10] = [
    "silicon labs",
    "qinheng",
    "ftdi",
    "arduino",
    "espressif",
    "prolific",
    "cp210x",
    "ch340",
    "ch341",
    "microsoft",
];

const CONTROLLER_PRODUCT_KEYWORDS: [&str; 11] = [
    "esp32",
    "arduino",
    "usb serial",
    "usb-serial",
    "serial device",
    "cp210",
    "ch340",
    "ch341",
    "ftdi",
    "prolific",
    "comm port",
];

impl From<serialport::SerialPortInfo> for SerialPortInfo {
    fn from(port: serialport::SerialPortInfo) -> Self {
        let mut info = SerialPortInfo {
            port_name: port.port_name,
            port_type: String::new(),
            manufacturer: None,
            product: None,
            serial_number: None,
            vid: None,
            pid: None,
        };
        let kind = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => {
                info.manufacturer = usb.manufacturer;
                info.product = usb.product;
                info.serial_number = usb.serial_number;
                info.vid = Some(usb.vid);
                info.pid = Some(usb.pid);
                "USB"
            }
            serialport::SerialPortType::BluetoothPort => "Bluetooth",
            serialport::SerialPortType::PciPort => "PCI",
            serialport::SerialPortType::Unknown => "Unknown",
        };
        info.port_type = kind.to_string();
        info
    }
}

/// Every serial port the OS reports
pub fn list_serial_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = serialport::available_ports().map_err(|e| SerialError::Enumerate(e.to_string()))?;
    Ok(ports
        .into_iter()
        .map(SerialPortInfo::from)
        .filter(is_visible_port)
        .collect())
}

/// Ports that look like an embedded controller's USB adapter
pub fn list_controller_ports() -> Result<Vec<SerialPortInfo>> {
    let ports = list_serial_ports()?;
    let total = ports.len();
    let controllers: Vec<SerialPortInfo> = ports.into_iter().filter(is_controller_port).collect();
    tlog!(
        "[serial] Found {} controller port(s) out of {}",
        controllers.len(),
        total
    );
    Ok(controllers)
}

/// On macOS only the calling-unit (/dev/cu.*) side of each device is listed
fn is_visible_port(port: &SerialPortInfo) -> bool {
    #[cfg(target_os = "macos")]
    {
        !port.port_name.starts_with("/dev/tty.")
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = port;
        true
    }
}

pub fn is_controller_port(port: &SerialPortInfo) -> bool {
    if port.vid.is_some_and(|vid| CONTROLLER_VENDOR_IDS.contains(&vid)) {
        return true;
    }
    if port.pid.is_some_and(|pid| CONTROLLER_PRODUCT_IDS.contains(&pid)) {
        return true;
    }

    let manufacturer = port.manufacturer.as_deref().unwrap_or_default().to_lowercase();
    if CONTROLLER_MANUFACTURERS.iter().any(|m| manufacturer.contains(m)) {
        return true;
    }

    let product = port.product.as_deref().unwrap_or_default().to_lowercase();
    if CONTROLLER_PRODUCT_KEYWORDS.iter().any(|k| product.contains(k)) {
        return true;
    }

    is_windows_com_port(&port.port_name)
}

fn is_windows_com_port(name: &str) -> bool {
    name.len() > 3
        && name[..3].eq_ignore_ascii_case("com")
        && name[3..].chars().all(|c| c.is_ascii_digit())
}
