// src/io/serial/utils.rs
//
// Line settings for controller links and their conversion to serialport types.

use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity as SpParity, StopBits};

// ============================================================================
// Types
// ============================================================================

/// Parity setting for serial port configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// Framing parameters applied to every open. Controllers expect 8-N-1, no flow control.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineSettings {
    pub data_bits: u8,
    pub stop_bits: u8,
    pub parity: Parity,
    pub flow_control: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        LineSettings {
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: false,
        }
    }
}

impl LineSettings {
    /// Short form used in logs, e.g. `8-N-1`
    pub fn describe(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
        };
        format!("{}-{}-{}", self.data_bits, parity, self.stop_bits)
    }
}

// ============================================================================
// Conversion Functions
// ============================================================================

/// Convert our Parity enum to serialport crate's Parity type
pub fn to_serialport_parity(p: &Parity) -> SpParity {
    match p {
        Parity::None => SpParity::None,
        Parity::Odd => SpParity::Odd,
        Parity::Even => SpParity::Even,
    }
}

/// Convert data bits count to serialport crate's DataBits type
pub fn to_serialport_data_bits(bits: u8) -> DataBits {
    match bits {
        5 => DataBits::Five,
        6 => DataBits::Six,
        7 => DataBits::Seven,
        _ => DataBits::Eight,
    }
}

/// Convert stop bits count to serialport crate's StopBits type
pub fn to_serialport_stop_bits(bits: u8) -> StopBits {
    match bits {
        2 => StopBits::Two,
        _ => StopBits::One,
    }
}

/// Hardware flow control when enabled, none otherwise
pub fn to_serialport_flow_control(enabled: bool) -> FlowControl {
    if enabled {
        FlowControl::Hardware
    } else {
        FlowControl::None
    }
}

// ============================================================================
// Tests
// ============================================================================
