// src/io/serial/mod.rs
//
// Serial link to a RoboGo controller.
//
// Features:
// - Frame extraction from the device stream (JSON objects and banner blocks)
// - Baud rate negotiation across the common controller speeds
// - A single managed link with ordered command transmit and clean teardown

#[cfg(test)]
pub(crate) mod fake;
pub mod framer;
pub mod link;
pub mod negotiator;
pub mod reader; // pub for the `ports` command (list_serial_ports)
pub mod transport;
pub(crate) mod utils;

pub use framer::{
    BufferGuard, Frame, FrameExtractor, FrameKind, DEFAULT_BUFFER_CEILING, MAX_BLOCK_LEN,
};
pub use link::{FrameSink, LinkInfo, LinkState, SerialLink};
pub use negotiator::{
    candidate_list, AttemptOutcome, BaudCandidate, ConnectionAttempt, LinkNegotiator,
    NegotiationFailure, NegotiatorConfig, COMMON_BAUD_RATES, DEFAULT_BAUD_RATE,
};
pub use reader::{is_controller_port, list_controller_ports, list_serial_ports, SerialPortInfo};
pub use transport::{SerialTransport, SerialportTransport};
