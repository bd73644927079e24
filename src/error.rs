// src/error.rs
//
// Error types for the serial link core.

use thiserror::Error;

use crate::io::serial::NegotiationFailure;

/// Errors surfaced by serial link operations.
#[derive(Debug, Error)]
pub enum SerialError {
    /// I/O error on an open handle (read, write, flush).
    #[error("Serial I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device could not be opened at the requested speed.
    #[error("Failed to open {path} at {baud_rate} baud: {message}")]
    Open {
        path: String,
        baud_rate: u32,
        message: String,
    },

    /// Every candidate speed failed or timed out.
    #[error(transparent)]
    Negotiation(#[from] NegotiationFailure),

    /// `send` was called with no open link.
    #[error("No serial port connected")]
    NotConnected,

    /// The link went away while an operation was in flight.
    #[error("Serial link closed: {0}")]
    LinkClosed(String),

    /// Too many writes are already queued on the link.
    #[error("Transmit queue full")]
    TransmitQueueFull,

    /// The read loop did not report a write result in time.
    #[error("Transmit timed out")]
    TransmitTimeout,

    /// Port enumeration failed.
    #[error("Failed to enumerate ports: {0}")]
    Enumerate(String),
}

/// Result type alias using SerialError.
pub type Result<T> = std::result::Result<T, SerialError>;
