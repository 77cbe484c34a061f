use thiserror::Error;

use crate::drivers::device::DeviceState;
use crate::drivers::protocol::Opcode;

#[derive(Debug, Error)]
pub enum RadarError {
    #[error("failed to open serial port {port}: {source}")]
    Connection {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("device rejected {command} with status {code}")]
    Device { command: Opcode, code: u8 },
    #[error("malformed device response: {0}")]
    Protocol(String),
    #[error("could not parse ultrasonic line {line:?}: {reason}")]
    Parse { line: String, reason: String },
    #[error("no ultrasonic sensor configured")]
    SensorAbsent,
    #[error("{command} is not allowed while the device is {state}")]
    InvalidState { command: Opcode, state: DeviceState },
    #[error("invalid device configuration: {0}")]
    InvalidConfig(String),
    #[error("sample length mismatch: expected {expected}, got I={i} Q={q}")]
    SampleMismatch { expected: usize, i: usize, q: usize },
}

impl RadarError {
    /// Errors that end a running session (as opposed to ones a cycle can shrug off).
    pub fn is_fatal(&self) -> bool {
        !matches!(self, RadarError::Parse { .. } | RadarError::SensorAbsent)
    }
}
