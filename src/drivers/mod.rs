// src/drivers/mod.rs
pub mod buffer;
pub mod device;
pub mod error;
pub mod fft;
pub mod protocol;
pub mod simulated;
pub mod transport;

pub use buffer::{PhaseHistory, PHASE_HISTORY_LEN};
pub use device::{DeviceState, RadarDevice};
pub use error::RadarError;
pub use fft::{ProcessedTarget, SignalProcessor};
pub use protocol::{Channels, DetectionResult, DeviceConfiguration, Opcode};
pub use simulated::{SimulatedRadar, SimulatedUltrasonic};
pub use transport::{FrameConfig, Link, SerialPortTransport, SerialTransport};
