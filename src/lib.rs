// src/lib.rs
pub mod drivers;
pub mod engine;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod timer;
pub mod types;
pub mod ultrasonic;

pub use engine::{AcquisitionLoop, ExitReason};
pub use recorder::SessionRecorder;
pub use session::{RadarSession, SessionConfig};
pub use settings::{AppSettings, PlotBounds};
pub use timer::{SessionTimer, TimerHandle};
pub use types::{EventBus, EventKind, RadarEvent};
pub use ultrasonic::UltrasonicReader;
