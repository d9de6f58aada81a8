//! Serial G-code host core: discover printers, identify their firmware, and stream
//! pre-sliced command files with flow control, progress tracking, pause/resume and
//! emergency stop.

pub mod communication;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod firmware;
pub mod gcode_source;
pub mod host;
pub mod monitor;
pub mod print_job;
pub mod retry;
pub mod simulator;

pub use communication::{AckEvent, ConnectionError, ProtocolError, Temperatures};
pub use config::{Config, ConfigError, load_config};
pub use connection::{Connection, ConnectionHandle, ConnectionStatus, LinkState};
pub use discovery::{DeviceCandidate, detect_printers};
pub use firmware::{Dialect, FirmwareIdentity};
pub use gcode_source::CommandSource;
pub use host::PrinterHost;
pub use print_job::{JobHandle, JobState, PrintJobError, ProgressObserver, ProgressSnapshot};
