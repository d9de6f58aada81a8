pub mod codec;
pub mod protocol;
pub mod transport;

pub use codec::{AckEvent, Temperatures};
pub use protocol::{ExecuteOptions, ProtocolEngine, ProtocolError, Reply};
pub use transport::{ConnectionError, PortOpener, SerialPortOpener, Transport};
