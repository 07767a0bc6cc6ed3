pub mod manager;
pub mod transport;

pub use manager::{ConnectionHandle, ConnectionManager, ConnectionStatus, ReconnectPolicy};
pub use transport::{Connector, Link, LinkEvent, OutboundFrame, WsConnector};
