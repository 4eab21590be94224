//! Network module.
//!
//! Contains the Gateway (TCP listener), the Connection handler and the
//! plain/TLS transport it reads and writes through.

mod connection;
mod gateway;
mod transport;

pub use connection::Connection;
pub use gateway::Gateway;
pub use transport::Transport;
