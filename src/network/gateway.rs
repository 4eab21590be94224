//! Gateway - TCP listener that accepts incoming connections.
//!
//! The Gateway binds to a socket and spawns a Connection task for each
//! incoming client.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info, instrument};

use crate::cmdhook::CmdHook;
use crate::db::Db;
use crate::network::Connection;
use crate::state::Registry;

/// The Gateway accepts incoming TCP connections and spawns handlers.
pub struct Gateway {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<Registry>,
    db: Db,
    webhook: Arc<CmdHook>,
}

impl Gateway {
    /// Bind the gateway to the specified address.
    pub async fn bind(
        addr: &str,
        acceptor: TlsAcceptor,
        registry: Arc<Registry>,
        db: Db,
        webhook: Arc<CmdHook>,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "gateway listening");
        Ok(Self {
            listener,
            acceptor,
            registry,
            db,
            webhook,
        })
    }

    /// The bound address, useful when binding to an ephemeral port.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the gateway, accepting connections forever.
    #[instrument(skip(self), name = "gateway")]
    pub async fn run(self) -> std::io::Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    info!(%addr, "connection accepted");
                    let connection = Connection::new(
                        stream,
                        addr,
                        self.acceptor.clone(),
                        Arc::clone(&self.registry),
                        self.db.clone(),
                        Arc::clone(&self.webhook),
                    );
                    tokio::spawn(connection.run());
                }
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                }
            }
        }
    }
}
