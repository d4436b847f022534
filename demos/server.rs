//! Thin accept-loop binary: wires a `SessionContext` per accepted
//! connection, in the same shape as the library's original NFS server
//! accept loop. The request/response wire protocol is out of scope (spec
//! §1) — this binary proves the session wiring, not a protocol handler.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, info_span, Instrument};

use irods_dgrid_core::catalog::InMemoryCatalog;
use irods_dgrid_core::config::ServerConfig;
use irods_dgrid_core::error::{Error, Result};
use irods_dgrid_core::forwarder::{Connection, Forwarder, RemoteDispatch};
use irods_dgrid_core::replication::ReplicationEngine;
use irods_dgrid_core::session::{LocalIdentity, SessionContext};

#[derive(Parser, Debug)]
struct Args {
    /// Path to a TOML server configuration file.
    #[arg(long)]
    config: PathBuf,
    /// Address to accept connections on.
    #[arg(long, default_value = "0.0.0.0:1247")]
    bind: String,
}

/// No server-to-server wire codec exists in this crate (spec §1); a real
/// deployment implements `RemoteDispatch` over it.
struct UnimplementedDispatch;

#[async_trait]
impl RemoteDispatch for UnimplementedDispatch {
    async fn connect(&self, zone: &str, host: &str) -> Result<Connection> {
        Err(Error::RemoteConnFail(format!(
            "no wire protocol configured to reach {zone}/{host}"
        )))
    }
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let text = std::fs::read_to_string(&args.config).expect("failed to read config file");
    let config = ServerConfig::from_toml(&text).expect("failed to parse config file");
    let resources = Arc::new(config.build_registry().expect("failed to build resource registry"));
    let catalog = InMemoryCatalog::new();
    let forwarder = Arc::new(Forwarder::new(config.zone.clone(), config.host.clone(), Arc::new(UnimplementedDispatch)));
    // One instance for the whole deployment: its advisory lock only
    // serializes concurrent replications of the same object if every
    // session shares it (spec §4.8 "Concurrency").
    let replication = Arc::new(ReplicationEngine::new());

    let listener = TcpListener::bind(&args.bind).await?;
    info!(bind = %args.bind, zone = %config.zone, "data-grid session server listening");

    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;

        let identity = LocalIdentity { zone: config.zone.clone(), host: config.host.clone() };
        let session =
            SessionContext::with_capacity(identity, resources.clone(), catalog.clone(), forwarder.clone(), replication.clone(), config.table_capacity);

        tokio::spawn(handle_connection(socket, session).instrument(info_span!("session", %peer)));
    }
}

async fn handle_connection(socket: TcpStream, session: SessionContext) {
    info!(zone = %session.identity.zone, host = %session.identity.host, "session established");
    // The wire protocol that would drive `crate::io`/`crate::replication`/
    // `crate::collection` off this socket is out of scope here; this task
    // exists to show the session lifecycle, so it simply waits for the
    // peer to close.
    let mut buf = [0u8; 1];
    loop {
        socket.readable().await.ok();
        match socket.try_read(&mut buf) {
            Ok(0) => break,
            Ok(_) => continue,
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(_) => break,
        }
    }
    info!("session closed");
    drop(session);
}
