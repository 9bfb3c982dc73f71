//! Client front end
//!
//! Accepts client connections for one service, opens a router session for
//! each and feeds it client packets until the client quits or goes away.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::protocol::{Command, ErrPacket};
use crate::router::RouterInstance;
use crate::session::{RouterSession, SessionError};
use crate::transport::{Endpoint, TransportError};

/// CR_CONN_HOST_ERROR: no session could be set up for the client
const ER_SESSION_OPEN: u16 = 2003;

/// Accept clients until `shutdown` is cancelled
pub async fn serve(
    listener: TcpListener,
    instance: Arc<RouterInstance>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    info!(service = %instance.name(), addr = %listener.local_addr()?, "Service listening");

    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(service = %instance.name(), "Service stopped accepting");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                    continue;
                }
            },
        };

        debug!(service = %instance.name(), peer = %peer_addr, "New connection");
        let instance = instance.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(instance, stream).await {
                warn!(peer = %peer_addr, error = %e, "Client session ended with error");
            }
        });
    }
}

/// Drive one client connection from accept to close
pub async fn handle_client(instance: Arc<RouterInstance>, stream: TcpStream) -> Result<(), SessionError> {
    let client = Endpoint::accepted(stream).map_err(TransportError::from)?;

    let session = match instance.open_session(client.clone()).await {
        Ok(session) => session,
        Err(e) => {
            let packet = ErrPacket::new(ER_SESSION_OPEN, "HY000", format!("Unable to open session: {}", e)).encode(0);
            if let Err(write_err) = client.write_packet(&packet).await {
                debug!(error = %write_err, "Failed to send session error");
            }
            client.close();
            return Err(e);
        }
    };

    let result = drive(&session, &client).await;

    session.close().await;
    instance.free_session(&session);
    client.close();
    info!(session_id = session.id(), "Client disconnected");
    result
}

/// Route client packets until COM_QUIT, EOF or session teardown
async fn drive(session: &RouterSession, client: &Endpoint) -> Result<(), SessionError> {
    loop {
        let packet = tokio::select! {
            _ = client.cancelled() => return Ok(()),
            packet = client.read_packet() => packet?,
        };
        let Some(packet) = packet else {
            return Ok(());
        };
        if packet.command() == Command::Quit {
            return Ok(());
        }

        match session.route(&packet).await {
            Ok(_) => {}
            Err(SessionError::Transport(e)) => {
                warn!(session_id = session.id(), error = %e, "Statement could not be delivered");
                let reply = ErrPacket::server_lost(&e.to_string()).encode(packet.sequence_id.wrapping_add(1));
                client.write_packet(&reply).await?;
            }
            Err(e) => return Err(e),
        }
    }
}
