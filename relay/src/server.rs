use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::TransportError;
use crate::report::ReportFormat;
use crate::session::{SessionController, SessionOutcome};

/// Upper bound on a single WebSocket upgrade
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket endpoint the Test Agent connects back to.
///
/// Serves exactly one session; connections arriving while it is active are
/// refused.
pub struct RelayServer {
    listener: TcpListener,
    tests: Vec<String>,
    format: Arc<dyn ReportFormat>,
    connect_timeout: Duration,
}

impl RelayServer {
    pub async fn bind(
        addr: SocketAddr,
        tests: Vec<String>,
        format: Arc<dyn ReportFormat>,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;

        Ok(Self {
            listener,
            tests,
            format,
            connect_timeout,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the Test Agent, drive the session and return its outcome.
    pub async fn run(self) -> Result<SessionOutcome, TransportError> {
        info!("Listening on {}", self.local_addr()?);

        let (mut ws, peer) = match timeout(self.connect_timeout, self.accept_session()).await {
            Ok(accepted) => accepted?,
            Err(_) => {
                warn!("No Test Agent connected within {:?}", self.connect_timeout);
                return Ok(SessionOutcome::Aborted {
                    reason: format!("no connection within {:?}", self.connect_timeout),
                });
            }
        };
        info!("Test Agent connected: {peer}");

        let mut session = SessionController::new(self.tests.clone(), self.format.clone());
        if let Some(command) = session.open() {
            if let Err(e) = ws.send(Message::Text(command)).await {
                error!("Failed to send run command: {e}");
                return Ok(abort(&mut session));
            }
        }

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(refuse(stream, peer));
                        }
                        Err(e) => error!("Accept error: {e}"),
                    }
                }

                frame = ws.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                            Ok(text) => text,
                            Err(e) => {
                                warn!("Dropping non UTF-8 binary frame: {e}");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(frame))) => {
                            debug!("Close frame from {peer}: {frame:?}");
                            break;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            warn!("Read error from {peer}: {e}");
                            break;
                        }
                        None => break,
                    };

                    if let Some(outcome) = session.handle_message(&text) {
                        if let Err(e) = ws.close(None).await {
                            debug!("Error closing connection to {peer}: {e}");
                        }
                        session.close();
                        info!("Test Agent disconnected: {peer}");
                        return Ok(outcome);
                    }
                }
            }
        }

        info!("Test Agent disconnected: {peer}");
        Ok(abort(&mut session))
    }

    /// Accept connections until one completes the WebSocket handshake.
    ///
    /// Handshakes run concurrently, each bounded by [`HANDSHAKE_TIMEOUT`], so a
    /// peer that never upgrades cannot hold up the Test Agent behind it.
    async fn accept_session(
        &self,
    ) -> Result<(WebSocketStream<TcpStream>, SocketAddr), TransportError> {
        let mut handshakes = JoinSet::new();

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!("TCP connection from {peer}");
                    handshakes.spawn(handshake(stream, peer));
                }

                Some(joined) = handshakes.join_next() => {
                    if let Ok(Some(accepted)) = joined {
                        return Ok(accepted);
                    }
                }
            }
        }
    }
}

async fn handshake(
    stream: TcpStream,
    peer: SocketAddr,
) -> Option<(WebSocketStream<TcpStream>, SocketAddr)> {
    match timeout(HANDSHAKE_TIMEOUT, accept_async(stream)).await {
        Ok(Ok(ws)) => Some((ws, peer)),
        Ok(Err(e)) => {
            warn!("Handshake with {peer} failed: {e}");
            None
        }
        Err(_) => {
            warn!("Handshake with {peer} timed out");
            None
        }
    }
}

fn abort(session: &mut SessionController) -> SessionOutcome {
    session
        .transport_closed()
        .unwrap_or_else(|| SessionOutcome::Aborted {
            reason: "connection closed".to_string(),
        })
}

/// Turn away a connection that arrived while a session is active.
async fn refuse(stream: TcpStream, peer: SocketAddr) {
    warn!("Refusing connection from {peer}: a session is already active");

    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Handshake with {peer} failed: {e}");
            return;
        }
    };

    let frame = CloseFrame {
        code: CloseCode::Policy,
        reason: "session already active".into(),
    };
    if let Err(e) = ws.close(Some(frame)).await {
        debug!("Error closing refused connection {peer}: {e}");
    }
}
