//! Live viewer transport: newline-delimited JSON over TCP.
//!
//! A viewer sends `{"pipeline":"<kind>","client_id":"<id>"}` and then
//! receives one record per line. Anything it sends afterwards is ignored;
//! closing the connection ends the session.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use relay_common::{SessionId, StreamKind};

use crate::broadcast::LiveBroadcaster;
use crate::upstream::{refuse, write_line, TransportError};

/// First line a viewer sends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewerHandshake {
    pub pipeline: StreamKind,
    #[serde(default)]
    pub client_id: String,
}

/// Accepts viewers and attaches them to their pipeline's broadcaster.
pub struct ViewerServer {
    broadcasters: BTreeMap<StreamKind, Arc<LiveBroadcaster>>,
    session_buffer: usize,
}

impl ViewerServer {
    pub fn new(session_buffer: usize) -> Self {
        Self {
            broadcasters: BTreeMap::new(),
            session_buffer: session_buffer.max(1),
        }
    }

    pub fn add_pipeline(&mut self, kind: StreamKind, broadcaster: Arc<LiveBroadcaster>) {
        self.broadcasters.insert(kind, broadcaster);
    }

    /// Accept viewers until `shutdown` fires.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "viewer channel listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "viewer accept failed");
                            continue;
                        }
                    };
                    let server = Arc::clone(&self);
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_viewer(stream, shutdown).await {
                            warn!(peer = %peer, error = %e, "viewer session failed");
                        }
                    });
                }
            }
        }
        info!("viewer channel stopped");
        Ok(())
    }

    async fn handle_viewer(
        &self,
        stream: TcpStream,
        shutdown: CancellationToken,
    ) -> Result<(), TransportError> {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let Some(line) = lines.next_line().await? else {
            return Err(TransportError::Handshake(
                "connection closed before handshake".to_string(),
            ));
        };
        let handshake: ViewerHandshake = match serde_json::from_str(&line) {
            Ok(h) => h,
            Err(e) => return Err(refuse(&mut write_half, format!("bad handshake: {}", e)).await),
        };
        let Some(broadcaster) = self.broadcasters.get(&handshake.pipeline) else {
            let reason = format!("pipeline {} is not running", handshake.pipeline);
            return Err(refuse(&mut write_half, reason).await);
        };

        let id = SessionId::new(&handshake.client_id);
        let (tx, mut rx) = mpsc::channel(self.session_buffer);
        broadcaster.connect(id.clone(), tx);

        let outcome = loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = write_line(&mut write_half, &frame).await {
                            break Err(TransportError::Io(e));
                        }
                    }
                    // Pruned by the broadcaster.
                    None => break Ok(()),
                },
                inbound = lines.next_line() => match inbound {
                    Ok(Some(_)) => {}
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(TransportError::Io(e)),
                },
                _ = shutdown.cancelled() => break Ok(()),
            }
        };

        let report = broadcaster.disconnect(&id).await;
        debug!(session = %id, pruned = report.pruned.len(), "viewer session ended");
        outcome
    }
}
