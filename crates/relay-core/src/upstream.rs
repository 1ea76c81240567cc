//! Upstream stream transport: newline-delimited JSON over TCP.
//!
//! A consumer connects, sends one handshake line `{"kind":"<kind>"}` and
//! then receives one frame per line until either side closes. The consumer
//! keeps its write half open for the whole session; closing it is how the
//! server learns the consumer went away.

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::Stream;
use tracing::info;

use relay_common::StreamKind;

/// Errors from stream transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("handshake rejected: {0}")]
    Handshake(String),
}

impl From<TransportError> for relay_common::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Handshake(msg) => relay_common::Error::Handshake(msg),
            other => relay_common::Error::Transport(other.to_string()),
        }
    }
}

/// First line a stream consumer sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHandshake {
    pub kind: StreamKind,
}

/// Line the server sends instead of frames when it refuses a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRefusal {
    pub error: String,
}

/// Write one JSON line.
pub(crate) async fn write_line(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    line: &str,
) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Send a refusal line and turn it into a handshake error.
pub(crate) async fn refuse(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    reason: String,
) -> TransportError {
    if let Ok(line) = serde_json::to_string(&StreamRefusal {
        error: reason.clone(),
    }) {
        let _ = write_line(writer, &line).await;
    }
    TransportError::Handshake(reason)
}

/// An open upstream session yielding raw frames in send order.
pub struct UpstreamConnection {
    lines: LinesStream<BufReader<OwnedReadHalf>>,
    _writer: OwnedWriteHalf,
}

impl Stream for UpstreamConnection {
    type Item = Result<String, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.lines)
            .poll_next(cx)
            .map(|item| item.map(|line| line.map_err(TransportError::from)))
    }
}

/// Connect to a stream server and subscribe to `kind`.
pub async fn connect_upstream(
    addr: &str,
    kind: StreamKind,
) -> Result<UpstreamConnection, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;
    let (read_half, mut write_half) = stream.into_split();

    let handshake = serde_json::to_string(&StreamHandshake { kind })
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    write_line(&mut write_half, &handshake).await?;
    info!(upstream = %addr, kind = %kind, "subscribed to upstream stream");

    Ok(UpstreamConnection {
        lines: LinesStream::new(BufReader::new(read_half).lines()),
        _writer: write_half,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_wire_shape() {
        let line = serde_json::to_string(&StreamHandshake {
            kind: StreamKind::Pxm,
        })
        .expect("encode");
        assert_eq!(line, r#"{"kind":"pxm"}"#);
        let back: StreamHandshake = serde_json::from_str(r#"{"kind":"telemetry"}"#).expect("decode");
        assert_eq!(back.kind, StreamKind::Telemetry);
    }

    #[tokio::test]
    async fn test_connect_refused_names_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr").to_string();
        drop(listener);
        match connect_upstream(&addr, StreamKind::Kpm).await {
            Err(TransportError::Connect { addr: a, .. }) => assert_eq!(a, addr),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("connect should fail"),
        }
    }
}
