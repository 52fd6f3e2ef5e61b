//! TCP transport
//!
//! One connection per request, like a REQ/REP socket pair: connect, send one
//! framed envelope, read one framed reply. The server side accepts any number
//! of sequential requests per connection.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use super::codec::{self, FrameError};
use super::{MessageHandler, Transport, TransportError};
use crate::coord::types::{Envelope, ErrorKind, Reply, WorkerAddress};
use crate::core::config::ClusterConfig;

#[derive(Debug, Clone)]
pub struct TcpTransport {
    request_timeout: Duration,
    max_frame_bytes: usize,
}

impl TcpTransport {
    pub fn new(request_timeout: Duration, max_frame_bytes: usize) -> Self {
        Self {
            request_timeout,
            max_frame_bytes,
        }
    }

    pub fn from_config(config: &ClusterConfig) -> Self {
        Self::new(config.request_timeout(), config.max_frame_bytes)
    }

    async fn exchange(&self, peer: &WorkerAddress, envelope: &Envelope) -> Result<Reply, TransportError> {
        let io_err = |source| TransportError::Io {
            peer: peer.clone(),
            source,
        };
        let mut stream = TcpStream::connect(peer.as_str()).await.map_err(io_err)?;
        stream.set_nodelay(true).map_err(io_err)?;

        let bytes = codec::encode(envelope)?;
        codec::write_frame(&mut stream, &bytes).await.map_err(io_err)?;

        match codec::read_frame(&mut stream, self.max_frame_bytes).await {
            Ok(Some(frame)) => codec::decode(&frame),
            Ok(None) => Err(TransportError::Closed(peer.clone())),
            Err(FrameError::Io(source)) => Err(io_err(source)),
            Err(err @ FrameError::TooLarge { .. }) => Err(TransportError::Codec(err.to_string())),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn request(
        &self,
        peer: &WorkerAddress,
        envelope: Envelope,
    ) -> Result<Reply, TransportError> {
        match tokio::time::timeout(self.request_timeout, self.exchange(peer, &envelope)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout {
                peer: peer.clone(),
                timeout_ms: self.request_timeout.as_millis() as u64,
            }),
        }
    }
}

/// Accept connections forever, answering each request through `handler`
pub async fn serve(
    listener: TcpListener,
    handler: Arc<dyn MessageHandler>,
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!("listening on {}", addr);
    }
    loop {
        let (stream, remote) = listener.accept().await?;
        debug!("accepted connection from {}", remote);
        let handler = handler.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, handler, max_frame_bytes).await {
                warn!("connection from {} ended with error: {}", remote, err);
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn MessageHandler>,
    max_frame_bytes: usize,
) -> std::io::Result<()> {
    loop {
        let frame = match codec::read_frame(&mut stream, max_frame_bytes).await {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(FrameError::TooLarge { len, max }) => {
                // the rest of the stream cannot be resynchronised
                let reply = Reply::error(
                    ErrorKind::Malformed,
                    format!("frame of {} bytes exceeds limit of {} bytes", len, max),
                );
                write_reply(&mut stream, &reply).await?;
                return Ok(());
            }
            Err(FrameError::Io(err)) => return Err(err),
        };

        let reply = match codec::decode::<Envelope>(&frame) {
            Ok(envelope) => handler.handle(envelope).await,
            Err(err) => {
                warn!("rejecting malformed request: {}", err);
                Reply::error(ErrorKind::Malformed, err.to_string())
            }
        };
        write_reply(&mut stream, &reply).await?;
    }
}

async fn write_reply(stream: &mut TcpStream, reply: &Reply) -> std::io::Result<()> {
    let bytes = codec::encode(reply)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
    codec::write_frame(stream, &bytes).await
}
