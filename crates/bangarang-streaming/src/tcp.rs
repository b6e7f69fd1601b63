//! TCP event provider: accepts connections, performs the handshake, and
//! decodes length-prefixed event payloads off the wire into the pipeline.
//!
//! Grounded on `provider/tcp/tcp.go`'s `TCPProvider`: write the handshake
//! once per connection, then loop reading an 8-byte length header followed
//! by that many payload bytes, decoding and forwarding each one. A
//! malformed header or payload closes just that connection; it never
//! brings down the listener or the other connections it's serving.

use bangarang::errors::{Error, Result};
use bangarang::{Event, Pipeline};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Written immediately on accept so a connecting client can confirm this
/// is a bangarang listener before it starts streaming events.
pub const START_HANDSHAKE: &[u8] = b"BANGARANG: TCP_PROVIDER";

/// Largest payload this provider will read for one event. Guards against a
/// malicious or confused client declaring an unbounded length.
const MAX_EVENT_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Wire encoding for event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
    MsgPack,
}

impl Codec {
    pub fn parse(name: &str) -> Codec {
        match name {
            "msgpack" | "messagepack" => Codec::MsgPack,
            _ => Codec::Json,
        }
    }

    fn decode(self, payload: &[u8]) -> Result<Event> {
        match self {
            Codec::Json => serde_json::from_slice(payload).map_err(Error::from),
            Codec::MsgPack => rmp_serde::from_slice(payload)
                .map_err(|e| Error::ProviderProtocol(format!("msgpack decode: {e}"))),
        }
    }
}

/// Runs the TCP provider until the listener fails to bind. Each accepted
/// connection is handled on its own task and never blocks the accept loop.
pub async fn serve(bind_addr: &str, codec: Codec, pipeline: Pipeline) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(Error::Io)?;
    info!(%bind_addr, "tcp provider listening");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                info!(%peer, "accepted tcp provider connection");
                let pipeline = pipeline.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_one(stream, codec, &pipeline).await {
                        warn!(%peer, error = %e, "tcp provider connection closed");
                    }
                });
            }
            Err(e) => error!(error = %e, "tcp provider accept failed"),
        }
    }
}

/// Handshake, then decode-and-forward loop for one accepted connection.
/// Exposed separately from [`serve`] so a caller that manages its own
/// listener (tests, or a binary multiplexing several providers) can drive
/// one connection directly.
pub async fn serve_one(mut stream: TcpStream, codec: Codec, pipeline: &Pipeline) -> Result<()> {
    stream.write_all(START_HANDSHAKE).await.map_err(Error::Io)?;

    let mut size_buf = [0u8; 8];
    loop {
        if let Err(e) = stream.read_exact(&mut size_buf).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(Error::Io(e));
        }

        let next_len = u64::from_le_bytes(size_buf);
        if next_len > MAX_EVENT_PAYLOAD {
            return Err(Error::ProviderProtocol(format!(
                "declared event payload of {next_len} bytes exceeds the {MAX_EVENT_PAYLOAD} byte cap"
            )));
        }

        let mut payload = vec![0u8; next_len as usize];
        stream.read_exact(&mut payload).await.map_err(Error::Io)?;

        debug!(bytes = next_len, "decoding event off tcp provider connection");
        match codec.decode(&payload) {
            Ok(event) => {
                if pipeline.pass_event(event).await.is_err() {
                    // Dispatcher has shut down; nothing left to forward to.
                    return Ok(());
                }
            }
            Err(e) => warn!(error = %e, "dropping malformed event from tcp provider"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bangarang::event::TagSet;
    use bangarang::index::InMemoryIndex;
    use std::sync::Arc;

    #[tokio::test]
    async fn handshake_is_written_immediately_on_accept() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (pipeline, _handle) =
            Pipeline::spawn(bangarang::AppConfig::default(), Arc::new(InMemoryIndex::new())).unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_one(stream, Codec::Json, &pipeline).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; START_HANDSHAKE.len()];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, START_HANDSHAKE);
    }

    #[tokio::test]
    async fn decodes_a_json_event_and_forwards_it() {
        let mut tags = TagSet::new();
        tags.set("host", "h1");
        let event = Event::new(42.0, tags);
        let payload = serde_json::to_vec(&event).unwrap();

        let mut body = Vec::new();
        body.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        body.extend_from_slice(&payload);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (pipeline, _handle) =
            Pipeline::spawn(bangarang::AppConfig::default(), Arc::new(InMemoryIndex::new())).unwrap();
        let pipeline_for_consume = pipeline.clone();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _ = serve_one(stream, Codec::Json, &pipeline_for_consume).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut handshake_buf = [0u8; START_HANDSHAKE.len()];
        client.read_exact(&mut handshake_buf).await.unwrap();
        client.write_all(&body).await.unwrap();
        drop(client);

        let _ = server.await;
        assert_eq!(pipeline.tracker().event_stats().events_total, 1);
    }

    #[test]
    fn codec_parse_defaults_to_json() {
        assert_eq!(Codec::parse("anything-else"), Codec::Json);
        assert_eq!(Codec::parse("msgpack"), Codec::MsgPack);
    }
}
