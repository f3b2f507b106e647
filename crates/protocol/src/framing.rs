//! Length-delimited JSON framing for the agent's Unix domain socket IPC
//! (§6: "framed as length-prefixed JSON-RPC"). The hub↔exporter and
//! hub↔agent control channels instead ride WebSocket message framing
//! directly (one JSON object per text frame) and don't need this.

use crate::error::Error;
use crate::rpc::Frame;
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Wraps an IPC-style stream (a Unix domain socket) in 4-byte
/// length-prefixed framing and decodes each frame as a JSON-RPC
/// [`Frame`].
pub fn frame_transport<IO>(io: IO) -> Framed<IO, LengthDelimitedCodec>
where
    IO: AsyncRead + AsyncWrite,
{
    Framed::new(io, LengthDelimitedCodec::new())
}

pub async fn send_frame<S>(sink: &mut S, frame: &Frame) -> Result<(), Error>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
{
    let bytes = frame.encode()?;
    sink.send(Bytes::from(bytes)).await?;
    Ok(())
}

pub async fn recv_frame<T>(stream: &mut T) -> Result<Option<Frame>, Error>
where
    T: Stream<Item = std::io::Result<BytesMut>> + Unpin,
{
    match stream.next().await {
        Some(Ok(bytes)) => Ok(Some(Frame::decode(&bytes)?)),
        Some(Err(e)) => Err(Error::Io(e)),
        None => Ok(None),
    }
}
