//! Length-prefixed frame codec
//!
//! Each frame is a big-endian `u32` length followed by a `bincode` body.

use bytes::{Bytes, BytesMut};
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::{BoxedStream, CoreError, Result};

/// Largest accepted frame body (1 MiB)
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read buffer size for tunnel payload chunks
pub const TUNNEL_CHUNK_SIZE: usize = 4 * 1024;

pub type FramedStream = Framed<BoxedStream, LengthDelimitedCodec>;
pub type FrameSink = SplitSink<FramedStream, Bytes>;
pub type FrameSource = SplitStream<FramedStream>;

/// Wrap a raw connection in the frame codec
pub fn framed(io: BoxedStream) -> FramedStream {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_SIZE)
        .new_framed(io)
}

/// Split a framed connection into independently owned halves
pub fn split(stream: FramedStream) -> (FrameSink, FrameSource) {
    stream.split()
}

pub fn encode<T: Serialize>(msg: &T) -> Result<Bytes> {
    bincode::serialize(msg)
        .map(Bytes::from)
        .map_err(|e| CoreError::Encode(e.to_string()))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| CoreError::Decode(e.to_string()))
}

/// Encode and send one frame, flushing it to the peer
pub async fn send_frame<S, T>(sink: &mut S, msg: &T) -> Result<()>
where
    S: Sink<Bytes, Error = std::io::Error> + Unpin,
    T: Serialize,
{
    let bytes = encode(msg)?;
    sink.send(bytes).await?;
    Ok(())
}

/// Receive and decode one frame.
///
/// Returns `Ok(None)` on a clean end of stream.
pub async fn recv_frame<S, T>(source: &mut S) -> Result<Option<T>>
where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    match source.next().await {
        Some(Ok(bytes)) => decode(&bytes).map(Some),
        Some(Err(e)) => Err(CoreError::Io(e)),
        None => Ok(None),
    }
}

/// Receive one frame, treating end of stream as an error
pub async fn expect_frame<S, T>(source: &mut S) -> Result<T>
where
    S: Stream<Item = std::io::Result<BytesMut>> + Unpin,
    T: DeserializeOwned,
{
    recv_frame(source).await?.ok_or(CoreError::ConnectionClosed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ack, TunnelFrame};

    fn pair() -> (FramedStream, FramedStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (framed(Box::new(a)), framed(Box::new(b)))
    }

    #[tokio::test]
    async fn test_send_and_receive_frame() {
        let (mut a, mut b) = pair();
        send_frame(&mut a, &Ack::ok()).await.unwrap();
        let ack: Ack = expect_frame(&mut b).await.unwrap();
        assert!(ack.ok);
    }

    #[tokio::test]
    async fn test_frames_preserve_order() {
        let (mut a, mut b) = pair();
        for i in 0..10u8 {
            send_frame(&mut a, &TunnelFrame::data(vec![i; 3])).await.unwrap();
        }
        for i in 0..10u8 {
            let frame: TunnelFrame = expect_frame(&mut b).await.unwrap();
            assert_eq!(frame.chunk, vec![i; 3]);
        }
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (a, mut b) = pair();
        drop(a);
        let frame: Option<Ack> = recv_frame(&mut b).await.unwrap();
        assert!(frame.is_none());
    }

    #[tokio::test]
    async fn test_expect_frame_on_eof() {
        let (a, mut b) = pair();
        drop(a);
        let result: Result<Ack> = expect_frame(&mut b).await;
        assert!(matches!(result, Err(CoreError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_garbage_frame_is_decode_error() {
        let (mut a, mut b) = pair();
        a.send(Bytes::from_static(&[0xff])).await.unwrap();
        let result: Result<Option<TunnelFrame>> = recv_frame(&mut b).await;
        assert!(result.unwrap_err().is_decode());
    }

    #[tokio::test]
    async fn test_split_halves() {
        let (a, b) = pair();
        let (mut a_sink, _a_source) = split(a);
        let (_b_sink, mut b_source) = split(b);
        send_frame(&mut a_sink, &Ack::rejected("no")).await.unwrap();
        let ack: Ack = expect_frame(&mut b_source).await.unwrap();
        assert_eq!(ack.message.as_deref(), Some("no"));
    }
}
