//! Tunnel byte pump shared by both ends of a Tunnel stream
//!
//! Two loops run against one local socket: socket → stream and
//! stream → socket. Whichever ends first (EOF or error) tears down both.

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::{recv_frame, send_frame, FrameSink, FrameSource, TunnelFrame, TUNNEL_CHUNK_SIZE};

/// Bytes moved by one tunnel before teardown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    /// Socket → stream
    pub sent: u64,
    /// Stream → socket
    pub received: u64,
}

/// Relay bytes between `socket` and a Tunnel stream until either side ends.
///
/// The opening frame must already have been exchanged. Byte order is kept
/// within each direction; frames with an empty chunk are ignored.
pub async fn pump<S>(socket: S, mut sink: FrameSink, mut source: FrameSource) -> TunnelStats
where
    S: AsyncRead + AsyncWrite + Send,
{
    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut stats = TunnelStats::default();

    {
        let sent = &mut stats.sent;
        let sink = &mut sink;
        let upstream = async move {
            let mut buf = vec![0u8; TUNNEL_CHUNK_SIZE];
            loop {
                let n = match reader.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        debug!("Tunnel socket read error: {}", e);
                        break;
                    }
                };
                if let Err(e) = send_frame(sink, &TunnelFrame::data(buf[..n].to_vec())).await {
                    debug!("Tunnel stream send error: {}", e);
                    break;
                }
                *sent += n as u64;
            }
        };

        let received = &mut stats.received;
        let writer = &mut writer;
        let source = &mut source;
        let downstream = async move {
            loop {
                let frame: TunnelFrame = match recv_frame(source).await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        debug!("Tunnel stream receive error: {}", e);
                        break;
                    }
                };
                if frame.chunk.is_empty() {
                    continue;
                }
                if let Err(e) = writer.write_all(&frame.chunk).await {
                    debug!("Tunnel socket write error: {}", e);
                    break;
                }
                *received += frame.chunk.len() as u64;
            }
        };

        tokio::select! {
            _ = upstream => {}
            _ = downstream => {}
        }
    }

    let _ = writer.shutdown().await;
    let _ = sink.close().await;
    stats
}
