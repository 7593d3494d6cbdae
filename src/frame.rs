//! Length-prefix framing codec for the TCP carriers
//!
//! On the wire a message is `be32(len) || payload`. The payload length is
//! capped per carrier (`max_frame_len` in the relevant config); a prefix
//! above the cap is a fatal framing error for that connection, while an
//! attempt to *send* an oversized payload is rejected before any bytes
//! leave the process.
//!
//! All operations are all-or-nothing at message granularity and observe
//! the transport's [`Shutdown`] signal between kernel calls.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TransportError};
use crate::net::{self, Shutdown};

/// Size of the big-endian length prefix.
pub const PREFIX_LEN: usize = 4;

/// Default payload cap for the TCP server carrier.
pub const DEFAULT_MAX_FRAME: usize = 1024 * 1024;

/// Encode `payload` with its 4-byte big-endian length prefix.
///
/// # Errors
///
/// Returns [`TransportError::SizeLimitExceeded`] when the payload is
/// larger than `max`.
pub fn encode(payload: &[u8], max: usize) -> Result<Bytes> {
    if payload.len() > max {
        return Err(TransportError::SizeLimitExceeded {
            len: payload.len(),
            max,
        }
        .into());
    }
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Send one framed message as a single vectored write.
///
/// The prefix and payload go out in one gather write; short writes are
/// advanced by the socket layer. A zero-length payload is a valid frame.
pub async fn send_framed<W>(
    io: &mut W,
    payload: &[u8],
    max: usize,
    shutdown: &Shutdown,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > max {
        return Err(TransportError::SizeLimitExceeded {
            len: payload.len(),
            max,
        }
        .into());
    }
    let prefix = (payload.len() as u32).to_be_bytes();
    net::send_vectored(io, &[&prefix, payload], shutdown).await
}

/// Send a message assembled from several buffers as one framed write.
///
/// The frame length is the sum of all slices; the prefix and every slice
/// go out in a single gather write.
pub async fn send_framed_vectored<W>(
    io: &mut W,
    bufs: &[&[u8]],
    max: usize,
    shutdown: &Shutdown,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let total: usize = bufs.iter().map(|b| b.len()).sum();
    if total > max {
        return Err(TransportError::SizeLimitExceeded { len: total, max }.into());
    }
    let prefix = (total as u32).to_be_bytes();
    let mut iov: Vec<&[u8]> = Vec::with_capacity(bufs.len() + 1);
    iov.push(&prefix);
    iov.extend_from_slice(bufs);
    net::send_vectored(io, &iov, shutdown).await
}

/// Receive one framed message.
///
/// Reads exactly four prefix bytes, validates the announced length against
/// `max`, then reads exactly that many payload bytes.
///
/// # Errors
///
/// - [`TransportError::FramingError`] when the prefix announces a length
///   above `max`; the connection must be torn down by the caller.
/// - [`TransportError::ConnectionClosed`] when the peer closes.
/// - [`TransportError::Cancelled`] when shutdown fires mid-read.
pub async fn recv_framed<R>(io: &mut R, max: usize, shutdown: &Shutdown) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; PREFIX_LEN];
    net::recv_exact(io, &mut prefix, shutdown).await?;

    let len = u32::from_be_bytes(prefix) as usize;
    if len > max {
        return Err(TransportError::FramingError(format!(
            "announced frame length {} exceeds cap {}",
            len, max
        ))
        .into());
    }
    if len == 0 {
        return Ok(Bytes::new());
    }

    let mut payload = BytesMut::zeroed(len);
    net::recv_exact(io, &mut payload, shutdown).await?;
    Ok(payload.freeze())
}

/// Strip a redundant length prefix from an incoming WebSocket frame.
///
/// Some peers wrap their text payload in the TCP framing before handing it
/// to the WebSocket layer. When the first four bytes decode to a length
/// that fits inside the remaining frame, the prefix is dropped and the
/// announced span returned; otherwise the frame is passed through intact.
pub fn strip_length_prefix(frame: &[u8]) -> &[u8] {
    if frame.len() >= PREFIX_LEN {
        let announced =
            u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        if announced > 0 && announced <= frame.len() - PREFIX_LEN {
            return &frame[PREFIX_LEN..PREFIX_LEN + announced];
        }
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::kind_of;

    #[test]
    fn test_encode_prepends_be32_prefix() {
        let framed = encode(b"abc", DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[test]
    fn test_encode_zero_length_payload() {
        let framed = encode(b"", DEFAULT_MAX_FRAME).unwrap();
        assert_eq!(&framed[..], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_encode_rejects_oversize() {
        let err = encode(&[0u8; 9], 8).unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(TransportError::SizeLimitExceeded { len: 9, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_send_recv_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(256);
        let shutdown = Shutdown::new();

        let payload = br#"{"id":1,"method":"echo","params":{"t":"hi"}}"#;
        send_framed(&mut a, payload, DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap();

        let received = recv_framed(&mut b, DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap();
        assert_eq!(&received[..], payload);
    }

    #[tokio::test]
    async fn test_roundtrip_zero_length_frame() {
        let (mut a, mut b) = tokio::io::duplex(16);
        let shutdown = Shutdown::new();

        send_framed(&mut a, b"", DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap();
        let received = recv_framed(&mut b, DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn test_send_framed_vectored_joins_buffers() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let shutdown = Shutdown::new();

        send_framed_vectored(&mut a, &[b"he", b"llo"], DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap();
        let received = recv_framed(&mut b, DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap();
        assert_eq!(&received[..], b"hello");
    }

    #[tokio::test]
    async fn test_recv_rejects_oversize_prefix() {
        let (mut a, mut b) = tokio::io::duplex(64);
        let shutdown = Shutdown::new();

        // Announce 64 MiB on a connection capped at 1 MiB.
        let prefix = (64u32 * 1024 * 1024).to_be_bytes();
        net::send_all(&mut a, &prefix, &shutdown).await.unwrap();

        let err = recv_framed(&mut b, DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(kind_of(&err), Some(TransportError::FramingError(_))));
    }

    #[tokio::test]
    async fn test_recv_reports_closed_on_eof() {
        let (a, mut b) = tokio::io::duplex(16);
        let shutdown = Shutdown::new();
        drop(a);

        let err = recv_framed(&mut b, DEFAULT_MAX_FRAME, &shutdown)
            .await
            .unwrap_err();
        assert!(matches!(
            kind_of(&err),
            Some(TransportError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_strip_length_prefix_when_prefix_matches() {
        let mut frame = Vec::from(&3u32.to_be_bytes()[..]);
        frame.extend_from_slice(b"abc");
        assert_eq!(strip_length_prefix(&frame), b"abc");
    }

    #[test]
    fn test_strip_length_prefix_passthrough_when_no_prefix() {
        // `{"js` decodes to a huge big-endian length; must pass through.
        let frame = br#"{"jsonrpc":"2.0"}"#;
        assert_eq!(strip_length_prefix(frame), &frame[..]);
    }

    #[test]
    fn test_strip_length_prefix_short_frame_passthrough() {
        assert_eq!(strip_length_prefix(b"ab"), b"ab");
    }
}
