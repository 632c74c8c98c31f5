//! Frame header layout and cancellation-safe frame reading.

use std::fmt;
use std::io;
use std::marker::Unpin;

use crate::protocol::RrCode;
use crate::utils::FedError;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use serde::de::DeserializeOwned;
use serde::Serialize;

use tokio::io::AsyncReadExt;

/// Why `read_frame()` gave up on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// The connection failed or was closed.
    Transport(FedError),
    /// The peer sent bytes that do not form a valid frame.
    Malformed(FedError),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FrameError::Transport(e) => write!(f, "{}", e),
            FrameError::Malformed(e) => write!(f, "malformed frame: {}", e),
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        FrameError::Transport(e.into())
    }
}

impl From<FrameError> for FedError {
    fn from(e: FrameError) -> Self {
        FedError::msg(e)
    }
}

/// Length of the fixed frame header in bytes.
pub const HEADER_LEN: usize = 8;

/// Fixed 8-byte frame header, all multi-byte fields in network byte order:
///
/// ```text
///  0      2       3         4      5          6         8
///  | sid  | code  | modifier| hops | reserved | datalen |
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Requester-chosen stream ID echoed back in responses; 0 means the
    /// requester does not expect a reply.
    pub stream_id: u16,

    /// Request or response code.
    pub rr_code: u8,

    /// Verb-specific option bits.
    pub modifier: u8,

    /// Number of times this request has been forwarded.
    pub hops: u8,

    /// Payload length following the header.
    pub datalen: u16,
}

impl Header {
    /// Serializes the header into `buf`.
    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.stream_id);
        buf.put_u8(self.rr_code);
        buf.put_u8(self.modifier);
        buf.put_u8(self.hops);
        buf.put_u8(0);
        buf.put_u16(self.datalen);
    }

    /// Parses a header from exactly `HEADER_LEN` bytes.
    pub fn parse(mut raw: &[u8]) -> Result<Self, FedError> {
        if raw.len() < HEADER_LEN {
            return Err(FedError::msg(format!(
                "short frame header of {} bytes",
                raw.len()
            )));
        }
        let stream_id = raw.get_u16();
        let rr_code = raw.get_u8();
        let modifier = raw.get_u8();
        let hops = raw.get_u8();
        let reserved = raw.get_u8();
        let datalen = raw.get_u16();
        if reserved != 0 {
            return Err(FedError::msg(format!(
                "nonzero reserved header byte {:#x}",
                reserved
            )));
        }
        Ok(Header {
            stream_id,
            rr_code,
            modifier,
            hops,
            datalen,
        })
    }
}

/// One framed message: header plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub body: Bytes,
}

impl Frame {
    /// Composes a frame whose payload is the MessagePack encoding of `args`.
    pub fn new<T: Serialize>(
        code: RrCode,
        modifier: u8,
        stream_id: u16,
        args: &T,
    ) -> Result<Self, FedError> {
        let body = rmp_serde::to_vec(args)?;
        Self::with_body(code, modifier, stream_id, Bytes::from(body))
    }

    /// Composes a frame with an empty payload.
    pub fn bare(code: RrCode, modifier: u8, stream_id: u16) -> Self {
        Frame {
            header: Header {
                stream_id,
                rr_code: code as u8,
                modifier,
                hops: 0,
                datalen: 0,
            },
            body: Bytes::new(),
        }
    }

    /// Composes a frame around already-encoded payload bytes.
    pub fn with_body(
        code: RrCode,
        modifier: u8,
        stream_id: u16,
        body: Bytes,
    ) -> Result<Self, FedError> {
        let datalen = u16::try_from(body.len()).map_err(|_| {
            FedError::msg(format!("payload of {} bytes too large", body.len()))
        })?;
        Ok(Frame {
            header: Header {
                stream_id,
                rr_code: code as u8,
                modifier,
                hops: 0,
                datalen,
            },
            body,
        })
    }

    /// Returns the request/response code, if recognized.
    pub fn code(&self) -> Option<RrCode> {
        RrCode::try_from(self.header.rr_code).ok()
    }

    /// Decodes the payload as a verb argument struct.
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, FedError> {
        Ok(rmp_serde::from_slice(&self.body)?)
    }

    /// Returns a copy of this frame suitable for relaying one more hop, or
    /// `None` if the hop counter is exhausted. Relayed frames never carry a
    /// stream ID since the relaying node consumes any answers itself.
    pub fn relayed(&self) -> Option<Frame> {
        let hops = self.header.hops.checked_add(1)?;
        Some(Frame {
            header: Header {
                stream_id: 0,
                hops,
                ..self.header
            },
            body: self.body.clone(),
        })
    }

    /// Appends the wire representation of this frame to `buf`.
    pub fn encode_to(&self, buf: &mut BytesMut) {
        buf.reserve(HEADER_LEN + self.body.len());
        let header = Header {
            datalen: self.body.len() as u16,
            ..self.header
        };
        header.put(buf);
        buf.extend_from_slice(&self.body);
    }
}

/// Receives one frame from readable connection `conn_read`, using `read_buf`
/// as buffer storage for partial reads. Frames announcing more than
/// `max_payload` bytes are rejected as protocol violations.
///
/// CANCELLATION SAFETY: we cannot use `read_exact()` here because this
/// function is intended to be used as a `tokio::select!` branch. In the case
/// of being cancelled midway, bytes already read stay in the read buffer and
/// will continue to be appended by future invocations.
pub async fn read_frame<Conn>(
    read_buf: &mut BytesMut,
    conn_read: &mut Conn,
    max_payload: usize,
) -> Result<Frame, FrameError>
where
    Conn: AsyncReadExt + Unpin,
{
    // read the fixed header first
    while read_buf.len() < HEADER_LEN {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(FrameError::Transport(FedError::msg(
                "connection closed by peer",
            )));
        }
    }
    let header =
        Header::parse(&read_buf[..HEADER_LEN]).map_err(FrameError::Malformed)?;
    let datalen = header.datalen as usize;
    if datalen > max_payload {
        return Err(FrameError::Malformed(FedError::msg(format!(
            "oversized payload {} > {}",
            datalen, max_payload
        ))));
    }

    // then read the payload itself
    let frame_end = HEADER_LEN + datalen;
    if read_buf.capacity() < frame_end {
        read_buf.reserve(frame_end - read_buf.len());
    }
    while read_buf.len() < frame_end {
        if conn_read.read_buf(read_buf).await? == 0 {
            return Err(FrameError::Transport(FedError::msg(
                "connection closed mid-frame",
            )));
        }
    }

    // no more awaits ahead, so no further cancellation is possible; split
    // off the consumed bytes and keep any tail for the next call
    let mut raw = read_buf.split_to(frame_end);
    raw.advance(HEADER_LEN);
    Ok(Frame {
        header,
        body: raw.freeze(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PathArgs;

    #[test]
    fn header_layout() -> Result<(), FedError> {
        let header = Header {
            stream_id: 0x0102,
            rr_code: RrCode::Have as u8,
            modifier: 0x04,
            hops: 3,
            datalen: 0x0a0b,
        };
        let mut buf = BytesMut::new();
        header.put(&mut buf);
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..2], &[0x01, 0x02]);
        assert_eq!(&buf[6..], &[0x0a, 0x0b]);
        assert_eq!(Header::parse(&buf)?, header);
        Ok(())
    }

    #[test]
    fn header_reserved_nonzero() {
        let raw = [0u8, 1, 2, 3, 4, 9, 0, 0];
        assert!(Header::parse(&raw).is_err());
        assert!(Header::parse(&raw[..5]).is_err());
    }

    #[test]
    fn relayed_hop_limit() -> Result<(), FedError> {
        let mut frame = Frame::new(
            RrCode::Have,
            0,
            17,
            &PathArgs {
                path: "/data/a".into(),
            },
        )?;
        let relayed = frame.relayed().ok_or(FedError::msg("dropped"))?;
        assert_eq!(relayed.header.hops, 1);
        assert_eq!(relayed.header.stream_id, 0);
        frame.header.hops = u8::MAX;
        assert!(frame.relayed().is_none());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn read_split_frames() -> Result<(), FedError> {
        let first = Frame::new(
            RrCode::Gone,
            0,
            1,
            &PathArgs {
                path: "/x/y".into(),
            },
        )?;
        let second = Frame::bare(RrCode::Ping, 0, 2);
        let mut wire = BytesMut::new();
        first.encode_to(&mut wire);
        second.encode_to(&mut wire);

        let mut src: &[u8] = &wire;
        let mut read_buf = BytesMut::new();
        let got = read_frame(&mut read_buf, &mut src, 1024).await?;
        assert_eq!(got, first);
        assert_eq!(got.args::<PathArgs>()?.path, "/x/y");
        assert_eq!(read_frame(&mut read_buf, &mut src, 1024).await?, second);
        assert!(matches!(
            read_frame(&mut read_buf, &mut src, 1024).await,
            Err(FrameError::Transport(_))
        ));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn read_oversized_rejected() -> Result<(), FedError> {
        let frame = Frame::new(
            RrCode::Have,
            0,
            0,
            &PathArgs {
                path: "/a".repeat(100),
            },
        )?;
        let mut wire = BytesMut::new();
        frame.encode_to(&mut wire);
        let mut src: &[u8] = &wire;
        let mut read_buf = BytesMut::new();
        assert!(matches!(
            read_frame(&mut read_buf, &mut src, 16).await,
            Err(FrameError::Malformed(_))
        ));
        Ok(())
    }
}
