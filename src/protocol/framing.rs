use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, StreamerError};

/// Protocol 3.0.
pub const PROTOCOL_VERSION: i32 = 196_608;
const SSL_REQUEST_CODE: i32 = 80_877_103;
/// Upper bound on a single backend message; anything larger is a framing bug.
const MAX_MESSAGE_LEN: usize = 1 << 30;

#[derive(Debug, Clone)]
pub struct BackendMessage {
    pub tag: u8,
    pub payload: Bytes, // payload excludes the 4-byte length field
}

/// Buffered backend message reader.
///
/// [`MessageReader::read`] is cancel safe: bytes already pulled off the socket
/// stay in the buffer when the future is dropped, so a receive deadline can
/// wrap it without desynchronizing the stream.
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: BytesMut,
}

impl MessageReader {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Split one complete message off the buffer, if present.
    pub fn try_parse(&mut self) -> Result<Option<BackendMessage>> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let tag = self.buf[0];
        let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
        if len < 4 || len as usize > MAX_MESSAGE_LEN {
            return Err(StreamerError::Protocol(format!(
                "invalid backend message length: {len}"
            )));
        }
        let total = 1 + len as usize;
        if self.buf.len() < total {
            self.buf.reserve(total - self.buf.len());
            return Ok(None);
        }
        let mut frame = self.buf.split_to(total);
        frame.advance(5);
        Ok(Some(BackendMessage {
            tag,
            payload: frame.freeze(),
        }))
    }

    pub async fn read<R: AsyncRead + Unpin>(&mut self, rd: &mut R) -> Result<BackendMessage> {
        loop {
            if let Some(msg) = self.try_parse()? {
                return Ok(msg);
            }
            let n = rd.read_buf(&mut self.buf).await?;
            if n == 0 {
                return Err(StreamerError::Io("connection closed by server".into()));
            }
        }
    }

    /// Bytes that arrived before a TLS upgrade; must be empty at that point.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Frame a tagged frontend message.
pub fn encode_message(tag: u8, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 5);
    buf.put_u8(tag);
    buf.put_i32((payload.len() + 4) as i32);
    buf.extend_from_slice(payload);
    buf
}

async fn send<W: AsyncWrite + Unpin>(wr: &mut W, buf: &[u8]) -> Result<()> {
    wr.write_all(buf).await?;
    wr.flush().await?;
    Ok(())
}

pub async fn write_ssl_request<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_i32(8);
    buf.put_i32(SSL_REQUEST_CODE);
    send(wr, &buf).await
}

pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    params: &[(&str, &str)],
) -> Result<()> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_i32(0); // length placeholder
    buf.put_i32(PROTOCOL_VERSION);

    for (k, v) in params {
        put_cstr(&mut buf, k);
        put_cstr(&mut buf, v);
    }
    buf.put_u8(0); // terminator

    let len = buf.len() as i32;
    buf[0..4].copy_from_slice(&len.to_be_bytes());
    send(wr, &buf).await
}

pub async fn write_query<W: AsyncWrite + Unpin>(wr: &mut W, sql: &str) -> Result<()> {
    let mut payload = BytesMut::with_capacity(sql.len() + 1);
    put_cstr(&mut payload, sql);
    send(wr, &encode_message(b'Q', &payload)).await
}

pub async fn write_password_message<W: AsyncWrite + Unpin>(
    wr: &mut W,
    payload: &[u8],
) -> Result<()> {
    send(wr, &encode_message(b'p', payload)).await
}

pub async fn write_copy_data<W: AsyncWrite + Unpin>(wr: &mut W, payload: &[u8]) -> Result<()> {
    send(wr, &encode_message(b'd', payload)).await
}

pub async fn write_copy_done<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    send(wr, &encode_message(b'c', &[])).await
}

pub async fn write_terminate<W: AsyncWrite + Unpin>(wr: &mut W) -> Result<()> {
    send(wr, &encode_message(b'X', &[])).await
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.put_u8(0);
}
