//! Whitespace-delimited JSON framing for the SPDK RPC socket.
//!
//! SPDK's JSON parser accepts adjacent top-level objects on one stream, so no
//! length prefix is needed. Requests go out as one object followed by a
//! newline; responses are decoded incrementally from whatever bytes have
//! arrived so far.
//!
//! # Wire Format
//!
//! ```text
//! {"jsonrpc":"2.0","method":<name>[,"params":<value>],"id":<u64>}\n
//! {"id":<u64>,"result":<value>}
//! {"id":<u64>,"error":{"code":<int>,"message":<string>}}
//! ```
//!
//! The `jsonrpc` member of a response is never checked; SPDK does not always
//! echo it.

use std::io;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, trace};

use crate::ipc::client::RpcError;

/// Protocol version stamped on every outgoing request.
pub const JSONRPC_VERSION: &str = "2.0";

/// Maximum buffered envelope size (100MB) to prevent OOM from a runaway peer.
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Bytes requested from the socket per read.
const READ_CHUNK: usize = 8 * 1024;

/// Outgoing request envelope.
///
/// Member order matches what SPDK's own `rpc.py` emits.
#[derive(Debug, Serialize)]
struct Request<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a RawValue>,
    id: u64,
}

/// A decoded response whose `result` has not been interpreted yet.
///
/// The header (`id`, `error`) is inspected by the reader task; the raw
/// `result` stays undecoded until the waiting caller picks a concrete type.
#[derive(Debug, Deserialize)]
pub struct ResponseEnvelope {
    /// Id of the request this answers.
    pub id: u64,
    /// Raw success payload. JSON `null` is treated as absent.
    #[serde(default)]
    pub result: Option<Box<RawValue>>,
    /// Failure payload, in whatever shape SPDK chose.
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// Serialize one request envelope, newline included.
///
/// `params` of `None` leaves the member off the wire; a caller who wants an
/// explicit `null` passes `Some` of a raw `null`.
pub fn encode_request(
    id: u64,
    method: &str,
    params: Option<&RawValue>,
) -> Result<Vec<u8>, RpcError> {
    let request = Request {
        jsonrpc: JSONRPC_VERSION,
        method,
        params,
        id,
    };
    let mut bytes = serde_json::to_vec(&request).map_err(RpcError::Encode)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Write one request envelope to the stream and flush it.
///
/// Callers must hold exclusive access to the writer for the whole call so
/// that concurrent requests never interleave.
pub async fn write_request<W>(
    writer: &mut W,
    id: u64,
    method: &str,
    params: Option<&RawValue>,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_request(id, method, params)?;
    trace!(data = %String::from_utf8_lossy(&bytes).trim_end(), "write");

    let result = async {
        writer.write_all(&bytes).await?;
        writer.flush().await
    }
    .await;

    result.map_err(|e| {
        error!(error = %e, id, method, "write error");
        RpcError::Transport(Arc::new(e))
    })
}

/// Decode a call's raw result into the type the caller asked for.
///
/// Pass [`serde::de::IgnoredAny`] as `T` to discard the body.
pub fn decode_body<T: DeserializeOwned>(method: &str, body: &RawValue) -> Result<T, RpcError> {
    serde_json::from_str(body.get()).map_err(|source| RpcError::Decode {
        method: method.to_string(),
        source,
    })
}

/// Whether a read error just means the peer (or we) went away.
///
/// These are logged at debug level; anything else is a real fault.
pub fn is_connection_closed(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Incremental decoder for response envelopes.
pub struct ResponseReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> ResponseReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
        }
    }

    /// Read the next complete response envelope.
    ///
    /// Returns `Ok(None)` on a clean end of stream (no partial envelope
    /// buffered).
    ///
    /// # Errors
    ///
    /// - `RpcError::Transport` if the read fails or the stream ends in the
    ///   middle of an envelope
    /// - `RpcError::Protocol` if the bytes are not a response envelope or the
    ///   envelope exceeds MAX_MESSAGE_SIZE (100MB)
    pub async fn read_response(&mut self) -> Result<Option<ResponseEnvelope>, RpcError> {
        loop {
            if let Some(envelope) = self.try_decode()? {
                return Ok(Some(envelope));
            }

            if self.buf.len() > MAX_MESSAGE_SIZE {
                return Err(RpcError::Protocol(format!(
                    "response exceeds maximum {} bytes",
                    MAX_MESSAGE_SIZE
                )));
            }

            let before = self.buf.len();
            self.buf.reserve(READ_CHUNK);
            let n = match self.inner.read_buf(&mut self.buf).await {
                Ok(n) => n,
                Err(e) => {
                    if is_connection_closed(&e) {
                        debug!(error = %e, "read");
                    } else {
                        error!(error = %e, "read");
                    }
                    return Err(RpcError::Transport(Arc::new(e)));
                }
            };

            if n == 0 {
                if self.buf.iter().all(u8::is_ascii_whitespace) {
                    return Ok(None);
                }
                debug!(buffered = self.buf.len(), "connection closed mid-envelope");
                return Err(RpcError::Transport(Arc::new(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed in the middle of a response",
                ))));
            }

            trace!(data = %String::from_utf8_lossy(&self.buf[before..]), "read");
        }
    }

    /// Try to pull one envelope out of the buffer without reading.
    fn try_decode(&mut self) -> Result<Option<ResponseEnvelope>, RpcError> {
        let Some(start) = self.buf.iter().position(|b| !b.is_ascii_whitespace()) else {
            self.buf.clear();
            return Ok(None);
        };

        let (next, offset) = {
            let mut stream = serde_json::Deserializer::from_slice(&self.buf[start..])
                .into_iter::<ResponseEnvelope>();
            let next = stream.next();
            (next, stream.byte_offset())
        };

        match next {
            Some(Ok(envelope)) => {
                self.buf.drain(..start + offset);
                Ok(Some(envelope))
            }
            // Incomplete object; wait for more bytes.
            Some(Err(e)) if e.is_eof() => Ok(None),
            Some(Err(e)) => Err(RpcError::Protocol(format!("malformed response: {e}"))),
            None => Ok(None),
        }
    }
}
