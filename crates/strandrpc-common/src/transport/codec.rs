//! Incremental JSON Frame Codec
//!
//! Messages arrive as byte chunks of arbitrary, non-aligned size: one JSON
//! value may span many chunks, and one chunk may hold zero, one, or many
//! complete values. There is no length prefix — a message ends exactly where
//! its JSON structure closes. [`JsonFrameDecoder`] tracks a rolling buffer
//! and extracts every complete top-level value in arrival order, exactly
//! once each; [`MessageReader`] drives a decoder from an async byte stream
//! and can surrender the stream (plus any residual buffered bytes) for raw
//! binary takeover after the JSON phase of a call.
//!
//! The decoder performs no semantic validation of message shape; that is
//! the envelope layer's job. It only guarantees syntactically valid JSON
//! values, with no loss or duplication across chunk boundaries.

use std::collections::VecDeque;
use std::io::Cursor;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::protocol::envelope::WireMessage;
use crate::protocol::error::{Result, RpcError};

/// Default cap on the re-assembly buffer (10 MB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Read granularity for [`MessageReader`]
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Encodes one protocol message to its wire bytes.
///
/// No delimiter is appended; the value's own structural closure delimits it.
pub fn encode_message(message: &WireMessage) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

/// Encodes and writes one protocol message, flushing the stream.
///
/// # Errors
///
/// Write failures surface as [`RpcError::OutputStream`]: the outgoing side
/// of the channel failed or was closed by its consumer.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &WireMessage,
) -> Result<()> {
    let bytes = encode_message(message)?;
    writer
        .write_all(&bytes)
        .await
        .map_err(|e| RpcError::OutputStream(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| RpcError::OutputStream(e.to_string()))?;
    Ok(())
}

/// Incremental decoder turning arbitrary byte chunks into parsed JSON
/// values.
///
/// Feed chunks with [`feed`](Self::feed), pull completed values with
/// [`next`](Self::next). Once the decoder fails — malformed JSON, or the
/// buffer exceeding its cap before a value completes — the failure is
/// yielded once (after any values that completed before it) and the decoder
/// produces nothing further.
pub struct JsonFrameDecoder {
    buf: Vec<u8>,
    ready: VecDeque<Value>,
    error: Option<RpcError>,
    poisoned: bool,
    max_size: usize,
}

impl JsonFrameDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            ready: VecDeque::new(),
            error: None,
            poisoned: false,
            max_size,
        }
    }

    /// Appends a chunk and extracts every value it completes.
    pub fn feed(&mut self, chunk: &[u8]) {
        if self.poisoned {
            return;
        }
        self.buf.extend_from_slice(chunk);

        let mut consumed = 0;
        {
            let mut values = serde_json::Deserializer::from_slice(&self.buf).into_iter::<Value>();
            loop {
                match values.next() {
                    Some(Ok(value)) => {
                        self.ready.push_back(value);
                        consumed = values.byte_offset();
                    }
                    Some(Err(e)) if e.is_eof() => break,
                    Some(Err(e)) => {
                        self.error = Some(RpcError::Parse(format!("malformed message: {}", e)));
                        self.poisoned = true;
                        break;
                    }
                    None => {
                        consumed = values.byte_offset();
                        break;
                    }
                }
            }
        }
        self.buf.drain(..consumed);

        // The unterminated remainder is what counts against the cap: once a
        // value completes it leaves the buffer.
        if !self.poisoned && self.buf.len() > self.max_size {
            self.error = Some(RpcError::MessageLength {
                size: self.buf.len(),
                limit: self.max_size,
            });
            self.poisoned = true;
        }
    }

    /// Next completed value, or the terminal failure, or `None` when more
    /// bytes are needed.
    pub fn next(&mut self) -> Option<Result<Value>> {
        if let Some(value) = self.ready.pop_front() {
            return Some(Ok(value));
        }
        self.error.take().map(Err)
    }

    /// Bytes currently held in the re-assembly buffer.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether the decoder has failed and will produce nothing further.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Surrenders the buffered bytes, e.g. for raw binary takeover.
    pub fn take_residual(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Pulls protocol messages out of an async byte stream.
///
/// Wraps a [`JsonFrameDecoder`] around any readable channel end. After the
/// JSON phase of a call, [`into_raw`](Self::into_raw) returns a reader that
/// replays the decoder's residual bytes before continuing with the
/// underlying stream — nothing is lost when a call switches to opaque
/// binary traffic.
pub struct MessageReader<R> {
    reader: R,
    decoder: JsonFrameDecoder,
    eof: bool,
    finished: bool,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, max_size: usize) -> Self {
        Self {
            reader,
            decoder: JsonFrameDecoder::new(max_size),
            eof: false,
            finished: false,
        }
    }

    /// Next parsed message in arrival order.
    ///
    /// Returns `None` on clean end of stream; a decode failure is yielded
    /// once and ends the sequence.
    pub async fn next_message(&mut self) -> Option<Result<Value>> {
        loop {
            if self.finished {
                return None;
            }
            if let Some(item) = self.decoder.next() {
                if item.is_err() {
                    self.finished = true;
                }
                return Some(item);
            }
            if self.eof {
                self.finished = true;
                if self.decoder.buffered() > 0 {
                    return Some(Err(RpcError::Parse(
                        "stream ended inside a JSON value".into(),
                    )));
                }
                return None;
            }

            let mut chunk = [0u8; READ_CHUNK_SIZE];
            match self.reader.read(&mut chunk).await {
                Ok(0) => self.eof = true,
                Ok(n) => self.decoder.feed(&chunk[..n]),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e.into()));
                }
            }
        }
    }

    /// Hands the byte stream back for raw traffic, replaying any bytes the
    /// decoder had buffered past the last parsed message.
    pub fn into_raw(mut self) -> tokio::io::Chain<Cursor<Vec<u8>>, R> {
        let residual = self.decoder.take_residual();
        Cursor::new(residual).chain(self.reader)
    }
}
