//! Framed codec for worker communication.
//!
//! One UTF-8 JSON value per line, newline-delimited - trivially
//! implementable by minimal-capability workers and inspectable with a
//! terminal. Works over any AsyncRead/AsyncWrite.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

/// Responses larger than this are a protocol violation, not a payload.
const MAX_LINE_BYTES: usize = 8 * 1024 * 1024;

/// Codec that frames messages as single lines and serializes with JSON.
///
/// Wraps LinesCodec and adds serde_json serialization. Blank lines on the
/// inbound side are skipped, matching what lenient workers emit.
pub struct JsonLineCodec<T> {
    inner: LinesCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            _phantom: PhantomData,
        }
    }
}

fn into_io_error(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        LinesCodecError::MaxLineLengthExceeded => {
            io::Error::new(io::ErrorKind::InvalidData, "response line exceeds size limit")
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode(src).map_err(into_io_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let item = serde_json::from_str(&line)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    return Ok(Some(item));
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.inner.decode_eof(src).map_err(into_io_error)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => {
                    let item = serde_json::from_str(&line)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                    return Ok(Some(item));
                }
                None => return Ok(None),
            }
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_string(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding line");
        self.inner.encode(json, dst).map_err(into_io_error)
    }
}
