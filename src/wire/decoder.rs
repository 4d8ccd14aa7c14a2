use std::{error, fmt, io};

use bytes::Buf;
use tokio_util::codec;

use super::protocol::Request;

/// Maximum accepted length for either the pool name or the query string,
/// guarding against a misbehaving client claiming an absurd length and
/// stalling the connection forever waiting for bytes that never arrive.
const MAX_STRING_LEN: usize = 16 * 1024 * 1024;

/// Parses the two length-prefixed strings a connection sends before any
/// processing starts: pool name, then query. An explicit enum of parse
/// states carries partial progress across reads instead of a scratch
/// buffer of flags, so a slow client trickling in one byte at a time never
/// loses its place.
#[derive(Debug, Default)]
pub enum Decoder {
    #[default]
    PoolLen,
    PoolBody {
        len: usize,
    },
    QueryLen {
        pool: String,
    },
    QueryBody {
        pool: String,
        len: usize,
    },
    /// A request has already been decoded; any further bytes on this
    /// connection are a protocol violation, since exactly one request is
    /// expected per connection.
    Done,
}

impl codec::Decoder for Decoder {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            let state = std::mem::take(self);
            match state {
                Decoder::PoolLen => {
                    if src.len() < 4 {
                        *self = Decoder::PoolLen;
                        return Ok(None);
                    }
                    let len = src.get_i32_le();
                    let len = validate_len(len)?;
                    *self = Decoder::PoolBody { len };
                },
                Decoder::PoolBody { len } => {
                    if src.len() < len {
                        *self = Decoder::PoolBody { len };
                        return Ok(None);
                    }
                    let pool = read_utf8(src, len)?;
                    *self = Decoder::QueryLen { pool };
                },
                Decoder::QueryLen { pool } => {
                    if src.len() < 4 {
                        *self = Decoder::QueryLen { pool };
                        return Ok(None);
                    }
                    let len = src.get_i32_le();
                    let len = validate_len(len)?;
                    *self = Decoder::QueryBody { pool, len };
                },
                Decoder::QueryBody { pool, len } => {
                    if src.len() < len {
                        *self = Decoder::QueryBody { pool, len };
                        return Ok(None);
                    }
                    let query = read_utf8(src, len)?;
                    *self = Decoder::Done;
                    return Ok(Some(Request { pool, query }));
                },
                Decoder::Done => {
                    *self = Decoder::Done;
                    if src.is_empty() {
                        return Ok(None);
                    }
                    return Err(Error::UnexpectedTrailingData);
                },
            }
        }
    }
}

fn validate_len(len: i32) -> Result<usize, Error> {
    if len < 0 || len as usize > MAX_STRING_LEN {
        return Err(Error::InvalidLength(len));
    }
    Ok(len as usize)
}

fn read_utf8(src: &mut bytes::BytesMut, len: usize) -> Result<String, Error> {
    let chunk = src.split_to(len);
    String::from_utf8(chunk.to_vec()).map_err(|_| Error::NotUtf8)
}

#[derive(Debug)]
pub enum Error {
    InvalidLength(i32),
    NotUtf8,
    UnexpectedTrailingData,
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidLength(len) => write!(f, "invalid frame length {len}"),
            Error::NotUtf8 => write!(f, "frame was not valid utf-8"),
            Error::UnexpectedTrailingData => write!(f, "client sent data after its request"),
            Error::IO(e) => write!(f, "{e}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn framed_string(s: &str) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_i32_le(s.len() as i32);
        buf.put_slice(s.as_bytes());
        buf
    }

    #[test]
    fn decodes_pool_then_query_in_one_shot() {
        let mut src = framed_string("main");
        src.extend_from_slice(&framed_string("SELECT 1"));
        let mut decoder = Decoder::default();
        let req = codec::Decoder::decode(&mut decoder, &mut src).unwrap().unwrap();
        assert_eq!(req.pool, "main");
        assert_eq!(req.query, "SELECT 1");
    }

    #[test]
    fn decodes_across_partial_reads() {
        let mut full = framed_string("main");
        full.extend_from_slice(&framed_string("SELECT 1"));
        let mut decoder = Decoder::default();
        let mut src = BytesMut::new();
        let mut result = None;
        for byte in full.to_vec() {
            src.put_u8(byte);
            result = codec::Decoder::decode(&mut decoder, &mut src).unwrap();
        }
        let req = result.unwrap();
        assert_eq!(req.pool, "main");
        assert_eq!(req.query, "SELECT 1");
    }

    #[test]
    fn rejects_negative_length() {
        let mut src = BytesMut::new();
        src.put_i32_le(-1);
        let mut decoder = Decoder::default();
        assert!(codec::Decoder::decode(&mut decoder, &mut src).is_err());
    }

    #[test]
    fn rejects_trailing_data_after_request() {
        let mut src = framed_string("main");
        src.extend_from_slice(&framed_string("SELECT 1"));
        src.put_u8(0);
        let mut decoder = Decoder::default();
        assert!(codec::Decoder::decode(&mut decoder, &mut src).unwrap().is_some());
        assert!(codec::Decoder::decode(&mut decoder, &mut src).is_err());
    }
}
