use std::{error, fmt, io};

use tokio_util::codec;

use super::protocol::Reply;

/// An encoder to produce a Squale response: a completed job's reply,
/// written exactly once per connection.
#[derive(Debug, Default)]
pub struct Encoder {}

impl codec::Encoder<Reply> for Encoder {
    type Error = Error;

    fn encode(&mut self, item: Reply, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        item.write_to(dst);
        Ok(())
    }
}

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
}

impl error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        Self::IO(value)
    }
}
