//! The ebusd command protocol.
//!
//! Requests are single CRLF-terminated lines. ebusd answers each of them with one or more lines
//! followed by an empty line. Only the first line of a response carries anything of interest:
//! either an error (`ERR: …`) or, for verbose reads, `circuit message name=value;name=value;…`.
use std::fmt;

use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

/// Prefix of the line ebusd responds with when a command fails.
pub const ERROR_PREFIX: &str = "ERR: ";

/// Discard buffered data once this many bytes have piled up without a complete response.
pub const MAX_RESPONSE_LENGTH: usize = 100_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Read {
        circuit: String,
        message: String,
        /// Bypass ebusd's cache and read from the bus.
        force: bool,
    },
    Write {
        circuit: String,
        message: String,
        value: String,
    },
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::Read { circuit, message, force: true } => {
                write!(f, "read -f -v -c {circuit} {message}")
            }
            Request::Read { circuit, message, force: false } => {
                write!(f, "read -v -c {circuit} {message}")
            }
            Request::Write { circuit, message, value } => {
                write!(f, "write -c {circuit} {message} {value}")
            }
        }
    }
}

/// A complete response, i.e. everything up to the terminating empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response(pub String);

impl Response {
    pub fn first_line(&self) -> &str {
        self.0.lines().next().unwrap_or_default().trim_end()
    }

    /// The error ebusd reported, if any.
    pub fn error(&self) -> Option<&str> {
        self.first_line().strip_prefix(ERROR_PREFIX)
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("response line `{0}` is not of the form `circuit message fields`")]
    Shape(String),
    #[error("field `{0}` has no `=` separator")]
    MissingSeparator(String),
    #[error("expected {expected} fields but response has {actual}")]
    FieldCount { expected: usize, actual: usize },
}

/// A decoded verbose read line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadLine<'a> {
    pub circuit: &'a str,
    pub message: &'a str,
    /// Field values, in order, without their names.
    pub values: Vec<&'a str>,
}

/// Split the first line of a read response into its circuit, message and field values.
pub fn parse_read_line(line: &str) -> Result<ReadLine<'_>, ParseError> {
    let mut parts = line.splitn(3, ' ');
    let (Some(circuit), Some(message), Some(fields)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::Shape(line.to_string()));
    };
    let values = fields
        .split(';')
        .map(|field| match field.split_once('=') {
            Some((_, value)) => Ok(value),
            None => Err(ParseError::MissingSeparator(field.to_string())),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ReadLine { circuit, message, values })
}

impl ReadLine<'_> {
    pub fn expect_fields(&self, expected: usize) -> Result<(), ParseError> {
        match self.values.len() {
            actual if actual == expected => Ok(()),
            actual => Err(ParseError::FieldCount { expected, actual }),
        }
    }
}

#[derive(Debug, Default)]
pub struct EbusdCodec {}

impl Encoder<Request> for EbusdCodec {
    type Error = std::io::Error;
    fn encode(&mut self, req: Request, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = format!("{req}\r\n");
        dst.extend_from_slice(line.as_bytes());
        trace!(message = "sending encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for EbusdCodec {
    type Item = Response;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        trace!(message = "attempt at decoding", buffer = ?src);
        let terminator = src
            .windows(2)
            .position(|w| w == b"\n\n")
            .map(|at| (at, 2))
            .into_iter()
            .chain(src.windows(3).position(|w| w == b"\n\r\n").map(|at| (at, 3)))
            .min_by_key(|(at, _)| *at);
        let Some((at, length)) = terminator else {
            if src.len() > MAX_RESPONSE_LENGTH {
                warn!(
                    message = "discarding an overlong response without terminator",
                    length = src.len()
                );
                src.clear();
            }
            return Ok(None);
        };
        let body = String::from_utf8_lossy(&src[..at + 1]).into_owned();
        src.advance(at + length);
        Ok(Some(Response(body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_lines() {
        let read = Request::Read { circuit: "f47".into(), message: "OutsideTemp".into(), force: false };
        assert_eq!(read.to_string(), "read -v -c f47 OutsideTemp");
        let read = Request::Read { circuit: "f47".into(), message: "OutsideTemp".into(), force: true };
        assert_eq!(read.to_string(), "read -f -v -c f47 OutsideTemp");
        let write =
            Request::Write { circuit: "f47".into(), message: "Hc1DayTemp".into(), value: "21".into() };
        let mut buffer = BytesMut::new();
        EbusdCodec {}.encode(write, &mut buffer).unwrap();
        assert_eq!(&buffer[..], b"write -c f47 Hc1DayTemp 21\r\n");
    }

    #[test]
    fn decode_responses() {
        let mut codec = EbusdCodec {};
        let mut buffer = BytesMut::from(&b"f47 OutsideTemp temp=9.56;sensor=ok\n"[..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        buffer.extend_from_slice(b"\nERR: element not found\r\n\r\ndone\n");
        let first = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(first.first_line(), "f47 OutsideTemp temp=9.56;sensor=ok");
        assert_eq!(first.error(), None);
        let second = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(second.error(), Some("element not found"));
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert_eq!(&buffer[..], b"done\n");
    }

    #[test]
    fn discard_overlong_responses() {
        let mut codec = EbusdCodec {};
        let mut buffer = BytesMut::from(&vec![b'x'; MAX_RESPONSE_LENGTH + 1][..]);
        assert_eq!(codec.decode(&mut buffer).unwrap(), None);
        assert!(buffer.is_empty());
    }

    #[test]
    fn read_lines() {
        let line = parse_read_line("f47 OutsideTemp temp=9.56;sensor=ok").unwrap();
        assert_eq!((line.circuit, line.message), ("f47", "OutsideTemp"));
        assert_eq!(line.values, ["9.56", "ok"]);
        assert_eq!(line.expect_fields(2), Ok(()));
        assert_eq!(line.expect_fields(3), Err(ParseError::FieldCount { expected: 3, actual: 2 }));
        let line = parse_read_line("bai Status value=a=b").unwrap();
        assert_eq!(line.values, ["a=b"]);
        assert!(matches!(
            parse_read_line("f47 OutsideTemp 9.56;sensor=ok"),
            Err(ParseError::MissingSeparator(f)) if f == "9.56"
        ));
        assert!(matches!(parse_read_line("done"), Err(ParseError::Shape(_))));
    }
}
