use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, trace};

use crate::error::Parse;

use self::Kind::{Chunked, Length};

/// Maximum chunk size that can be expressed without overflowing while a
/// size digit is being shifted in.
const CHUNK_SIZE_CUTOFF: u64 = u64::MAX / 16;

/// Decoders to handle different Transfer-Encodings.
///
/// If a request body does not include a Transfer-Encoding, it *should*
/// include a Content-Length header.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Decoder {
    kind: Kind,
}

#[derive(Clone, Debug, PartialEq)]
enum Kind {
    /// A decoder for a Content-Length body; counts down to zero.
    Length(u64),
    /// A decoder for Transfer-Encoding: chunked.
    Chunked { state: ChunkedState, chunk_len: u64 },
}

#[derive(Debug, PartialEq, Clone, Copy)]
enum ChunkedState {
    Size,
    SizeLws,
    Extension,
    SizeLf,
    Body,
    BodyCr,
    BodyLf,
    Trailer,
    TrailerLf,
    EndCr,
    EndLf,
    End,
}

/// Outcome of a decode step.
#[derive(Debug, PartialEq)]
pub(crate) enum Decoded {
    /// A run of body bytes, consumed from the buffer.
    Data(Bytes),
    /// More bytes are needed before anything can be produced.
    Pending,
    /// The body is complete; no further data will be produced.
    Eof,
}

impl Decoder {
    pub(crate) fn length(len: u64) -> Decoder {
        Decoder {
            kind: Kind::Length(len),
        }
    }

    pub(crate) fn chunked() -> Decoder {
        Decoder {
            kind: Kind::Chunked {
                state: ChunkedState::Size,
                chunk_len: 0,
            },
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(
            self.kind,
            Length(0)
                | Chunked {
                    state: ChunkedState::End,
                    ..
                }
        )
    }

    /// Decodes the next run of body bytes out of `buf`.
    pub(crate) fn decode(&mut self, buf: &mut BytesMut) -> crate::Result<Decoded> {
        match self.kind {
            Length(ref mut remaining) => {
                if *remaining == 0 {
                    return Ok(Decoded::Eof);
                }
                if buf.is_empty() {
                    return Ok(Decoded::Pending);
                }
                let take = std::cmp::min(*remaining, buf.len() as u64) as usize;
                *remaining -= take as u64;
                trace!("sized read, {}B ({} left)", take, remaining);
                Ok(Decoded::Data(buf.split_to(take).freeze()))
            }
            Chunked {
                ref mut state,
                ref mut chunk_len,
            } => {
                loop {
                    if *state == ChunkedState::End {
                        return Ok(Decoded::Eof);
                    }
                    // Body bytes are split out in bulk; every other state
                    // consumes exactly one byte.
                    if *state == ChunkedState::Body {
                        if buf.is_empty() {
                            return Ok(Decoded::Pending);
                        }
                        let take = std::cmp::min(*chunk_len, buf.len() as u64) as usize;
                        *chunk_len -= take as u64;
                        if *chunk_len == 0 {
                            *state = ChunkedState::BodyCr;
                        }
                        trace!("chunked read, {}B", take);
                        return Ok(Decoded::Data(buf.split_to(take).freeze()));
                    }
                    if buf.is_empty() {
                        return Ok(Decoded::Pending);
                    }
                    let byte = buf[0];
                    buf.advance(1);
                    *state = step(*state, byte, chunk_len)?;
                }
            }
        }
    }
}

fn step(state: ChunkedState, byte: u8, chunk_len: &mut u64) -> crate::Result<ChunkedState> {
    use self::ChunkedState::*;

    macro_rules! expect {
        ($want:expr, $next:expr) => {
            if byte == $want {
                Ok($next)
            } else {
                debug!("chunked framing error in {:?}", state);
                Err(crate::Error::new_parse(Parse::Body))
            }
        };
    }

    match state {
        Size => match byte {
            b'0'..=b'9' => shift(chunk_len, (byte - b'0') as u64).map(|_| Size),
            b'a'..=b'f' => shift(chunk_len, (byte - b'a' + 10) as u64).map(|_| Size),
            b'A'..=b'F' => shift(chunk_len, (byte - b'A' + 10) as u64).map(|_| Size),
            b'\t' | b' ' => Ok(SizeLws),
            b';' => Ok(Extension),
            b'\r' => Ok(SizeLf),
            _ => {
                debug!("invalid chunk size byte: {:?}", byte);
                Err(crate::Error::new_parse(Parse::Body))
            }
        },
        SizeLws => match byte {
            b'\t' | b' ' => Ok(SizeLws),
            b';' => Ok(Extension),
            b'\r' => Ok(SizeLf),
            _ => Err(crate::Error::new_parse(Parse::Body)),
        },
        // Extension bytes are skipped until the size line ends.
        Extension => match byte {
            b'\r' => Ok(SizeLf),
            _ => Ok(Extension),
        },
        SizeLf => {
            if byte == b'\n' {
                if *chunk_len == 0 {
                    Ok(EndCr)
                } else {
                    Ok(Body)
                }
            } else {
                Err(crate::Error::new_parse(Parse::Body))
            }
        }
        Body => unreachable!("bulk state handled by decode"),
        BodyCr => expect!(b'\r', BodyLf),
        BodyLf => expect!(b'\n', Size),
        // Trailers are consumed and discarded, line by line.
        Trailer => match byte {
            b'\r' => Ok(TrailerLf),
            _ => Ok(Trailer),
        },
        TrailerLf => expect!(b'\n', EndCr),
        EndCr => match byte {
            b'\r' => Ok(EndLf),
            _ => Ok(Trailer),
        },
        EndLf => expect!(b'\n', End),
        End => unreachable!("terminal state handled by decode"),
    }
}

fn shift(chunk_len: &mut u64, digit: u64) -> crate::Result<()> {
    if *chunk_len > CHUNK_SIZE_CUTOFF {
        debug!("chunk size is too big");
        return Err(crate::Error::new_parse(Parse::Body));
    }
    *chunk_len = *chunk_len * 16 + digit;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(decoder: &mut Decoder, buf: &mut BytesMut) -> (Vec<u8>, bool) {
        let mut out = Vec::new();
        loop {
            match decoder.decode(buf).expect("decode") {
                Decoded::Data(data) => out.extend_from_slice(&data),
                Decoded::Pending => return (out, false),
                Decoded::Eof => return (out, true),
            }
        }
    }

    #[test]
    fn length_counts_down() {
        let mut decoder = Decoder::length(5);
        let mut buf = BytesMut::from(&b"hello world"[..]);
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"hello");
        assert!(eof);
        assert!(decoder.is_eof());
        // The bytes after the body stay in the buffer.
        assert_eq!(&buf[..], b" world");
    }

    #[test]
    fn length_across_split_buffers() {
        let mut decoder = Decoder::length(10);
        let mut buf = BytesMut::from(&b"hello"[..]);
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"hello");
        assert!(!eof);
        buf.extend_from_slice(b" you!");
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b" you!");
        assert!(eof);
    }

    #[test]
    fn zero_length_is_immediately_eof() {
        let mut decoder = Decoder::length(0);
        let mut buf = BytesMut::new();
        assert_eq!(decoder.decode(&mut buf).unwrap(), Decoded::Eof);
    }

    #[test]
    fn chunked_simple() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"5\r\nhello\r\n7\r\n world!\r\n0\r\n\r\n"[..]);
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"hello world!");
        assert!(eof);
    }

    #[test]
    fn chunked_with_extensions_and_trailers() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(
            &b"4;name=value\r\nwiki\r\n0\r\nExpires: never\r\nX-Foo: bar\r\n\r\n"[..],
        );
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"wiki");
        assert!(eof);
        assert!(buf.is_empty());
    }

    #[test]
    fn chunked_across_split_buffers() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"b\r\nhel"[..]);
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"hel");
        assert!(!eof);
        buf.extend_from_slice(b"lo world\r\n0\r\n\r\n");
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"lo world");
        assert!(eof);
    }

    #[test]
    fn chunked_uppercase_hex_size() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"A\r\n0123456789\r\n0\r\n\r\n"[..]);
        let (out, eof) = drain(&mut decoder, &mut buf);
        assert_eq!(out, b"0123456789");
        assert!(eof);
    }

    #[test]
    fn chunked_invalid_size_errors() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"zz\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }

    #[test]
    fn chunk_size_overflow_errors() {
        let mut decoder = Decoder::chunked();
        let mut buf = BytesMut::from(&b"ffffffffffffffffff\r\n"[..]);
        assert!(decoder.decode(&mut buf).is_err());
    }
}
