pub(crate) mod conn;
mod date;
mod decode;
mod encode;
mod parse;

pub(crate) use self::conn::Connection;
pub(crate) use self::decode::{Decoded, Decoder};
pub(crate) use self::encode::{encode_head, Encoder};
pub(crate) use self::parse::{parse_head, ParseStatus};
