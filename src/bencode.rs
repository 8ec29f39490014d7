//! Bencode-lite reading and writing.
//!
//! The DHT wire format is a restricted bencode dictionary. Rather than
//! building a generic value tree, the codec walks the datagram with a
//! [`Reader`] and dispatches on key bytes directly, and writes replies
//! through a [`Writer`] into a fixed-capacity, caller-supplied buffer.
//!
//! # Data Types
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:spam` → "spam" |
//! | List | `l<items>e` | `l4:spami42ee` |
//! | Dictionary | `d<key><value>...e` | `d3:foo3:bare` |
//!
//! # Examples
//!
//! ```
//! use swarmdht::bencode::{Reader, Writer};
//!
//! let mut buf = [0u8; 32];
//! let mut writer = Writer::new(&mut buf);
//! writer.begin_dict().unwrap();
//! writer.put_key_bytes(b"id", b"spam").unwrap();
//! writer.put_key_integer(b"port", 6881).unwrap();
//! writer.end().unwrap();
//! let len = writer.position();
//! assert_eq!(&buf[..len], b"d2:id4:spam4:porti6881ee");
//!
//! let mut reader = Reader::new(&buf[..len]);
//! reader.expect(b'd').unwrap();
//! assert_eq!(reader.read_bytes().unwrap(), b"id");
//! assert_eq!(reader.read_bytes().unwrap(), b"spam");
//! assert_eq!(reader.read_bytes().unwrap(), b"port");
//! assert_eq!(reader.read_integer().unwrap(), 6881);
//! ```
//!
//! # Error Handling
//!
//! Reading never indexes past the input and never recurses:
//!
//! - [`BencodeError::UnexpectedEof`] - A length prefix or token ran past the input
//! - [`BencodeError::InvalidInteger`] - Malformed integer (e.g., leading zeros)
//! - [`BencodeError::InvalidStringLength`] - Malformed or oversized length prefix
//! - [`BencodeError::UnexpectedChar`] - Unexpected character in input
//! - [`BencodeError::NestingRefused`] - A list or dict where only scalars are allowed
//! - [`BencodeError::BufferTooSmall`] - The output buffer cannot hold the message

mod error;
mod reader;
mod writer;

pub use error::BencodeError;
pub use reader::Reader;
pub use writer::Writer;

#[cfg(test)]
mod tests;
