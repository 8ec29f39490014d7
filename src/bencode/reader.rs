use super::error::BencodeError;
use crate::constants::MAX_LENGTH_DIGITS;

/// Longest integer we parse ("-9223372036854775808").
const MAX_INTEGER_DIGITS: usize = 20;

/// A bounded cursor over one datagram.
///
/// Every read checks the remaining length first; a length prefix that points
/// past the end of the buffer is reported as [`BencodeError::UnexpectedEof`]
/// without touching the bytes beyond it.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    /// Consumes `byte` or fails without advancing.
    pub fn expect(&mut self, byte: u8) -> Result<(), BencodeError> {
        match self.peek() {
            Some(b) if b == byte => {
                self.pos += 1;
                Ok(())
            }
            Some(b) => Err(BencodeError::UnexpectedChar(b as char)),
            None => Err(BencodeError::UnexpectedEof),
        }
    }

    /// Returns true (and consumes it) if the next byte closes a container.
    pub fn end_of_container(&mut self) -> Result<bool, BencodeError> {
        match self.peek() {
            Some(b'e') => {
                self.pos += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BencodeError::UnexpectedEof),
        }
    }

    /// Reads a `<len>:<data>` byte string, borrowing from the input.
    pub fn read_bytes(&mut self) -> Result<&'a [u8], BencodeError> {
        let len = self.read_length()?;

        if len > self.remaining() {
            return Err(BencodeError::UnexpectedEof);
        }

        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// Reads a byte string that must be exactly `N` bytes long.
    pub fn read_fixed<const N: usize>(&mut self) -> Result<[u8; N], BencodeError> {
        let bytes = self.read_bytes()?;
        if bytes.len() != N {
            return Err(BencodeError::InvalidStringLength);
        }
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    fn read_length(&mut self) -> Result<usize, BencodeError> {
        let start = self.pos;
        let mut len = 0usize;

        loop {
            match self.peek() {
                Some(b':') => break,
                Some(c @ b'0'..=b'9') => {
                    if self.pos - start >= MAX_LENGTH_DIGITS {
                        return Err(BencodeError::InvalidStringLength);
                    }
                    len = len * 10 + (c - b'0') as usize;
                    self.pos += 1;
                }
                Some(c) => return Err(BencodeError::UnexpectedChar(c as char)),
                None => return Err(BencodeError::UnexpectedEof),
            }
        }

        let digits = self.pos - start;
        if digits == 0 || (digits > 1 && self.data[start] == b'0') {
            return Err(BencodeError::InvalidStringLength);
        }

        self.pos += 1;
        Ok(len)
    }

    /// Reads an `i<number>e` integer.
    pub fn read_integer(&mut self) -> Result<i64, BencodeError> {
        self.expect(b'i')?;

        let negative = self.peek() == Some(b'-');
        if negative {
            self.pos += 1;
        }

        let start = self.pos;
        let mut value: i64 = 0;

        loop {
            match self.peek() {
                Some(b'e') => break,
                Some(c @ b'0'..=b'9') => {
                    if self.pos - start >= MAX_INTEGER_DIGITS {
                        return Err(BencodeError::InvalidInteger);
                    }
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add((c - b'0') as i64))
                        .ok_or(BencodeError::InvalidInteger)?;
                    self.pos += 1;
                }
                Some(_) => return Err(BencodeError::InvalidInteger),
                None => return Err(BencodeError::UnexpectedEof),
            }
        }

        let digits = self.pos - start;
        if digits == 0 {
            return Err(BencodeError::InvalidInteger);
        }
        if self.data[start] == b'0' && (digits > 1 || negative) {
            return Err(BencodeError::InvalidInteger);
        }

        self.pos += 1;
        Ok(if negative { -value } else { value })
    }

    /// Skips one string or integer value. Lists and dictionaries are refused.
    pub fn skip_scalar(&mut self) -> Result<(), BencodeError> {
        match self.peek() {
            Some(b'i') => self.read_integer().map(|_| ()),
            Some(b'0'..=b'9') => self.read_bytes().map(|_| ()),
            Some(b'l') | Some(b'd') => Err(BencodeError::NestingRefused),
            Some(c) => Err(BencodeError::UnexpectedChar(c as char)),
            None => Err(BencodeError::UnexpectedEof),
        }
    }

    /// Fails unless the whole input has been consumed.
    pub fn finish(&self) -> Result<(), BencodeError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(BencodeError::TrailingData)
        }
    }
}
