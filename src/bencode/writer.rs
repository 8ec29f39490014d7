use super::error::BencodeError;
use std::io::Write;

/// Writes bencode into a fixed-capacity buffer owned by the caller.
///
/// Nothing is ever allocated; when the buffer is full every call returns
/// [`BencodeError::BufferTooSmall`] and the partial output must be discarded.
/// Dictionary keys are written in the order the caller supplies them, so
/// callers that care about canonical form must supply them sorted.
pub struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn written(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    pub fn put_raw(&mut self, data: &[u8]) -> Result<(), BencodeError> {
        let end = self
            .pos
            .checked_add(data.len())
            .filter(|&end| end <= self.buf.len())
            .ok_or(BencodeError::BufferTooSmall)?;
        self.buf[self.pos..end].copy_from_slice(data);
        self.pos = end;
        Ok(())
    }

    fn put_decimal(&mut self, value: i64) -> Result<(), BencodeError> {
        let mut digits = [0u8; 20];
        let mut cursor = &mut digits[..];
        write!(cursor, "{}", value).map_err(|_| BencodeError::BufferTooSmall)?;
        let len = 20 - cursor.len();
        self.put_raw(&digits[..len])
    }

    /// Writes `<len>:<data>`.
    pub fn put_bytes(&mut self, data: &[u8]) -> Result<(), BencodeError> {
        self.put_decimal(data.len() as i64)?;
        self.put_raw(b":")?;
        self.put_raw(data)
    }

    /// Writes `i<value>e`.
    pub fn put_integer(&mut self, value: i64) -> Result<(), BencodeError> {
        self.put_raw(b"i")?;
        self.put_decimal(value)?;
        self.put_raw(b"e")
    }

    pub fn begin_dict(&mut self) -> Result<(), BencodeError> {
        self.put_raw(b"d")
    }

    pub fn begin_list(&mut self) -> Result<(), BencodeError> {
        self.put_raw(b"l")
    }

    pub fn end(&mut self) -> Result<(), BencodeError> {
        self.put_raw(b"e")
    }

    pub fn put_key(&mut self, key: &[u8]) -> Result<(), BencodeError> {
        self.put_bytes(key)
    }

    pub fn put_key_bytes(&mut self, key: &[u8], value: &[u8]) -> Result<(), BencodeError> {
        self.put_bytes(key)?;
        self.put_bytes(value)
    }

    pub fn put_key_integer(&mut self, key: &[u8], value: i64) -> Result<(), BencodeError> {
        self.put_bytes(key)?;
        self.put_integer(value)
    }

    /// Writes `<total>:` for a string whose body the caller emits next with
    /// [`Writer::put_raw`], so concatenated compact records need no temporary.
    pub fn put_string_header(&mut self, total: usize) -> Result<(), BencodeError> {
        self.put_decimal(total as i64)?;
        self.put_raw(b":")
    }
}
