use super::*;

#[test]
fn test_read_integer() {
    assert_eq!(Reader::new(b"i42e").read_integer().unwrap(), 42);
    assert_eq!(Reader::new(b"i-42e").read_integer().unwrap(), -42);
    assert_eq!(Reader::new(b"i0e").read_integer().unwrap(), 0);
}

#[test]
fn test_read_integer_invalid() {
    assert!(Reader::new(b"i-0e").read_integer().is_err());
    assert!(Reader::new(b"i03e").read_integer().is_err());
    assert!(Reader::new(b"ie").read_integer().is_err());
    assert!(Reader::new(b"i4x2e").read_integer().is_err());
    assert_eq!(
        Reader::new(b"i42").read_integer(),
        Err(BencodeError::UnexpectedEof)
    );
    assert_eq!(
        Reader::new(b"i99999999999999999999e").read_integer(),
        Err(BencodeError::InvalidInteger)
    );
}

#[test]
fn test_read_bytes() {
    let mut reader = Reader::new(b"4:spam0:");
    assert_eq!(reader.read_bytes().unwrap(), b"spam");
    assert_eq!(reader.read_bytes().unwrap(), b"");
    assert!(reader.is_empty());
    assert!(reader.finish().is_ok());
}

#[test]
fn test_read_bytes_length_past_end() {
    let mut reader = Reader::new(b"10:short");
    assert_eq!(reader.read_bytes(), Err(BencodeError::UnexpectedEof));
}

#[test]
fn test_read_bytes_invalid_length() {
    assert_eq!(
        Reader::new(b"03:abc").read_bytes(),
        Err(BencodeError::InvalidStringLength)
    );
    assert_eq!(
        Reader::new(b"123456:x").read_bytes(),
        Err(BencodeError::InvalidStringLength)
    );
    assert_eq!(
        Reader::new(b":abc").read_bytes(),
        Err(BencodeError::InvalidStringLength)
    );
    assert_eq!(Reader::new(b"12").read_bytes(), Err(BencodeError::UnexpectedEof));
}

#[test]
fn test_read_fixed() {
    let mut reader = Reader::new(b"3:abc4:abcd");
    assert_eq!(reader.read_fixed::<3>().unwrap(), *b"abc");
    assert_eq!(
        reader.read_fixed::<3>(),
        Err(BencodeError::InvalidStringLength)
    );
}

#[test]
fn test_skip_scalar_refuses_nesting() {
    assert!(Reader::new(b"i1e").skip_scalar().is_ok());
    assert!(Reader::new(b"2:ab").skip_scalar().is_ok());
    assert_eq!(
        Reader::new(b"li1ee").skip_scalar(),
        Err(BencodeError::NestingRefused)
    );
    assert_eq!(
        Reader::new(b"de").skip_scalar(),
        Err(BencodeError::NestingRefused)
    );
}

#[test]
fn test_end_of_container() {
    let mut reader = Reader::new(b"e1:x");
    assert!(reader.end_of_container().unwrap());
    assert!(!reader.end_of_container().unwrap());
    let mut empty = Reader::new(b"");
    assert_eq!(empty.end_of_container(), Err(BencodeError::UnexpectedEof));
}

#[test]
fn test_trailing_data() {
    let mut reader = Reader::new(b"i1ei2e");
    reader.read_integer().unwrap();
    assert_eq!(reader.finish(), Err(BencodeError::TrailingData));
}

#[test]
fn test_write_scalars() {
    let mut buf = [0u8; 32];
    let mut writer = Writer::new(&mut buf);
    writer.put_integer(42).unwrap();
    writer.put_integer(-7).unwrap();
    writer.put_bytes(b"spam").unwrap();
    assert_eq!(writer.written(), b"i42ei-7e4:spam");
}

#[test]
fn test_write_dict() {
    let mut buf = [0u8; 64];
    let mut writer = Writer::new(&mut buf);
    writer.begin_dict().unwrap();
    writer.put_key_bytes(b"cow", b"moo").unwrap();
    writer.put_key(b"list").unwrap();
    writer.begin_list().unwrap();
    writer.put_integer(1).unwrap();
    writer.end().unwrap();
    writer.end().unwrap();
    assert_eq!(writer.written(), b"d3:cow3:moo4:listli1eee");
}

#[test]
fn test_write_string_header() {
    let mut buf = [0u8; 16];
    let mut writer = Writer::new(&mut buf);
    writer.put_string_header(4).unwrap();
    writer.put_raw(b"ab").unwrap();
    writer.put_raw(b"cd").unwrap();
    assert_eq!(writer.written(), b"4:abcd");
}

#[test]
fn test_write_buffer_too_small() {
    let mut buf = [0u8; 4];
    let mut writer = Writer::new(&mut buf);
    assert_eq!(writer.put_bytes(b"spam"), Err(BencodeError::BufferTooSmall));
    assert_eq!(writer.put_integer(123456), Err(BencodeError::BufferTooSmall));
}

#[test]
fn test_written_then_read_back() {
    let mut buf = [0u8; 64];
    let mut writer = Writer::new(&mut buf);
    writer.begin_dict().unwrap();
    writer.put_key_integer(b"port", 6881).unwrap();
    writer.put_key_bytes(b"token", b"\x00\x01\xff").unwrap();
    writer.end().unwrap();
    let len = writer.position();

    let mut reader = Reader::new(&buf[..len]);
    reader.expect(b'd').unwrap();
    assert_eq!(reader.read_bytes().unwrap(), b"port");
    assert_eq!(reader.read_integer().unwrap(), 6881);
    assert_eq!(reader.read_bytes().unwrap(), b"token");
    assert_eq!(reader.read_bytes().unwrap(), b"\x00\x01\xff");
    assert!(reader.end_of_container().unwrap());
    assert!(reader.finish().is_ok());
}
