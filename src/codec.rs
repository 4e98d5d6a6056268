//! Compact integer/string/bool encoding and the message envelopes.
//!
//! Integers in `0..255` take one byte, everything else is the byte `0xFF`
//! followed by the value as a big endian `i32`. Strings are a length followed
//! by raw bytes, booleans are encoded as the integers 0 and 1.
//!
//! Writers take a fixed slice and a cursor; callers size the slice up front
//! with the `*_len` helpers, so running past the end is a bug and panics.
//! Readers validate everything and report malformed input as
//! [`Error::Decoding`].

use byteorder::{BigEndian, ByteOrder};

use crate::buffer::Buffer;
use crate::errors::{Error, ErrorCode};
use crate::filter::MAX_FILTERS;
use crate::token::Token;

const WIDE_INT: u8 = 0xFF;

/// highest request header version a server accepts
pub const MAX_HEADER_VERSION: i32 = 2;

/// encoded size of an integer
pub fn int_len(value: i32) -> usize {
    if (0..WIDE_INT as i32).contains(&value) {
        1
    } else {
        5
    }
}

/// encoded size of a string
pub fn string_len(value: &str) -> usize {
    int_len(value.len() as i32) + value.len()
}

/// encode an integer at `pos`
pub fn encode_int(value: i32, buf: &mut [u8], pos: &mut usize) {
    let len = int_len(value);
    assert!(
        *pos + len <= buf.len(),
        "encode_int: {len} bytes at {} overflow a buffer of {}",
        *pos,
        buf.len()
    );
    if len == 1 {
        buf[*pos] = value as u8;
    } else {
        buf[*pos] = WIDE_INT;
        BigEndian::write_i32(&mut buf[*pos + 1..*pos + 5], value);
    }
    *pos += len;
}

/// encode a boolean at `pos`
pub fn encode_bool(value: bool, buf: &mut [u8], pos: &mut usize) {
    encode_int(value as i32, buf, pos)
}

/// encode a string at `pos`
pub fn encode_string(value: &str, buf: &mut [u8], pos: &mut usize) {
    encode_int(value.len() as i32, buf, pos);
    let end = *pos + value.len();
    assert!(end <= buf.len(), "encode_string: overflow");
    buf[*pos..end].copy_from_slice(value.as_bytes());
    *pos = end;
}

fn truncated(what: &str) -> Error {
    Error::Decoding(format!("{what}: unexpected end of input"))
}

/// decode an integer at `pos`
pub fn decode_int(buf: &[u8], pos: &mut usize) -> Result<i32, Error> {
    let first = *buf.get(*pos).ok_or_else(|| truncated("int"))?;
    if first != WIDE_INT {
        *pos += 1;
        return Ok(first as i32);
    }
    if *pos + 5 > buf.len() {
        return Err(truncated("int"));
    }
    let value = BigEndian::read_i32(&buf[*pos + 1..*pos + 5]);
    *pos += 5;
    Ok(value)
}

/// decode a boolean at `pos`
pub fn decode_bool(buf: &[u8], pos: &mut usize) -> Result<bool, Error> {
    decode_int(buf, pos).map(|v| v != 0)
}

/// decode a string at `pos`
pub fn decode_string(buf: &[u8], pos: &mut usize) -> Result<String, Error> {
    let len = decode_int(buf, pos)?;
    if len < 0 {
        return Err(Error::Decoding(format!("negative string length {len}")));
    }
    let end = *pos + len as usize;
    if end > buf.len() {
        return Err(truncated("string"));
    }
    let s = std::str::from_utf8(&buf[*pos..end])
        .map_err(|e| Error::Decoding(format!("string: {e}")))?
        .to_owned();
    *pos = end;
    Ok(s)
}

/// First field of every message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// control error frame
    Error = 0,
    /// call request
    Request = 1,
    /// call response
    Response = 2,
    /// filtered payload wrapper
    FilteredPayload = 3,
}

impl Descriptor {
    /// map a wire value to a descriptor
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Descriptor::Error),
            1 => Some(Descriptor::Request),
            2 => Some(Descriptor::Response),
            3 => Some(Descriptor::FilteredPayload),
            _ => None,
        }
    }

    fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, Error> {
        let v = decode_int(buf, pos)?;
        Descriptor::from_i32(v).ok_or_else(|| Error::Decoding(format!("bad descriptor {v}")))
    }
}

/// Request envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// header layout version
    pub version: i32,
    /// bound name of the target object
    pub service: String,
    /// leased object target, `Token::none()` when addressing by name
    pub token: Token,
    /// interface of the target object, defaults to the service name
    pub sub_interface: String,
    /// function index within the interface
    pub fn_id: i32,
    /// serialization protocol of the payload
    pub protocol: i32,
    /// no response is expected
    pub oneway: bool,
    /// the server closes the session instead of dispatching
    pub close: bool,
    /// runtime version of the sender
    pub runtime_version: i32,
    /// skip the runtime version check
    pub ignore_runtime_version: bool,
}

impl RequestHeader {
    /// build a request envelope, the header version follows the runtime version
    pub fn new(service: &str, token: Token, sub_interface: &str, fn_id: i32) -> Self {
        RequestHeader {
            version: 1,
            service: service.to_owned(),
            token,
            sub_interface: sub_interface.to_owned(),
            fn_id,
            protocol: 1,
            oneway: false,
            close: false,
            runtime_version: crate::RUNTIME_VERSION,
            ignore_runtime_version: false,
        }
    }

    /// set the sender's runtime version and derive the header version from it
    pub fn runtime_version(mut self, runtime_version: i32) -> Self {
        self.runtime_version = runtime_version;
        self.version = if runtime_version < 2 { 0 } else { 1 };
        self
    }

    fn wire_sub_interface(&self) -> &str {
        if self.sub_interface == self.service {
            ""
        } else {
            &self.sub_interface
        }
    }

    /// encoded size
    pub fn encoded_len(&self) -> usize {
        let mut len = int_len(Descriptor::Request as i32)
            + int_len(self.version)
            + string_len(&self.service)
            + int_len(self.token.id())
            + string_len(self.wire_sub_interface())
            + int_len(self.fn_id)
            + int_len(self.protocol)
            + 2;
        if self.version >= 1 {
            len += int_len(self.runtime_version) + 1;
        }
        len
    }

    /// encode at `pos`
    pub fn encode(&self, buf: &mut [u8], pos: &mut usize) {
        encode_int(Descriptor::Request as i32, buf, pos);
        encode_int(self.version, buf, pos);
        encode_string(&self.service, buf, pos);
        encode_int(self.token.id(), buf, pos);
        encode_string(self.wire_sub_interface(), buf, pos);
        encode_int(self.fn_id, buf, pos);
        encode_int(self.protocol, buf, pos);
        encode_bool(self.oneway, buf, pos);
        encode_bool(self.close, buf, pos);
        if self.version >= 1 {
            encode_int(self.runtime_version, buf, pos);
            encode_bool(self.ignore_runtime_version, buf, pos);
        }
    }

    /// Decodes a request envelope. A header version above
    /// [`MAX_HEADER_VERSION`] yields [`Error::HeaderVersion`].
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, Error> {
        let desc = Descriptor::decode(buf, pos)?;
        if desc != Descriptor::Request {
            return Err(Error::Decoding(format!("expected a request, got {desc:?}")));
        }
        let version = decode_int(buf, pos)?;
        if !(0..=MAX_HEADER_VERSION).contains(&version) {
            return Err(Error::HeaderVersion(version));
        }
        let service = decode_string(buf, pos)?;
        let token = Token::new(decode_int(buf, pos)?);
        let mut sub_interface = decode_string(buf, pos)?;
        if sub_interface.is_empty() {
            sub_interface = service.clone();
        }
        let fn_id = decode_int(buf, pos)?;
        let protocol = decode_int(buf, pos)?;
        let oneway = decode_bool(buf, pos)?;
        let close = decode_bool(buf, pos)?;
        let (runtime_version, ignore_runtime_version) = if version >= 1 {
            (decode_int(buf, pos)?, decode_bool(buf, pos)?)
        } else {
            (1, false)
        };
        Ok(RequestHeader {
            version,
            service,
            token,
            sub_interface,
            fn_id,
            protocol,
            oneway,
            close,
            runtime_version,
            ignore_runtime_version,
        })
    }
}

/// Response envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseHeader {
    /// the payload is the return value
    Return,
    /// the payload is a serialized `RemoteException`
    Exception,
    /// control error frame without payload
    Error {
        /// error code
        code: ErrorCode,
        /// extra argument, the server runtime version for `VERSION_MISMATCH`
        arg: i32,
    },
}

impl ResponseHeader {
    /// error frame header
    pub fn error(code: ErrorCode) -> Self {
        ResponseHeader::Error { code, arg: 0 }
    }

    /// encoded size
    pub fn encoded_len(&self) -> usize {
        match *self {
            ResponseHeader::Return | ResponseHeader::Exception => 3,
            ResponseHeader::Error { code, arg } => {
                let mut len = 2 + int_len(code.0);
                if code == ErrorCode::VERSION_MISMATCH {
                    len += int_len(arg);
                }
                len
            }
        }
    }

    /// encode at `pos`
    pub fn encode(&self, buf: &mut [u8], pos: &mut usize) {
        match *self {
            ResponseHeader::Return | ResponseHeader::Exception => {
                encode_int(Descriptor::Response as i32, buf, pos);
                encode_int(0, buf, pos);
                encode_bool(*self == ResponseHeader::Exception, buf, pos);
            }
            ResponseHeader::Error { code, arg } => {
                encode_int(Descriptor::Error as i32, buf, pos);
                encode_int(0, buf, pos);
                encode_int(code.0, buf, pos);
                if code == ErrorCode::VERSION_MISMATCH {
                    encode_int(arg, buf, pos);
                }
            }
        }
    }

    /// decode at `pos`
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, Error> {
        let desc = Descriptor::decode(buf, pos)?;
        let _version = decode_int(buf, pos)?;
        match desc {
            Descriptor::Response => {
                if decode_bool(buf, pos)? {
                    Ok(ResponseHeader::Exception)
                } else {
                    Ok(ResponseHeader::Return)
                }
            }
            Descriptor::Error => {
                let code = ErrorCode(decode_int(buf, pos)?);
                let arg = if code == ErrorCode::VERSION_MISMATCH {
                    decode_int(buf, pos)?
                } else {
                    0
                };
                Ok(ResponseHeader::Error { code, arg })
            }
            other => Err(Error::Decoding(format!("expected a response, got {other:?}"))),
        }
    }
}

/// Wrapper announcing a filtered payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredHeader {
    /// ids of the filters applied, application side first
    pub filter_ids: Vec<i32>,
    /// cleartext bytes between the wrapper and the filtered data
    pub leading_len: usize,
    /// length of the payload once unfiltered
    pub unfiltered_len: usize,
}

impl FilteredHeader {
    /// encoded size
    pub fn encoded_len(&self) -> usize {
        2 + int_len(self.filter_ids.len() as i32)
            + self.filter_ids.iter().map(|id| int_len(*id)).sum::<usize>()
            + int_len(self.leading_len as i32)
            + int_len(self.unfiltered_len as i32)
    }

    /// encode at `pos`
    pub fn encode(&self, buf: &mut [u8], pos: &mut usize) {
        assert!(!self.filter_ids.is_empty() && self.filter_ids.len() <= MAX_FILTERS);
        encode_int(Descriptor::FilteredPayload as i32, buf, pos);
        encode_int(0, buf, pos);
        encode_int(self.filter_ids.len() as i32, buf, pos);
        for id in &self.filter_ids {
            encode_int(*id, buf, pos);
        }
        encode_int(self.leading_len as i32, buf, pos);
        encode_int(self.unfiltered_len as i32, buf, pos);
    }

    /// decode at `pos`, the descriptor must be `FilteredPayload`
    pub fn decode(buf: &[u8], pos: &mut usize) -> Result<Self, Error> {
        let desc = Descriptor::decode(buf, pos)?;
        if desc != Descriptor::FilteredPayload {
            return Err(Error::Decoding(format!("expected filtered payload, got {desc:?}")));
        }
        let _version = decode_int(buf, pos)?;
        let count = decode_int(buf, pos)?;
        if count <= 0 || count as usize > MAX_FILTERS {
            return Err(Error::Decoding(format!("bad filter count {count}")));
        }
        let filter_ids = (0..count)
            .map(|_| decode_int(buf, pos))
            .collect::<Result<Vec<_>, _>>()?;
        let leading_len = decode_int(buf, pos)?;
        let unfiltered_len = decode_int(buf, pos)?;
        if leading_len < 0 || unfiltered_len < 0 {
            return Err(Error::Decoding("negative filtered lengths".into()));
        }
        Ok(FilteredHeader {
            filter_ids,
            leading_len: leading_len as usize,
            unfiltered_len: unfiltered_len as usize,
        })
    }

    /// Splits a message into wrapper and filtered body, skipping any leading
    /// cleartext. Returns `None` for unfiltered messages.
    pub fn peek(message: &Buffer) -> Result<Option<(FilteredHeader, Buffer)>, Error> {
        let mut pos = 0;
        let desc = decode_int(message, &mut pos)?;
        if desc != Descriptor::FilteredPayload as i32 {
            return Ok(None);
        }
        pos = 0;
        let header = FilteredHeader::decode(message, &mut pos)?;
        if pos + header.leading_len > message.len() {
            return Err(truncated("filtered payload"));
        }
        let body = message.slice_from(pos + header.leading_len);
        Ok(Some((header, body)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: i32) -> Vec<u8> {
        let mut buf = vec![0u8; int_len(value)];
        let mut pos = 0;
        encode_int(value, &mut buf, &mut pos);
        assert_eq!(pos, buf.len());
        buf
    }

    #[test]
    fn int_encoding_boundaries() {
        assert_eq!(encoded(0), vec![0]);
        assert_eq!(encoded(254), vec![254]);
        assert_eq!(encoded(255), vec![0xFF, 0, 0, 0, 255]);
        assert_eq!(encoded(256), vec![0xFF, 0, 0, 1, 0]);
        assert_eq!(encoded(-1), vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);

        for x in [0, 1, 254, 255, 256, 65_535, i32::MAX] {
            let bytes = encoded(x);
            let mut pos = 0;
            let back = decode_int(&bytes, &mut pos).unwrap();
            assert_eq!(back, x);
            assert_eq!(encoded(back), bytes);
        }
    }

    #[test]
    fn truncated_wide_int_is_a_decoding_error() {
        let mut pos = 0;
        let err = decode_int(&[0xFF, 0, 1], &mut pos).unwrap_err();
        assert!(matches!(err, Error::Decoding(_)));
        let mut pos = 0;
        assert!(decode_string(&[5, b'a', b'b'], &mut pos).is_err());
    }

    #[test]
    #[should_panic]
    fn writing_past_the_end_panics() {
        let mut buf = [0u8; 3];
        let mut pos = 0;
        encode_int(1000, &mut buf, &mut pos);
    }

    fn round_trip(header: &RequestHeader) -> RequestHeader {
        let mut buf = vec![0u8; header.encoded_len()];
        let mut pos = 0;
        header.encode(&mut buf, &mut pos);
        assert_eq!(pos, buf.len());
        let mut pos = 0;
        let back = RequestHeader::decode(&buf, &mut pos).unwrap();
        assert_eq!(pos, buf.len());
        back
    }

    #[test]
    fn request_header_defaults_sub_interface_to_service() {
        let mut header = RequestHeader::new("Echo", Token::none(), "Echo", 0);
        header.oneway = true;
        let back = round_trip(&header);
        assert_eq!(back, header);
        assert_eq!(back.runtime_version, crate::RUNTIME_VERSION);

        let header = RequestHeader::new("objA", Token::new(300), "Hello", 2);
        assert_eq!(round_trip(&header), header);
    }

    #[test]
    fn old_runtimes_use_header_version_zero() {
        let header = RequestHeader::new("Echo", Token::none(), "Echo", 1).runtime_version(1);
        assert_eq!(header.version, 0);
        let back = round_trip(&header);
        assert_eq!(back.runtime_version, 1);
        assert!(!back.ignore_runtime_version);
    }

    #[test]
    fn unknown_header_version_is_rejected() {
        let mut header = RequestHeader::new("Echo", Token::none(), "Echo", 0);
        header.version = 3;
        let mut buf = vec![0u8; header.encoded_len()];
        header.encode(&mut buf, &mut 0);
        let err = RequestHeader::decode(&buf, &mut 0).unwrap_err();
        assert!(matches!(err, Error::HeaderVersion(3)));
    }

    #[test]
    fn response_headers() {
        for header in [
            ResponseHeader::Return,
            ResponseHeader::Exception,
            ResponseHeader::error(ErrorCode::SERVER_MESSAGE_LENGTH),
            ResponseHeader::Error {
                code: ErrorCode::VERSION_MISMATCH,
                arg: 2,
            },
        ] {
            let mut buf = vec![0u8; header.encoded_len()];
            let mut pos = 0;
            header.encode(&mut buf, &mut pos);
            assert_eq!(pos, buf.len());
            assert_eq!(ResponseHeader::decode(&buf, &mut 0).unwrap(), header);
        }

        let mut buf = vec![0u8; 4];
        ResponseHeader::Error {
            code: ErrorCode::VERSION_MISMATCH,
            arg: 2,
        }
        .encode(&mut buf, &mut 0);
        assert_eq!(buf, vec![0, 0, 70, 2]);
    }

    #[test]
    fn filtered_wrapper_skips_leading_cleartext() {
        let header = FilteredHeader {
            filter_ids: vec![3, 1],
            leading_len: 2,
            unfiltered_len: 300,
        };
        let mut buf = vec![0u8; header.encoded_len()];
        header.encode(&mut buf, &mut 0);
        buf.extend_from_slice(b"xxbody");
        let (back, body) = FilteredHeader::peek(&Buffer::from(buf)).unwrap().unwrap();
        assert_eq!(back, header);
        assert_eq!(&body[..], b"body");

        let plain = Buffer::from(vec![Descriptor::Request as u8, 1]);
        assert!(FilteredHeader::peek(&plain).unwrap().is_none());
    }

    #[test]
    fn filtered_wrapper_rejects_bad_counts() {
        for count in [0u8, 11] {
            let buf = [Descriptor::FilteredPayload as u8, 0, count];
            assert!(FilteredHeader::decode(&buf, &mut 0).is_err());
        }
    }
}
