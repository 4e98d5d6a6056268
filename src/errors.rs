use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric error code carried in error frames and remote exceptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ErrorCode(pub i32);

macro_rules! error_codes {
    ($($name: ident = $value: literal, $desc: literal;)*) => {
        impl ErrorCode {
            $(
                #[doc = $desc]
                pub const $name: ErrorCode = ErrorCode($value);
            )*

            /// human readable description of the code
            pub fn description(self) -> &'static str {
                match self.0 {
                    $($value => $desc,)*
                    _ => "unknown error code",
                }
            }
        }
    };
}

error_codes! {
    OK = 0, "no error";
    UNSPECIFIED = 1, "unspecified error";
    SERVER_MESSAGE_LENGTH = 2, "server message length exceeds the limit";
    CLIENT_MESSAGE_LENGTH = 3, "client message length exceeds the limit";
    SERIALIZATION = 4, "data serialization failed";
    DESERIALIZATION = 5, "data deserialization failed";
    USER_MODE_EXCEPTION = 6, "the remote operation raised an exception";
    UNKNOWN_ENDPOINT = 8, "unknown endpoint";
    ENDPOINT_PASSWORD = 9, "endpoint password does not match";
    ENDPOINT_DOWN = 10, "endpoint has no link available";
    UNKNOWN_PUBLISHER = 23, "unknown publisher";
    UNKNOWN_FILTER = 24, "unknown filter";
    NO_SERVER_STUB = 25, "no server stub bound under the requested name";
    UNKNOWN_SUBSCRIBER = 29, "unknown subscriber";
    CLIENT_CONNECT_TIMEOUT = 16, "client connect timed out";
    PEER_DISCONNECT = 17, "peer disconnected";
    PAYLOAD_FILTER_MISMATCH = 20, "payload filters do not match the negotiated filters";
    CLIENT_READ_TIMEOUT = 30, "client read timed out";
    CLIENT_READ_FAIL = 31, "client read failed";
    CLIENT_WRITE_TIMEOUT = 32, "client write timed out";
    CLIENT_WRITE_FAIL = 33, "client write failed";
    CLIENT_CONNECT_FAIL = 34, "client connect failed";
    FILTER = 35, "filter failure";
    FN_ID = 37, "unknown function id";
    UNKNOWN_INTERFACE = 38, "unknown interface";
    NO_ENDPOINT = 39, "no endpoint configured";
    FILTER_COUNT = 41, "too many filters";
    FILTER_MESSAGE = 42, "filtering the message failed";
    UNFILTER_MESSAGE = 43, "unfiltering the message failed";
    NOT_CONNECTED = 48, "not connected";
    ZLIB_DEFLATE = 50, "zlib compression failed";
    ZLIB_INFLATE = 51, "zlib decompression failed";
    UNKNOWN_SERIALIZATION_PROTOCOL = 53, "unknown serialization protocol";
    BAD_EXCEPTION = 62, "the remote operation panicked";
    DECODING = 64, "decoding failed";
    ENCODING = 65, "encoding failed";
    TOKEN_REQUEST_FAILED = 66, "no tokens available";
    OBJECT_FACTORY_NOT_FOUND = 67, "object factory not found";
    DYNAMIC_OBJECT_NOT_FOUND = 69, "dynamic object not found";
    VERSION_MISMATCH = 70, "runtime version mismatch";
    REPEATED_RETRIES = 71, "too many retries";
    USER = 1001, "user error";
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

/// Error raised on the server side and shipped back to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("remote exception {code}: {message}")]
pub struct RemoteException {
    /// wire level error code
    pub code: ErrorCode,
    /// free form message
    pub message: String,
    /// name of the error type that was raised remotely
    pub type_name: String,
}

impl RemoteException {
    /// create an exception with an explicit message
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RemoteException {
            code,
            message: message.into(),
            type_name: String::new(),
        }
    }

    /// create an exception whose message is the code description
    pub fn from_code(code: ErrorCode) -> Self {
        RemoteException::new(code, code.description())
    }

    /// application error raised by a servant
    pub fn user(message: impl Into<String>) -> Self {
        RemoteException::new(ErrorCode::USER, message)
    }

    /// attach the name of the raised error type
    pub fn with_type_name(mut self, type_name: impl Into<String>) -> Self {
        self.type_name = type_name.into();
        self
    }
}

/// All errors that can occur during the use of wirecall.
#[derive(Debug, Error)]
pub enum Error {
    /// Any IO error.
    #[error("IO err: {0}")]
    Io(#[from] io::Error),

    /// Malformed input on the wire.
    #[error("decoding err: {0}")]
    Decoding(String),
    /// A response could not be encoded.
    #[error("encoding err: {0}")]
    Encoding(String),
    /// The request header carries a version this runtime does not speak.
    #[error("unsupported header version {0}")]
    HeaderVersion(i32),
    /// The server runs an older runtime version, carried here.
    #[error("server runtime version {0} is not compatible")]
    VersionMismatch(i32),
    /// Unknown serialization protocol id.
    #[error("unknown serialization protocol: {0}")]
    UnknownSerializationProtocol(i32),
    /// Error in serializing a client request.
    #[error("serializing a client request err: {0}")]
    ClientSerialize(String),
    /// Error in deserializing a server response.
    #[error("deserializing a server response err: {0}")]
    ClientDeserialize(String),

    /// The stub has no endpoint to connect to.
    #[error("no endpoint configured")]
    NoEndpoint,
    /// The stub is not connected and reconnecting is disabled.
    #[error("not connected")]
    NotConnected,
    /// Connecting did not finish before the deadline.
    #[error("connect to {0} timed out")]
    ConnectTimeout(String),
    /// Connecting failed.
    #[error("connect to {0} failed: {1}")]
    ConnectFail(String, #[source] io::Error),
    /// The server was unable to reply to the rpc client within some time.
    #[error("The server was unable to reply to the rpc client within some time")]
    ReadTimeout,
    /// Reading from the peer failed.
    #[error("read from peer failed: {0}")]
    ReadFail(#[source] io::Error),
    /// Writing to the peer did not finish before the deadline.
    #[error("write to peer timed out")]
    WriteTimeout,
    /// Writing to the peer failed.
    #[error("write to peer failed: {0}")]
    WriteFail(#[source] io::Error),
    /// The peer closed the connection.
    #[error("peer disconnected")]
    PeerDisconnect,
    /// A frame announced more bytes than allowed.
    #[error("message length {0} exceeds the limit {1}")]
    MessageLength(usize, usize),

    /// A filter stage failed to transform data.
    #[error("filter err {code}: {message}")]
    Filter {
        /// filter specific code
        code: ErrorCode,
        /// what went wrong
        message: String,
    },
    /// The filter ids of a payload differ from the negotiated ones.
    #[error("payload filter ids do not match the negotiated filters")]
    PayloadFilterMismatch,
    /// A filter id was not registered.
    #[error("unknown filter id {0}")]
    UnknownFilter(i32),
    /// Too many stages in one chain.
    #[error("filter chain holds {0} filters, the limit is {1}")]
    FilterCount(usize, usize),

    /// Exception or error code returned by the remote side.
    #[error("{0}")]
    Remote(#[from] RemoteException),

    /// The token pool is exhausted.
    #[error("no tokens available")]
    TokenRequestFailed,
}

impl Error {
    /// build a filter error
    pub fn filter(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Filter {
            code,
            message: message.into(),
        }
    }

    /// wire level code matching this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Io(_) => ErrorCode::UNSPECIFIED,
            Error::Decoding(_) => ErrorCode::DECODING,
            Error::Encoding(_) => ErrorCode::ENCODING,
            Error::HeaderVersion(_) | Error::VersionMismatch(_) => ErrorCode::VERSION_MISMATCH,
            Error::UnknownSerializationProtocol(_) => ErrorCode::UNKNOWN_SERIALIZATION_PROTOCOL,
            Error::ClientSerialize(_) => ErrorCode::SERIALIZATION,
            Error::ClientDeserialize(_) => ErrorCode::DESERIALIZATION,
            Error::NoEndpoint => ErrorCode::NO_ENDPOINT,
            Error::NotConnected => ErrorCode::NOT_CONNECTED,
            Error::ConnectTimeout(_) => ErrorCode::CLIENT_CONNECT_TIMEOUT,
            Error::ConnectFail(..) => ErrorCode::CLIENT_CONNECT_FAIL,
            Error::ReadTimeout => ErrorCode::CLIENT_READ_TIMEOUT,
            Error::ReadFail(_) => ErrorCode::CLIENT_READ_FAIL,
            Error::WriteTimeout => ErrorCode::CLIENT_WRITE_TIMEOUT,
            Error::WriteFail(_) => ErrorCode::CLIENT_WRITE_FAIL,
            Error::PeerDisconnect => ErrorCode::PEER_DISCONNECT,
            Error::MessageLength(..) => ErrorCode::CLIENT_MESSAGE_LENGTH,
            Error::Filter { code, .. } => *code,
            Error::PayloadFilterMismatch => ErrorCode::PAYLOAD_FILTER_MISMATCH,
            Error::UnknownFilter(_) => ErrorCode::UNKNOWN_FILTER,
            Error::FilterCount(..) => ErrorCode::FILTER_COUNT,
            Error::Remote(e) => e.code,
            Error::TokenRequestFailed => ErrorCode::TOKEN_REQUEST_FAILED,
        }
    }

    /// true for failures of the underlying connection
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectTimeout(_)
                | Error::ConnectFail(..)
                | Error::ReadTimeout
                | Error::ReadFail(_)
                | Error::WriteTimeout
                | Error::WriteFail(_)
                | Error::PeerDisconnect
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_describe_themselves() {
        assert_eq!(ErrorCode::VERSION_MISMATCH.0, 70);
        assert_eq!(
            ErrorCode::PAYLOAD_FILTER_MISMATCH.description(),
            "payload filters do not match the negotiated filters"
        );
        assert_eq!(ErrorCode(12345).description(), "unknown error code");
    }

    #[test]
    fn remote_errors_keep_their_code() {
        let e = Error::from(RemoteException::from_code(ErrorCode::NO_SERVER_STUB));
        assert_eq!(e.code(), ErrorCode::NO_SERVER_STUB);
        assert!(!e.is_transport());
        assert!(Error::ReadTimeout.is_transport());
    }
}
