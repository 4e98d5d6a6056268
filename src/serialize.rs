use std::io::Write;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::errors::Error;

/// Encoding of call arguments, return values and remote exceptions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SerializationProtocol {
    /// bincode, id 1
    #[default]
    Bincode,
    /// JSON, id 2
    Json,
}

impl SerializationProtocol {
    /// wire id
    pub fn id(self) -> i32 {
        match self {
            SerializationProtocol::Bincode => 1,
            SerializationProtocol::Json => 2,
        }
    }

    /// protocol for a wire id
    pub fn from_id(id: i32) -> Result<Self, Error> {
        match id {
            1 => Ok(SerializationProtocol::Bincode),
            2 => Ok(SerializationProtocol::Json),
            _ => Err(Error::UnknownSerializationProtocol(id)),
        }
    }

    /// serialize `value` into a writer
    pub fn serialize_into<W, T>(self, writer: W, value: &T) -> Result<(), String>
    where
        W: Write,
        T: Serialize + ?Sized,
    {
        match self {
            SerializationProtocol::Bincode => {
                bincode::serialize_into(writer, value).map_err(|e| e.to_string())
            }
            SerializationProtocol::Json => {
                serde_json::to_writer(writer, value).map_err(|e| e.to_string())
            }
        }
    }

    /// deserialize a value from raw bytes
    pub fn deserialize<T: DeserializeOwned>(self, data: &[u8]) -> Result<T, String> {
        match self {
            SerializationProtocol::Bincode => bincode::deserialize(data).map_err(|e| e.to_string()),
            SerializationProtocol::Json => serde_json::from_slice(data).map_err(|e| e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_protocols_carry_tuples() {
        for protocol in [SerializationProtocol::Bincode, SerializationProtocol::Json] {
            let mut out = Vec::new();
            protocol.serialize_into(&mut out, &("hi".to_owned(), 7u32)).unwrap();
            let back: (String, u32) = protocol.deserialize(&out).unwrap();
            assert_eq!(back, ("hi".to_owned(), 7));
            assert_eq!(SerializationProtocol::from_id(protocol.id()).unwrap(), protocol);
        }
        assert!(matches!(
            SerializationProtocol::from_id(9),
            Err(Error::UnknownSerializationProtocol(9))
        ));
    }
}
