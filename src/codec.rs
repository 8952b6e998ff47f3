//! Message serialization.
//!
//! Send-message slots hold already serialized bytes, so a payload that
//! cannot be serialized is reported when the batch is built, never at
//! completion time.

use crate::status::Status;

use bytes::Bytes;

/// A request or response message.
pub trait Message: Sized {
    /// Serialize into a byte payload.
    fn encode(&self) -> Result<Bytes, Status>;

    /// Deserialize from a received payload.
    fn decode(buf: Bytes) -> Result<Self, Status>;
}

impl Message for Bytes {
    fn encode(&self) -> Result<Bytes, Status> {
        Ok(self.clone())
    }

    fn decode(buf: Bytes) -> Result<Self, Status> {
        Ok(buf)
    }
}

impl Message for Vec<u8> {
    fn encode(&self) -> Result<Bytes, Status> {
        Ok(Bytes::copy_from_slice(self))
    }

    fn decode(buf: Bytes) -> Result<Self, Status> {
        Ok(buf.to_vec())
    }
}

impl Message for String {
    fn encode(&self) -> Result<Bytes, Status> {
        Ok(Bytes::copy_from_slice(self.as_bytes()))
    }

    fn decode(buf: Bytes) -> Result<Self, Status> {
        String::from_utf8(buf.to_vec())
            .map_err(|e| Status::internal(format!("failed to parse message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;

    #[test]
    fn test_string_message() {
        let encoded = String::from("hello").encode().unwrap();
        assert_eq!(&encoded[..], b"hello");
        assert_eq!(String::decode(encoded).unwrap(), "hello");
    }

    #[test]
    fn test_string_decode_invalid_utf8() {
        let status = String::decode(Bytes::from_static(&[0xff, 0xfe])).unwrap_err();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_bytes_message_is_passthrough() {
        let payload = Bytes::from_static(b"\x00\x01\x02");
        assert_eq!(payload.encode().unwrap(), payload);
        assert_eq!(Vec::<u8>::decode(payload).unwrap(), vec![0, 1, 2]);
    }
}
