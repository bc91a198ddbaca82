//! Value codecs.
//!
//! A codec turns application values into the byte payload stored remotely
//! and back. The facade is generic over the codec so applications can plug
//! in their own format; [`JsonCodec`] is the default.

use kaisen_core::{CachedData, CodecError, MAX_PAYLOAD_BYTES};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;

/// Flag stored next to payloads written by [`JsonCodec`].
pub const JSON_FLAGS: u32 = 0x20;

/// Flag stored next to payloads written by [`StringCodec`].
pub const STRING_FLAGS: u32 = 0;

/// Converts between application values and stored payloads.
pub trait ValueCodec<T>: Send + Sync {
    /// Encode a value for storage.
    fn encode(&self, value: &T) -> Result<CachedData, CodecError>;

    /// Decode a stored payload.
    fn decode(&self, data: &CachedData) -> Result<T, CodecError>;

    /// Whether an encoded value is the codec's null representation.
    ///
    /// Writes of a null value are rejected before any network call.
    fn is_null(&self, _data: &CachedData) -> bool {
        false
    }
}

/// JSON codec backed by `serde_json`.
///
/// `Option::None` and unit-like values that serialize to `null` count as
/// null. Payloads larger than the configured limit are refused on both
/// encode and decode.
#[derive(Debug)]
pub struct JsonCodec<T> {
    max_size: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_size(MAX_PAYLOAD_BYTES)
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            max_size,
            _marker: PhantomData,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn check_size(&self, size: usize) -> Result<(), CodecError> {
        if size > self.max_size {
            return Err(CodecError::TooLarge {
                size,
                limit: self.max_size,
            });
        }
        Ok(())
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonCodec<T> {
    fn clone(&self) -> Self {
        Self::with_max_size(self.max_size)
    }
}

impl<T> ValueCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<CachedData, CodecError> {
        let data = serde_json::to_vec(value).map_err(|e| CodecError::Encode {
            reason: e.to_string(),
        })?;
        self.check_size(data.len())?;
        Ok(CachedData::new(JSON_FLAGS, data))
    }

    fn decode(&self, data: &CachedData) -> Result<T, CodecError> {
        self.check_size(data.len())?;
        serde_json::from_slice(&data.data).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }

    fn is_null(&self, data: &CachedData) -> bool {
        data.data == b"null"
    }
}

/// Stores strings as raw UTF-8.
///
/// Payloads concatenate, so this is the codec to use with `append` and
/// `prepend`, and it reads counters written by `incr`/`decr`. The empty
/// string is a valid value.
#[derive(Debug, Clone)]
pub struct StringCodec {
    max_size: usize,
}

impl StringCodec {
    pub fn new() -> Self {
        Self {
            max_size: MAX_PAYLOAD_BYTES,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }
}

impl Default for StringCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueCodec<String> for StringCodec {
    fn encode(&self, value: &String) -> Result<CachedData, CodecError> {
        if value.len() > self.max_size {
            return Err(CodecError::TooLarge {
                size: value.len(),
                limit: self.max_size,
            });
        }
        Ok(CachedData::new(STRING_FLAGS, value.as_bytes().to_vec()))
    }

    fn decode(&self, data: &CachedData) -> Result<String, CodecError> {
        String::from_utf8(data.data.clone()).map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        id: u32,
        name: String,
    }

    #[test]
    fn test_json_codec_encodes_and_decodes() {
        let codec = JsonCodec::<Profile>::new();
        let profile = Profile {
            id: 7,
            name: "ada".to_string(),
        };
        let data = codec.encode(&profile).unwrap();
        assert_eq!(data.flags, JSON_FLAGS);
        assert_eq!(codec.decode(&data).unwrap(), profile);
    }

    #[test]
    fn test_json_codec_none_is_null() {
        let codec = JsonCodec::<Option<String>>::new();
        let none = codec.encode(&None).unwrap();
        assert!(codec.is_null(&none));

        let some = codec.encode(&Some("x".to_string())).unwrap();
        assert!(!codec.is_null(&some));
    }

    #[test]
    fn test_json_codec_refuses_oversized_payload() {
        let codec = JsonCodec::<String>::with_max_size(8);
        let err = codec.encode(&"0123456789".to_string()).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { limit: 8, .. }));
    }

    #[test]
    fn test_json_codec_decode_garbage() {
        let codec = JsonCodec::<Profile>::new();
        let err = codec
            .decode(&CachedData::new(JSON_FLAGS, b"{not json".to_vec()))
            .unwrap_err();
        assert!(matches!(err, CodecError::Decode { .. }));
    }

    #[test]
    fn test_string_codec_reads_raw_bytes() {
        let codec = StringCodec::new();
        let data = codec.encode(&"hello".to_string()).unwrap();
        assert_eq!(data.data, b"hello");
        assert_eq!(
            codec.decode(&CachedData::new(0, b"42".to_vec())).unwrap(),
            "42"
        );
        assert!(codec.decode(&CachedData::new(0, vec![0xff, 0xfe])).is_err());
    }
}
