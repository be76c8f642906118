//! Payload decoding, resolved at registration time.

use serde::de::DeserializeOwned;
use std::ops::{Deref, DerefMut};
use thiserror::Error;

/// Failure to turn a raw message body into the listener's payload type.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Types a listener can receive.
pub trait FromPayload: Sized + Send + 'static {
    fn from_payload(body: &[u8]) -> Result<Self, ConversionError>;
}

impl FromPayload for Vec<u8> {
    fn from_payload(body: &[u8]) -> Result<Self, ConversionError> {
        Ok(body.to_vec())
    }
}

impl FromPayload for String {
    fn from_payload(body: &[u8]) -> Result<Self, ConversionError> {
        Ok(std::str::from_utf8(body)?.to_owned())
    }
}

/// JSON-decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T> FromPayload for Json<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn from_payload(body: &[u8]) -> Result<Self, ConversionError> {
        Ok(Json(serde_json::from_slice(body)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Order {
        id: u32,
        sku: String,
    }

    #[test]
    fn test_string_payload() {
        assert_eq!(String::from_payload(b"hello").unwrap(), "hello");
        let err = String::from_payload(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, ConversionError::Utf8(_)));
    }

    #[test]
    fn test_json_payload() {
        let order = Json::<Order>::from_payload(br#"{"id":7,"sku":"A-1"}"#).unwrap();
        assert_eq!(order.id, 7);
        assert_eq!(order.into_inner().sku, "A-1");

        let err = Json::<Order>::from_payload(b"{not json").unwrap_err();
        assert!(err.to_string().contains("JSON"));
    }
}
