//! Events travel as CBOR by default. JSON is available for tooling and logs.
//!
//! Decoding validates the envelope, so a frame carrying an empty event type is
//! rejected the same way construction would reject it.

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::event::Event;

/// Encode an event into CBOR bytes.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode(event: &Event) -> Result<Bytes> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(event, &mut buf).map_err(|e| Error::Encode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode an event from CBOR bytes.
///
/// # Errors
///
/// Returns an error if the frame is malformed or the event is invalid.
pub fn decode(data: &[u8]) -> Result<Event> {
    let event: Event = ciborium::de::from_reader(data).map_err(|e| Error::Decode(e.to_string()))?;
    event.validate()?;
    Ok(event)
}

/// Encode an event as JSON.
///
/// # Errors
///
/// Returns an error if the payload cannot be serialized.
pub fn encode_json(event: &Event) -> Result<Bytes> {
    serde_json::to_vec(event)
        .map(Bytes::from)
        .map_err(|e| Error::Encode(e.to_string()))
}

/// Decode an event from JSON.
///
/// # Errors
///
/// Returns an error if the text is malformed or the event is invalid.
pub fn decode_json(data: &[u8]) -> Result<Event> {
    let event: Event = serde_json::from_slice(data).map_err(|e| Error::Decode(e.to_string()))?;
    event.validate()?;
    Ok(event)
}
