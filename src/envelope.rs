// Copyright (c) 2025, The Hutch Authors
// MIT License
// All rights reserved.

//! # Envelope Codec
//!
//! Wire format for pattern-role messages: the body is `"<topic>:<payload>"`,
//! with the topic duplicated as the broker routing key. Decoding splits at
//! the first delimiter, so payload bytes may contain `:` freely; topics must
//! not (enforced where envelopes are published). RPC bodies bypass this codec
//! and travel raw.

use crate::errors::MessagingError;

/// Delimiter between topic and payload in the wire body
pub const ENVELOPE_DELIMITER: u8 = b':';

/// A decoded message: topic, payload, the broker properties relevant to
/// request/response correlation, and the broker's redelivery flag so handlers
/// can treat retried deliveries differently.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub redelivered: bool,
}

impl Envelope {
    /// Creates an envelope with no correlation properties.
    pub fn new(topic: &str, payload: &[u8]) -> Envelope {
        Envelope {
            topic: topic.to_owned(),
            payload: payload.to_vec(),
            correlation_id: None,
            reply_to: None,
            redelivered: false,
        }
    }

    /// Encodes the topic and payload into one wire body. Never fails.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.topic.len() + 1 + self.payload.len());
        body.extend_from_slice(self.topic.as_bytes());
        body.push(ENVELOPE_DELIMITER);
        body.extend_from_slice(&self.payload);
        body
    }

    /// Decodes a wire body by splitting at the first delimiter.
    ///
    /// Fails with `MalformedEnvelope` when no delimiter is present or the
    /// topic bytes are not valid UTF-8.
    pub fn decode(body: &[u8]) -> Result<Envelope, MessagingError> {
        let at = body
            .iter()
            .position(|b| *b == ENVELOPE_DELIMITER)
            .ok_or_else(|| {
                MessagingError::MalformedEnvelope("body has no topic delimiter".to_owned())
            })?;

        let topic = std::str::from_utf8(&body[..at]).map_err(|err| {
            MessagingError::MalformedEnvelope(format!("topic is not valid utf-8: {err}"))
        })?;

        Ok(Envelope::new(topic, &body[at + 1..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let envelope = Envelope::new("something.test", b"hello");
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.topic, "something.test");
        assert_eq!(decoded.payload, b"hello");
    }

    #[test]
    fn payload_may_contain_the_delimiter() {
        let envelope = Envelope::new("t", b"a:b:c");
        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.topic, "t");
        assert_eq!(decoded.payload, b"a:b:c");
    }

    #[test]
    fn empty_payload_round_trips() {
        let decoded = Envelope::decode(&Envelope::new("t", b"").encode()).unwrap();
        assert_eq!(decoded.topic, "t");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn missing_delimiter_is_malformed() {
        let err = Envelope::decode(b"no delimiter here").unwrap_err();
        assert!(matches!(err, MessagingError::MalformedEnvelope(_)));
    }

    #[test]
    fn non_utf8_topic_is_malformed() {
        let err = Envelope::decode(&[0xff, 0xfe, b':', b'x']).unwrap_err();
        assert!(matches!(err, MessagingError::MalformedEnvelope(_)));
    }
}
