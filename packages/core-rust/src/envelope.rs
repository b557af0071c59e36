//! Message envelope: an immutable payload plus a header map.
//!
//! Envelopes are created at ingestion and never mutated afterwards. Re-emission
//! with different headers goes through [`Envelope::to_builder`], which produces a
//! new envelope with a fresh id and timestamp.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{ClockSource, SystemClock};

/// Reserved header names understood by the aggregation and datagram layers.
pub mod headers {
    /// Correlation key shared by all members of one group.
    pub const CORRELATION_ID: &str = "correlationId";
    /// 1-based position of this envelope within its group.
    pub const SEQUENCE_NUMBER: &str = "sequenceNumber";
    /// Total number of envelopes expected in the group.
    pub const SEQUENCE_SIZE: &str = "sequenceSize";
    /// Source IP address of a received datagram.
    pub const IP_ADDRESS: &str = "ip_address";
    /// Source port of a received datagram.
    pub const IP_PORT: &str = "ip_port";
    /// `ip:port` of the sender, usable as a reply destination.
    pub const IP_PACKET_ADDRESS: &str = "ip_packetAddress";
    /// Number of attempts made before an error envelope was published.
    pub const DELIVERY_ATTEMPT: &str = "deliveryAttempt";
    /// Set on a group emitted by the timeout sweep before it completed.
    pub const PARTIAL_RESULT: &str = "partialResult";
}

/// A single header value.
///
/// Restricted to hashable variants so any header can serve as a correlation key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    String(String),
    Uuid(Uuid),
}

impl HeaderValue {
    /// Returns the string form if this is a `String` value.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer form, parsing `String` values when possible.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{v}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::String(v) => f.write_str(v),
            Self::Uuid(v) => write!(f, "{v}"),
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u16> for HeaderValue {
    fn from(v: u16) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<u32> for HeaderValue {
    fn from(v: u32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<usize> for HeaderValue {
    fn from(v: usize) -> Self {
        Self::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<Uuid> for HeaderValue {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

/// Ordered header map. Uses `BTreeMap` for deterministic iteration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Headers(BTreeMap<String, HeaderValue>);

impl Headers {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.0.get(name)
    }

    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(HeaderValue::as_str)
    }

    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(HeaderValue::as_int)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Description of a failure, used as the payload of error envelopes.
///
/// The error chain is flattened to strings so the payload stays `Clone` and
/// serializable: `description` is the outermost error, `root_cause` the
/// innermost `source()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePayload {
    pub description: String,
    pub root_cause: String,
    pub failed_envelope: Option<Box<Envelope>>,
}

impl FailurePayload {
    /// Builds a failure payload by walking the `source()` chain of `error`.
    #[must_use]
    pub fn from_error(
        error: &(dyn std::error::Error + 'static),
        failed_envelope: Option<Envelope>,
    ) -> Self {
        let mut root = error;
        while let Some(next) = root.source() {
            root = next;
        }
        Self {
            description: error.to_string(),
            root_cause: root.to_string(),
            failed_envelope: failed_envelope.map(Box::new),
        }
    }
}

/// Returned when a payload is read as a kind it does not hold.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} payload, found {actual}")]
pub struct PayloadError {
    pub expected: &'static str,
    pub actual: &'static str,
}

/// Envelope payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Raw bytes, e.g. a datagram body.
    Bytes(Bytes),
    /// UTF-8 text.
    Text(String),
    /// Members of a released correlation group, in arrival order.
    Group(Vec<Envelope>),
    /// Error envelope body.
    Failure(FailurePayload),
}

impl Payload {
    /// Short name of the payload variant, for logs and errors.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bytes(_) => "bytes",
            Self::Text(_) => "text",
            Self::Group(_) => "group",
            Self::Failure(_) => "failure",
        }
    }

    /// Returns the wire bytes of a `Bytes` or `Text` payload.
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] for `Group` and `Failure` payloads.
    pub fn to_bytes(&self) -> Result<Bytes, PayloadError> {
        match self {
            Self::Bytes(b) => Ok(b.clone()),
            Self::Text(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            other => Err(PayloadError {
                expected: "bytes",
                actual: other.kind(),
            }),
        }
    }

    #[must_use]
    pub fn as_group(&self) -> Option<&[Envelope]> {
        match self {
            Self::Group(members) => Some(members),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_failure(&self) -> Option<&FailurePayload> {
        match self {
            Self::Failure(f) => Some(f),
            _ => None,
        }
    }
}

impl From<Bytes> for Payload {
    fn from(v: Bytes) -> Self {
        Self::Bytes(v)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(v))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(v: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(v))
    }
}

impl From<String> for Payload {
    fn from(v: String) -> Self {
        Self::Text(v)
    }
}

impl From<&str> for Payload {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<FailurePayload> for Payload {
    fn from(v: FailurePayload) -> Self {
        Self::Failure(v)
    }
}

/// Immutable unit of transport between components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: Uuid,
    timestamp: u64,
    headers: Headers,
    payload: Payload,
}

impl Envelope {
    /// Creates an envelope with no headers.
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::builder(payload).build()
    }

    /// Starts building an envelope around `payload`.
    pub fn builder(payload: impl Into<Payload>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Copies payload and headers into a builder for re-emission.
    ///
    /// The built envelope receives a new id and timestamp.
    #[must_use]
    pub fn to_builder(&self) -> EnvelopeBuilder {
        EnvelopeBuilder {
            payload: self.payload.clone(),
            headers: self.headers.0.clone(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time in milliseconds since Unix epoch.
    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    #[must_use]
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Consumes the envelope, returning its payload.
    #[must_use]
    pub fn into_payload(self) -> Payload {
        self.payload
    }
}

/// Builder for [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    payload: Payload,
    headers: BTreeMap<String, HeaderValue>,
}

impl EnvelopeBuilder {
    /// Sets a header, replacing any previous value.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Copies every header from `headers`, replacing existing names.
    #[must_use]
    pub fn copy_headers(mut self, headers: &Headers) -> Self {
        for (name, value) in headers.iter() {
            self.headers.insert(name.to_string(), value.clone());
        }
        self
    }

    #[must_use]
    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    #[must_use]
    pub fn correlation_id(self, value: impl Into<HeaderValue>) -> Self {
        self.header(headers::CORRELATION_ID, value)
    }

    /// Sets `sequenceNumber` and `sequenceSize` together.
    #[must_use]
    pub fn sequence(self, number: usize, size: usize) -> Self {
        self.header(headers::SEQUENCE_NUMBER, number)
            .header(headers::SEQUENCE_SIZE, size)
    }

    /// Builds the envelope, stamping it with the system clock.
    #[must_use]
    pub fn build(self) -> Envelope {
        self.build_at(&SystemClock)
    }

    /// Builds the envelope, stamping it with `clock`.
    #[must_use]
    pub fn build_at(self, clock: &dyn ClockSource) -> Envelope {
        Envelope {
            id: Uuid::new_v4(),
            timestamp: clock.now(),
            headers: Headers(self.headers),
            payload: self.payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] Inner);

    #[derive(Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct Inner;

    #[test]
    fn builder_sets_headers_and_payload() {
        let env = Envelope::builder("hello")
            .correlation_id("K1")
            .sequence(2, 3)
            .header("custom", true)
            .build();

        assert_eq!(env.payload(), &Payload::Text("hello".to_string()));
        assert_eq!(env.headers().get_str(headers::CORRELATION_ID), Some("K1"));
        assert_eq!(env.headers().get_int(headers::SEQUENCE_NUMBER), Some(2));
        assert_eq!(env.headers().get_int(headers::SEQUENCE_SIZE), Some(3));
        assert_eq!(env.header("custom"), Some(&HeaderValue::Bool(true)));
        assert_eq!(env.headers().len(), 4);
    }

    #[test]
    fn to_builder_copies_but_gets_new_identity() {
        let original = Envelope::builder(b"ABCD".as_slice())
            .correlation_id(7_i64)
            .build();
        let copy = original.to_builder().header("extra", "x").build();

        assert_ne!(original.id(), copy.id());
        assert_eq!(copy.payload(), original.payload());
        assert_eq!(copy.header(headers::CORRELATION_ID), Some(&HeaderValue::Int(7)));
        assert!(copy.headers().contains("extra"));
        assert!(!original.headers().contains("extra"));
    }

    #[test]
    fn build_at_uses_clock() {
        let clock = ManualClock::new(42);
        let env = Envelope::builder("x").build_at(&clock);
        assert_eq!(env.timestamp(), 42);
    }

    #[test]
    fn string_header_parses_as_int() {
        let env = Envelope::builder("x").header("n", " 12 ").build();
        assert_eq!(env.headers().get_int("n"), Some(12));
        assert_eq!(env.headers().get_int("missing"), None);
    }

    #[test]
    fn to_bytes_accepts_bytes_and_text_only() {
        assert_eq!(
            Payload::from(b"ABCD".as_slice()).to_bytes().unwrap(),
            Bytes::from_static(b"ABCD")
        );
        assert_eq!(
            Payload::from("hi").to_bytes().unwrap(),
            Bytes::from_static(b"hi")
        );
        let err = Payload::Group(Vec::new()).to_bytes().unwrap_err();
        assert_eq!(err.actual, "group");
    }

    #[test]
    fn failure_payload_walks_to_root_cause() {
        let failed = Envelope::new("payload");
        let failure = FailurePayload::from_error(&Outer(Inner), Some(failed.clone()));

        assert_eq!(failure.description, "outer failure");
        assert_eq!(failure.root_cause, "disk on fire");
        assert_eq!(failure.failed_envelope.as_deref(), Some(&failed));
    }

    #[test]
    fn envelope_serializes_to_json() {
        let env = Envelope::builder("x").correlation_id("K").build();
        let json = serde_json::to_string(&env).unwrap();
        let back: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }
}
