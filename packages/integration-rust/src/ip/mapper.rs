//! Conversion between raw datagrams and envelopes.

use std::net::SocketAddr;

use bytes::{BufMut, Bytes, BytesMut};
use weft_core::{headers, Envelope};

use super::error::MappingError;

const LENGTH_PREFIX: usize = 4;

/// Maps datagrams to envelopes and back.
///
/// With `check_length`, outbound datagrams carry a 4-byte big-endian payload
/// length and inbound datagrams must carry a matching one, which is stripped.
#[derive(Debug, Clone, Copy, Default)]
pub struct DatagramMapper {
    check_length: bool,
}

impl DatagramMapper {
    #[must_use]
    pub fn new(check_length: bool) -> Self {
        Self { check_length }
    }

    #[must_use]
    pub fn check_length(&self) -> bool {
        self.check_length
    }

    /// Builds an envelope from a datagram received from `source`.
    ///
    /// The envelope carries the `ip_address`, `ip_port` and
    /// `ip_packetAddress` headers.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError`] when the length prefix is missing or wrong.
    pub fn to_envelope(&self, data: &[u8], source: SocketAddr) -> Result<Envelope, MappingError> {
        let body = if self.check_length {
            let (prefix, rest) = data
                .split_first_chunk::<LENGTH_PREFIX>()
                .ok_or(MappingError::TooShort { len: data.len() })?;
            let declared = u32::from_be_bytes(*prefix);
            if usize::try_from(declared).ok() != Some(rest.len()) {
                return Err(MappingError::LengthMismatch {
                    declared,
                    actual: rest.len(),
                });
            }
            rest
        } else {
            data
        };

        Ok(Envelope::builder(Bytes::copy_from_slice(body))
            .header(headers::IP_ADDRESS, source.ip().to_string())
            .header(headers::IP_PORT, source.port())
            .header(headers::IP_PACKET_ADDRESS, source.to_string())
            .build())
    }

    /// Serializes the envelope payload into a datagram.
    ///
    /// # Errors
    ///
    /// Returns [`MappingError::Payload`] for payloads that are not bytes or
    /// text.
    pub fn to_datagram(&self, envelope: &Envelope) -> Result<Bytes, MappingError> {
        let body = envelope.payload().to_bytes()?;
        if !self.check_length {
            return Ok(body);
        }
        let len = u32::try_from(body.len()).map_err(|_| MappingError::TooLong { len: body.len() })?;
        let mut framed = BytesMut::with_capacity(LENGTH_PREFIX + body.len());
        framed.put_u32(len);
        framed.put_slice(&body);
        Ok(framed.freeze())
    }
}

#[cfg(test)]
mod tests {
    use weft_core::{HeaderValue, Payload};

    use super::*;

    fn source() -> SocketAddr {
        "127.0.0.1:4567".parse().unwrap()
    }

    #[test]
    fn inbound_headers_carry_source() {
        let env = DatagramMapper::default().to_envelope(b"ABCD", source()).unwrap();

        assert_eq!(env.payload(), &Payload::from(&b"ABCD"[..]));
        assert_eq!(env.headers().get_str(headers::IP_ADDRESS), Some("127.0.0.1"));
        assert_eq!(env.header(headers::IP_PORT), Some(&HeaderValue::from(4567u16)));
        assert_eq!(
            env.headers().get_str(headers::IP_PACKET_ADDRESS),
            Some("127.0.0.1:4567")
        );
    }

    #[test]
    fn length_prefix_is_added_and_stripped() {
        let mapper = DatagramMapper::new(true);
        let datagram = mapper.to_datagram(&Envelope::new("hello")).unwrap();
        assert_eq!(&datagram[..4], &[0, 0, 0, 5]);

        let env = mapper.to_envelope(&datagram, source()).unwrap();
        assert_eq!(env.payload().to_bytes().unwrap(), Bytes::from_static(b"hello"));
    }

    #[test]
    fn wrong_length_prefix_is_rejected() {
        let mapper = DatagramMapper::new(true);
        let err = mapper.to_envelope(&[0, 0, 0, 9, b'a'], source()).unwrap_err();
        assert!(matches!(
            err,
            MappingError::LengthMismatch {
                declared: 9,
                actual: 1
            }
        ));
        assert!(matches!(
            mapper.to_envelope(&[0, 1], source()).unwrap_err(),
            MappingError::TooShort { len: 2 }
        ));
    }

    #[test]
    fn largest_length_prefix_is_rejected_not_truncated() {
        let mut datagram = vec![0xFF; 4];
        datagram.extend_from_slice(b"short");
        let err = DatagramMapper::new(true)
            .to_envelope(&datagram, source())
            .unwrap_err();
        assert!(matches!(
            err,
            MappingError::LengthMismatch {
                declared: u32::MAX,
                actual: 5
            }
        ));
    }

    #[test]
    fn group_payload_cannot_be_sent() {
        let group = Envelope::new(Payload::Group(vec![Envelope::new("a")]));
        let err = DatagramMapper::default().to_datagram(&group).unwrap_err();
        assert!(matches!(err, MappingError::Payload(_)));
    }
}
