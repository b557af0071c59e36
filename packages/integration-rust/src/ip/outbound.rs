//! Sending datagram adapter.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use weft_core::{headers, Envelope, HeaderValue};

use super::error::SendError;
use super::mapper::DatagramMapper;
use super::socket::DatagramSocket;
use crate::channel::MessageHandler;
use crate::config::{Destination, SenderConfig};

/// Sends envelope payloads as datagrams.
///
/// The socket is bound on the first send unless one is shared up front with
/// [`with_shared_socket`](Self::with_shared_socket), typically the receiving
/// adapter's socket so replies leave from the port the request arrived on.
pub struct DatagramSender {
    config: SenderConfig,
    mapper: DatagramMapper,
    socket: OnceCell<Arc<DatagramSocket>>,
}

impl DatagramSender {
    #[must_use]
    pub fn new(config: SenderConfig) -> Self {
        Self {
            mapper: DatagramMapper::new(config.check_length),
            config,
            socket: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_shared_socket(self, socket: Arc<DatagramSocket>) -> Self {
        Self {
            socket: OnceCell::new_with(Some(socket)),
            ..self
        }
    }

    #[must_use]
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    async fn socket(&self) -> Result<&Arc<DatagramSocket>, SendError> {
        self.socket
            .get_or_try_init(|| async {
                let socket = DatagramSocket::bind_sender(
                    self.config.local_address,
                    self.config.multicast.as_ref(),
                )
                .map_err(SendError::Bind)?;
                if let Ok(local) = socket.local_addr() {
                    info!(%local, "datagram sender bound");
                }
                Ok(Arc::new(socket))
            })
            .await
    }

    /// Resolves where `envelope` should be sent.
    ///
    /// # Errors
    ///
    /// - [`SendError::NoDestination`] if the destination header is missing.
    /// - [`SendError::InvalidAddress`] if it does not resolve.
    pub async fn destination(&self, envelope: &Envelope) -> Result<SocketAddr, SendError> {
        match &self.config.destination {
            Destination::Fixed { address } => Ok(*address),
            Destination::Header { name } => {
                let value = envelope.headers().get_str(name).ok_or_else(|| {
                    SendError::NoDestination {
                        header: name.clone(),
                    }
                })?;
                resolve(value).await
            }
            Destination::ReplyToSource => reply_address(envelope),
        }
    }

    /// Sends the payload of `envelope` and returns the destination.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] if the destination cannot be resolved, the
    /// payload cannot be serialized, or the send fails.
    pub async fn send(&self, envelope: &Envelope) -> Result<SocketAddr, SendError> {
        let destination = self.destination(envelope).await?;
        let datagram = self.mapper.to_datagram(envelope)?;
        let socket = self.socket().await?;
        socket
            .send_to(&datagram, destination)
            .await
            .map_err(|source| SendError::Io {
                destination,
                source,
            })?;
        debug!(%destination, len = datagram.len(), "datagram sent");
        Ok(destination)
    }
}

async fn resolve(value: &str) -> Result<SocketAddr, SendError> {
    let invalid = || SendError::InvalidAddress {
        value: value.to_string(),
    };
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    tokio::net::lookup_host(value)
        .await
        .map_err(|_| invalid())?
        .next()
        .ok_or_else(invalid)
}

fn reply_address(envelope: &Envelope) -> Result<SocketAddr, SendError> {
    let found = envelope.headers();
    if let Some(packet) = found.get_str(headers::IP_PACKET_ADDRESS) {
        return packet
            .parse()
            .map_err(|_| SendError::InvalidAddress {
                value: packet.to_string(),
            });
    }
    let ip = found
        .get_str(headers::IP_ADDRESS)
        .ok_or_else(|| SendError::NoDestination {
            header: headers::IP_PACKET_ADDRESS.to_string(),
        })?;
    let port = found
        .get(headers::IP_PORT)
        .and_then(HeaderValue::as_int)
        .ok_or_else(|| SendError::NoDestination {
            header: headers::IP_PORT.to_string(),
        })?;
    let invalid = || SendError::InvalidAddress {
        value: format!("{ip}:{port}"),
    };
    let ip: IpAddr = ip.parse().map_err(|_| invalid())?;
    let port = u16::try_from(port).map_err(|_| invalid())?;
    Ok(SocketAddr::new(ip, port))
}

#[async_trait]
impl MessageHandler for DatagramSender {
    async fn handle(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.send(&envelope).await?;
        Ok(())
    }
}

impl std::fmt::Debug for DatagramSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramSender")
            .field("destination", &self.config.destination)
            .field("bound", &self.socket.initialized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use weft_core::Payload;

    use super::*;
    use crate::channel::{PollableChannel, QueueChannel};
    use crate::config::ReceiverConfig;
    use crate::ip::DatagramReceivingAdapter;

    fn loopback_sender(destination: Destination) -> DatagramSender {
        DatagramSender::new(SenderConfig {
            destination,
            local_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..SenderConfig::default()
        })
    }

    fn loopback_receiver(check_length: bool) -> ReceiverConfig {
        ReceiverConfig {
            local_address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            check_length,
            shutdown_grace_ms: 1_000,
            ..ReceiverConfig::default()
        }
    }

    #[tokio::test]
    async fn sender_reaches_receiver_with_length_prefix() {
        let output = Arc::new(QueueChannel::new("output", 2));
        let adapter = DatagramReceivingAdapter::new(loopback_receiver(true), output.clone());
        let port = adapter.start().await.unwrap();

        let sender = DatagramSender::new(SenderConfig {
            destination: Destination::Fixed {
                address: SocketAddr::from(([127, 0, 0, 1], port)),
            },
            local_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            check_length: true,
            multicast: None,
        });
        sender.send(&Envelope::new("hello")).await.unwrap();

        let received = output.receive(Duration::from_secs(10)).await.unwrap();
        assert_eq!(received.payload(), &Payload::from(&b"hello"[..]));
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn replies_leave_from_shared_socket() {
        let output = Arc::new(QueueChannel::new("output", 2));
        let adapter = DatagramReceivingAdapter::new(loopback_receiver(false), output.clone());
        let port = adapter.start().await.unwrap();
        let replier = loopback_sender(Destination::ReplyToSource)
            .with_shared_socket(adapter.socket().unwrap());

        let client = DatagramSocket::bind(SocketAddr::from(([127, 0, 0, 1], 0)), None).unwrap();
        client
            .send_to(b"ping", SocketAddr::from(([127, 0, 0, 1], port)))
            .await
            .unwrap();
        let request = output.receive(Duration::from_secs(10)).await.unwrap();

        let reply = Envelope::builder("pong")
            .copy_headers(request.headers())
            .build();
        let sent_to = replier.send(&reply).await.unwrap();
        assert_eq!(sent_to, client.local_addr().unwrap());

        let mut buf = [0u8; 16];
        let (len, from) = tokio::time::timeout(Duration::from_secs(10), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"pong");
        assert_eq!(from.port(), port);
        adapter.stop().await.unwrap();
    }

    #[tokio::test]
    async fn destination_from_header() {
        let sender = loopback_sender(Destination::Header {
            name: "target".to_string(),
        });

        let env = Envelope::builder("x").header("target", "127.0.0.1:9999").build();
        assert_eq!(
            sender.destination(&env).await.unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9999))
        );

        let missing = sender.destination(&Envelope::new("x")).await.unwrap_err();
        assert!(matches!(missing, SendError::NoDestination { header } if header == "target"));

        let bad = Envelope::builder("x").header("target", "not an address").build();
        assert!(matches!(
            sender.destination(&bad).await.unwrap_err(),
            SendError::InvalidAddress { .. }
        ));
    }

    #[tokio::test]
    async fn reply_falls_back_to_address_and_port() {
        let sender = loopback_sender(Destination::ReplyToSource);
        let env = Envelope::builder("x")
            .header(headers::IP_ADDRESS, "10.0.0.7")
            .header(headers::IP_PORT, 4000u16)
            .build();
        assert_eq!(
            sender.destination(&env).await.unwrap(),
            SocketAddr::from(([10, 0, 0, 7], 4000))
        );
        assert!(matches!(
            sender.destination(&Envelope::new("x")).await.unwrap_err(),
            SendError::NoDestination { .. }
        ));
    }

    #[tokio::test]
    async fn group_payload_is_not_sent() {
        let sender = loopback_sender(Destination::Fixed {
            address: SocketAddr::from(([127, 0, 0, 1], 9)),
        });
        let group = Envelope::new(Payload::Group(vec![Envelope::new("a")]));
        assert!(matches!(
            sender.send(&group).await.unwrap_err(),
            SendError::Mapping(_)
        ));
        assert!(!sender.socket.initialized());
    }
}
