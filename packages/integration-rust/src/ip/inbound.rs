//! Receiving datagram adapter (unicast or multicast).

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use bytes::Bytes;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use super::dispatch::Dispatcher;
use super::error::AdapterError;
use super::mapper::DatagramMapper;
use super::socket::DatagramSocket;
use crate::channel::MessageChannel;
use crate::config::ReceiverConfig;

/// Lifecycle state of a [`DatagramReceivingAdapter`].
///
/// `Stopped -> Starting -> Listening -> Stopping -> Stopped`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

struct Running {
    socket: Arc<DatagramSocket>,
    dispatcher: Arc<Dispatcher>,
    receive_loop: JoinHandle<Result<(), AdapterError>>,
}

/// Receives datagrams and dispatches them as envelopes to an output channel.
///
/// One receive loop task per running adapter does socket I/O only; mapping
/// and sending happen on bounded dispatch tasks (see [`Dispatcher`]). A
/// datagram arriving while all `pool_size` dispatch slots are busy is
/// rejected to the error channel.
pub struct DatagramReceivingAdapter {
    config: ReceiverConfig,
    output: Arc<dyn MessageChannel>,
    errors: Option<Arc<dyn MessageChannel>>,
    state: Arc<ArcSwap<AdapterState>>,
    socket: ArcSwapOption<DatagramSocket>,
    lifecycle: Mutex<Option<Running>>,
}

impl DatagramReceivingAdapter {
    #[must_use]
    pub fn new(config: ReceiverConfig, output: Arc<dyn MessageChannel>) -> Self {
        Self {
            config,
            output,
            errors: None,
            state: Arc::new(ArcSwap::from_pointee(AdapterState::Stopped)),
            socket: ArcSwapOption::empty(),
            lifecycle: Mutex::new(None),
        }
    }

    /// Routes mapping and dispatch failures to `channel` instead of only
    /// logging them.
    #[must_use]
    pub fn with_error_channel(mut self, channel: Arc<dyn MessageChannel>) -> Self {
        self.errors = Some(channel);
        self
    }

    #[must_use]
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> AdapterState {
        **self.state.load()
    }

    /// `true` while listening on an open socket.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == AdapterState::Listening
            && self.socket.load().as_ref().is_some_and(|s| !s.is_closed())
    }

    /// The bound socket, for sharing with a [`DatagramSender`](super::DatagramSender).
    #[must_use]
    pub fn socket(&self) -> Option<Arc<DatagramSocket>> {
        self.socket.load_full()
    }

    /// Port the adapter is bound to, once started.
    #[must_use]
    pub fn port(&self) -> Option<u16> {
        self.socket
            .load()
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .map(|addr| addr.port())
    }

    fn bind(&self) -> Result<DatagramSocket, AdapterError> {
        let config = &self.config;
        if let Some(multicast) = &config.multicast {
            return DatagramSocket::bind_multicast(
                config.port,
                multicast,
                config.so_receive_buffer_size,
            )
            .map_err(|source| AdapterError::Bind {
                addr: format!("{}:{} (group {})", Ipv4Addr::UNSPECIFIED, config.port, multicast.group),
                source,
            });
        }
        let ip = config
            .local_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, config.port);
        DatagramSocket::bind(addr, config.so_receive_buffer_size).map_err(|source| {
            AdapterError::Bind {
                addr: addr.to_string(),
                source,
            }
        })
    }

    /// Binds the socket and starts the receive loop. Returns the bound port.
    ///
    /// # Errors
    ///
    /// - [`AdapterError::AlreadyRunning`] if started twice.
    /// - [`AdapterError::Bind`] if the socket cannot be bound; the adapter
    ///   stays stopped.
    pub async fn start(&self) -> Result<u16, AdapterError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(AdapterError::AlreadyRunning);
        }
        self.state.store(Arc::new(AdapterState::Starting));

        let socket = match self.bind() {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.state.store(Arc::new(AdapterState::Stopped));
                return Err(e);
            }
        };
        let local = match socket.local_addr() {
            Ok(local) => local,
            Err(e) => {
                self.state.store(Arc::new(AdapterState::Stopped));
                return Err(e.into());
            }
        };

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&self.output),
            self.errors.clone(),
            DatagramMapper::new(self.config.check_length),
            self.config.pool_size,
            self.config.send_timeout(),
        ));
        let receive_loop = tokio::spawn(
            receive_loop(
                Arc::clone(&socket),
                Arc::clone(&dispatcher),
                Arc::clone(&self.state),
                self.config.receive_buffer_size,
            )
            .instrument(tracing::info_span!("udp_receive", port = local.port())),
        );

        self.socket.store(Some(Arc::clone(&socket)));
        *lifecycle = Some(Running {
            socket,
            dispatcher,
            receive_loop,
        });
        self.state.store(Arc::new(AdapterState::Listening));
        info!(%local, multicast = self.config.multicast.is_some(), "datagram adapter listening");
        Ok(local.port())
    }

    /// Closes the socket, ends the receive loop and waits up to the
    /// configured grace period for in-flight dispatches. No-op when stopped.
    ///
    /// # Errors
    ///
    /// - [`AdapterError::UnexpectedClose`] if the socket closed while the
    ///   adapter was listening.
    /// - [`AdapterError::ReceiveLoop`] if the receive loop panicked.
    pub async fn stop(&self) -> Result<(), AdapterError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            return Ok(());
        };
        self.state.store(Arc::new(AdapterState::Stopping));

        running.socket.close();
        let joined = running.receive_loop.await;
        running.dispatcher.shutdown();
        if !running
            .dispatcher
            .wait_for_drain(self.config.shutdown_grace())
            .await
        {
            warn!(
                in_flight = running.dispatcher.in_flight(),
                "dispatches still running after shutdown grace period"
            );
        }

        self.socket.store(None);
        self.state.store(Arc::new(AdapterState::Stopped));
        info!("datagram adapter stopped");
        joined.map_err(AdapterError::ReceiveLoop)?
    }
}

async fn receive_loop(
    socket: Arc<DatagramSocket>,
    dispatcher: Arc<Dispatcher>,
    state: Arc<ArcSwap<AdapterState>>,
    buffer_size: usize,
) -> Result<(), AdapterError> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok(Some((len, source))) => {
                debug!(%source, len, "datagram received");
                // Rejections are already routed by the dispatcher.
                let _ = dispatcher.submit(Bytes::copy_from_slice(&buf[..len]), source);
            }
            Ok(None) => break,
            Err(e) if socket.is_closed() => {
                debug!(error = %e, "receive failed on closed socket");
                break;
            }
            Err(e) => warn!(error = %e, "receive failed, continuing"),
        }
    }
    if **state.load() == AdapterState::Listening {
        error!("socket closed unexpectedly, adapter stopping");
        state.store(Arc::new(AdapterState::Stopped));
        dispatcher.shutdown();
        return Err(AdapterError::UnexpectedClose);
    }
    Ok(())
}

impl std::fmt::Debug for DatagramReceivingAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramReceivingAdapter")
            .field("state", &self.state())
            .field("port", &self.port())
            .field("output", &self.output.name())
            .finish_non_exhaustive()
    }
}

impl Drop for DatagramReceivingAdapter {
    fn drop(&mut self) {
        if let Some(socket) = self.socket.load().as_ref() {
            socket.close();
        }
    }
}
