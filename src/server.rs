//! The collector runtime: UDP reader, bounded work queue, decoder pool.
//!
//! One reader thread owns the socket and pushes `(payload, source)` pairs
//! onto a bounded queue, dropping datagrams when it is full. A pool of
//! decoder threads drains the queue, runs the full decode pipeline per
//! datagram, and delivers events to the sink. The reader polls with a short
//! timeout so it observes the stop flag promptly; on stop it exits first,
//! the queue drains, and the workers follow.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use snafu::{ResultExt, Snafu};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info};

use crate::config::{CollectorConfig, ConfigError};
use crate::fields::FieldCatalog;
use crate::internal_events::{
    BytesReceived, DatagramDropped, EventsReceived, SocketBindError, SocketReceiveError,
};
use crate::protocols::ProtocolParser;
use crate::sinks::EventSink;
use crate::templates::TemplateCache;

/// Longest the reader or a worker blocks before checking for shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Pause after a non-timeout socket error before reading again.
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("{source}"))]
    Config { source: ConfigError },

    #[snafu(display("unable to bind {address}: {source}"))]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[snafu(display("unable to spawn decoder thread: {source}"))]
    Spawn { source: std::io::Error },
}

type Datagram = (Vec<u8>, SocketAddr);

pub struct FlowCollector {
    config: CollectorConfig,
    parser: Arc<ProtocolParser>,
    sink: Arc<dyn EventSink>,
    shutdown: Arc<AtomicBool>,
}

impl FlowCollector {
    pub fn new(
        config: CollectorConfig,
        catalog: FieldCatalog,
        sink: Arc<dyn EventSink>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let templates = Arc::new(TemplateCache::new(config.template_ttl()));
        let parser = Arc::new(ProtocolParser::new(
            Arc::new(catalog),
            templates,
            config.target.clone(),
            config.versions.clone(),
        ));
        Self {
            config,
            parser,
            sink,
            shutdown,
        }
    }

    /// Run until the stop flag is raised. Blocks the calling thread as the
    /// datagram reader.
    pub fn run(self) -> Result<(), ServerError> {
        let address = self.config.address().ok_or(ServerError::Config {
            source: ConfigError::Invalid {
                reasons: vec!["port is required".to_owned()],
            },
        })?;

        let socket = match bind_socket(address)
            .and_then(|socket| socket.set_read_timeout(Some(POLL_INTERVAL)).map(|()| socket))
        {
            Ok(socket) => socket,
            Err(source) => {
                emit!(SocketBindError {
                    address,
                    error: &source,
                });
                return Err(ServerError::Bind { address, source });
            }
        };

        info!(
            message = "Listening for flow datagrams.",
            %address,
            workers = self.config.workers,
            queue_size = self.config.queue_size,
        );

        let (tx, rx) = bounded::<Datagram>(self.config.queue_size);

        let mut workers = Vec::with_capacity(self.config.workers);
        for worker_id in 0..self.config.workers {
            let rx = rx.clone();
            let parser = Arc::clone(&self.parser);
            let sink = Arc::clone(&self.sink);
            let handle = thread::Builder::new()
                .name(format!("flowcap-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, rx, parser, sink))
                .context(SpawnSnafu)?;
            workers.push(handle);
        }
        drop(rx);

        reader_loop(socket, tx, self.config.buffer_size, &self.shutdown);

        // The sender is gone; workers finish the queued datagrams and exit.
        for handle in workers {
            let _ = handle.join();
        }
        info!(message = "Collector stopped.");
        Ok(())
    }
}

fn bind_socket(address: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if address.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    Ok(socket.into())
}

fn reader_loop(
    socket: UdpSocket,
    tx: Sender<Datagram>,
    buffer_size: usize,
    shutdown: &AtomicBool,
) {
    // One spare byte distinguishes a maximum-size datagram from one the
    // kernel truncated.
    let mut buffer = vec![0u8; buffer_size + 1];

    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buffer) {
            Ok((len, peer_addr)) => {
                if len > buffer_size {
                    emit!(DatagramDropped {
                        peer_addr,
                        reason: "oversize datagram",
                    });
                    continue;
                }
                emit!(BytesReceived {
                    byte_size: len,
                    peer_addr,
                });
                match tx.try_send((buffer[..len].to_vec(), peer_addr)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => emit!(DatagramDropped {
                        peer_addr,
                        reason: "queue full",
                    }),
                    Err(TrySendError::Disconnected(_)) => break,
                }
            }
            Err(error)
                if matches!(
                    error.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(error) => {
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                emit!(SocketReceiveError { error });
                thread::sleep(RECEIVE_BACKOFF);
            }
        }
    }
    // Dropping the socket here releases the port on every exit path.
}

fn worker_loop(
    worker_id: usize,
    rx: Receiver<Datagram>,
    parser: Arc<ProtocolParser>,
    sink: Arc<dyn EventSink>,
) {
    debug!(message = "Decoder worker started.", worker_id);
    loop {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok((payload, peer_addr)) => {
                let events = parser.parse(&payload, peer_addr);
                if events.is_empty() {
                    continue;
                }
                emit!(EventsReceived {
                    count: events.len(),
                    peer_addr,
                });
                for event in events {
                    sink.deliver(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!(message = "Decoder worker stopped.", worker_id);
}
