use std::{
    io,
    net::{IpAddr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::Semaphore,
    task::JoinHandle,
    time,
};
use tokio_util::sync::CancellationToken;

mod record;
mod request;

pub(crate) use request::Dispatcher;

use crate::{config::ServerConfig, Error};

const DEFAULT_PORT: u16 = 53;
const UDP_PACKET_SIZE: usize = 4096;
const TCP_LISTEN_BACKLOG: i32 = 128;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// The paired UDP and TCP listeners feeding one dispatcher through a
/// bounded pool of request workers.
pub(crate) struct DnsServer {
    token: CancellationToken,
    workers: Arc<Semaphore>,
    max_inflight: usize,
    dropped: Arc<AtomicU64>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    listeners: Vec<JoinHandle<()>>,
}

/// Binds on the IPv6 wildcard by default with the v6-only flag off, so
/// on most systems a single socket also accepts IPv4 traffic mapped as
/// `::ffff:a.b.c.d`.
fn bind_socket(addr: SocketAddr, ty: Type, protocol: Protocol) -> Result<Socket, Error> {
    let socket = Socket::new(Domain::for_address(addr), ty, Some(protocol))?;

    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;

    Ok(socket)
}

impl DnsServer {
    pub(crate) async fn new(
        server_config: &ServerConfig,
        dispatcher: Dispatcher,
        max_inflight: usize,
    ) -> Result<Self, Error> {
        let address = server_config
            .address
            .unwrap_or(IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        let addr = SocketAddr::new(address, server_config.port.unwrap_or(DEFAULT_PORT));

        let udp = UdpSocket::from_std(bind_socket(addr, Type::DGRAM, Protocol::UDP)?.into())?;
        let udp_addr = udp.local_addr()?;
        tracing::info!("Server listening on udp://{}", udp_addr);

        let tcp_socket = bind_socket(addr, Type::STREAM, Protocol::TCP)?;
        tcp_socket.listen(TCP_LISTEN_BACKLOG)?;
        let tcp = TcpListener::from_std(tcp_socket.into())?;
        let tcp_addr = tcp.local_addr()?;
        tracing::info!("Server listening on tcp://{}", tcp_addr);

        let token = CancellationToken::new();
        let workers = Arc::new(Semaphore::new(max_inflight));
        let dropped = Arc::new(AtomicU64::new(0));

        let listeners = vec![
            tokio::spawn(udp_loop(
                Arc::new(udp),
                dispatcher.clone(),
                workers.clone(),
                dropped.clone(),
                token.clone(),
            )),
            tokio::spawn(tcp_loop(
                tcp,
                dispatcher,
                workers.clone(),
                dropped.clone(),
                token.clone(),
            )),
        ];

        Ok(Self {
            token,
            workers,
            max_inflight,
            dropped,
            udp_addr,
            tcp_addr,
            listeners,
        })
    }

    pub(crate) fn udp_local_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    pub(crate) fn tcp_local_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Requests dropped because the worker pool was at capacity.
    pub(crate) fn dropped_requests(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops both accept loops, closes the sockets and waits a bounded
    /// time for in-flight requests to finish.
    pub(crate) async fn shutdown(&mut self) {
        tracing::debug!("Shutting down DNS service");

        self.token.cancel();
        for listener in self.listeners.drain(..) {
            if let Err(e) = listener.await {
                tracing::error!(error = %e, "Listener task failed");
            }
        }

        let drained = time::timeout(
            SHUTDOWN_GRACE,
            self.workers.clone().acquire_many_owned(self.max_inflight as u32),
        )
        .await;
        if drained.is_err() {
            tracing::warn!("Timed out waiting for in-flight requests");
        }

        tracing::debug!(
            dropped = self.dropped_requests(),
            "DNS service stopped"
        );
    }
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    dispatcher: Dispatcher,
    workers: Arc<Semaphore>,
    dropped: Arc<AtomicU64>,
    token: CancellationToken,
) {
    let mut buf = vec![0u8; UDP_PACKET_SIZE];

    loop {
        let (len, client) = select! {
            _ = token.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(e) => {
                    tracing::warn!(error = %e, "UDP receive failed");
                    continue;
                }
            },
        };

        let Ok(permit) = workers.clone().try_acquire_owned() else {
            dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%client, "Dropping request, worker pool exhausted");
            continue;
        };

        let packet = buf[..len].to_vec();
        let socket = socket.clone();
        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let _permit = permit;

            if let Some(reply) = dispatcher.handle(&packet, client).await {
                if let Err(e) = socket.send_to(&reply, client).await {
                    tracing::debug!(error = %e, %client, "Failed to send UDP reply");
                }
            }
        });
    }
}

async fn tcp_loop(
    listener: TcpListener,
    dispatcher: Dispatcher,
    workers: Arc<Semaphore>,
    dropped: Arc<AtomicU64>,
    token: CancellationToken,
) {
    loop {
        let (stream, client) = select! {
            _ = token.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept failed");
                    continue;
                }
            },
        };

        let Ok(permit) = workers.clone().try_acquire_owned() else {
            dropped.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(%client, "Dropping request, worker pool exhausted");
            continue;
        };

        let dispatcher = dispatcher.clone();

        tokio::spawn(async move {
            let _permit = permit;

            if let Err(e) = serve_tcp(stream, client, dispatcher).await {
                tracing::debug!(error = %e, %client, "TCP request failed");
            }
        });
    }
}

/// Reads one length-prefixed DNS message, dispatches it and writes the
/// length-prefixed reply.
async fn serve_tcp(
    mut stream: TcpStream,
    client: SocketAddr,
    dispatcher: Dispatcher,
) -> Result<(), Error> {
    let len = stream.read_u16().await? as usize;
    let mut packet = vec![0u8; len];
    stream.read_exact(&mut packet).await?;

    // A client that sent more than the advertised length is framing
    // garbage; refuse to answer it.
    let mut probe = [0u8; 1];
    match stream.try_read(&mut probe) {
        Ok(n) if n > 0 => {
            return Err(Error::IoError {
                source: io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("TCP packet larger than expected ({} byte prefix)", len),
                ),
            });
        }
        _ => {}
    }

    if let Some(reply) = dispatcher.handle(&packet, client).await {
        if reply.len() > usize::from(u16::MAX) {
            return Err(Error::IoError {
                source: io::Error::new(io::ErrorKind::InvalidData, "reply too large for TCP frame"),
            });
        }

        stream.write_u16(reply.len() as u16).await?;
        stream.write_all(&reply).await?;
    }

    Ok(())
}
