mod blocking;
mod cache;
mod client_lookup;
mod config;
mod error;
mod exchange;
mod policy;
mod querier;
mod resolver;
mod upstream;
mod watcher;
mod wire;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use arc_swap::ArcSwap;
use clap::Parser;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::blocking::{Blocker, DefaultListFetcher, ListFetcher};
use crate::client_lookup::ClientLookup;
use crate::config::load_config;
use crate::exchange::{Exchanger, NetExchanger};
use crate::policy::{Policy, TlsIdentity};
use crate::resolver::Resolver;

#[derive(Parser, Debug)]
#[command(author, version, about = "Forwarding DNS proxy with overrides, conditional routing, blocking and caching", long_about = None)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short = 'c', long = "config", default_value = "config/veildns.json")]
    config: PathBuf,
    /// Start with built-in defaults when the configuration file is absent
    #[arg(long = "config-optional", default_value_t = false)]
    config_optional: bool,
    /// Enable debug logging
    #[arg(long = "debug", default_value_t = false)]
    debug: bool,
    /// UDP worker count (defaults to CPU cores)
    #[arg(long = "udp-workers", default_value_t = 0)]
    udp_workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.debug);

    let raw = load_config(&args.config, !args.config_optional).context("load initial config")?;
    let policy = Policy::from_config(&raw).context("validate config")?;
    let policy = Arc::new(ArcSwap::from_pointee(policy));

    let exchanger: Arc<dyn Exchanger> =
        Arc::new(NetExchanger::new().context("init upstream transports")?);
    let fetcher: Arc<dyn ListFetcher> =
        Arc::new(DefaultListFetcher::new().context("init list fetcher")?);
    let blocker = Arc::new(Blocker::new(policy.clone(), fetcher));
    blocker.load().await;
    let _refresher = blocker.spawn_refresher();
    let clients = Arc::new(ClientLookup::new(policy.clone(), exchanger.clone()));
    let resolver = Arc::new(Resolver::new(
        policy.clone(),
        blocker,
        clients,
        exchanger,
    ));

    watcher::spawn(args.config.clone(), policy.clone());

    let udp_workers = if args.udp_workers > 0 {
        args.udp_workers
    } else {
        num_cpus::get()
    };

    let snapshot = policy.load_full();
    let dns_specs = if snapshot.ports.dns.is_empty() {
        vec![":53".to_string()]
    } else {
        snapshot.ports.dns.0.clone()
    };

    for spec in &dns_specs {
        let addr = listen_addr(spec).with_context(|| format!("listen spec '{spec}'"))?;
        spawn_udp_workers(addr, udp_workers, resolver.clone())
            .with_context(|| format!("bind udp {addr}"))?;

        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("bind tcp {addr}"))?;
        spawn_tcp(listener, resolver.clone());
        info!(addr = %addr, "dns listener started");
    }

    if !snapshot.ports.tls.is_empty() {
        let identity = snapshot
            .tls_identity
            .clone()
            .context("tls ports configured without certificate material")?;
        let acceptor = tls_acceptor(&identity).context("load tls certificate")?;
        for spec in &snapshot.ports.tls.0 {
            let addr = listen_addr(spec).with_context(|| format!("tls listen spec '{spec}'"))?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("bind tls {addr}"))?;
            spawn_tls(listener, acceptor.clone(), resolver.clone());
            info!(addr = %addr, "dns-over-tls listener started");
        }
    }
    if !snapshot.ports.https.is_empty() {
        // Cert/key pairing was validated; the DoH endpoint itself terminates
        // at the fronting http layer.
        warn!("https ports configured, expecting a fronting http layer to terminate them");
    }

    info!(workers = udp_workers, "dns server started");

    tokio::signal::ctrl_c()
        .await
        .context("wait for shutdown signal")?;
    info!("shutdown signal received");
    Ok(())
}

fn init_tracing(debug: bool) {
    let fmt_layer = fmt::layer().with_target(false).with_ansi(false);
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

/// "55", ":56" or "addr:port".
fn listen_addr(spec: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(port) = spec.parse::<u16>() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    if let Some(port) = spec.strip_prefix(':') {
        let port: u16 = port.parse().context("port number")?;
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    spec.parse().context("socket address")
}

fn spawn_udp_workers(
    addr: SocketAddr,
    workers: usize,
    resolver: Arc<Resolver>,
) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        // One SO_REUSEPORT socket per worker; the kernel fans packets out.
        for worker_id in 0..workers {
            let std_socket = reuseport_udp_socket(addr)
                .with_context(|| format!("create udp socket for worker {worker_id}"))?;
            let socket = UdpSocket::from_std(std_socket).context("register udp socket")?;
            let resolver = resolver.clone();
            tokio::spawn(async move {
                run_udp_worker(Arc::new(socket), resolver).await;
            });
        }
        Ok(())
    }

    #[cfg(not(unix))]
    {
        // One shared socket, many workers.
        use socket2::{Domain, Protocol, Socket, Type};
        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create udp socket")?;
        let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
        let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
        socket.set_nonblocking(true).context("set nonblocking")?;
        socket.bind(&addr.into()).context("bind udp socket")?;
        let socket = Arc::new(UdpSocket::from_std(socket.into()).context("register udp socket")?);
        for _ in 0..workers {
            let socket = Arc::clone(&socket);
            let resolver = resolver.clone();
            tokio::spawn(async move {
                run_udp_worker(socket, resolver).await;
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
fn reuseport_udp_socket(addr: SocketAddr) -> anyhow::Result<std::net::UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};
    use std::os::unix::io::AsRawFd;

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    // SO_REUSEPORT via libc; missing support just means one shared queue.
    let one: libc::c_int = 1;
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of_val(&one) as libc::socklen_t,
        )
    };
    if ret != 0 {
        warn!(addr = %addr, "SO_REUSEPORT unavailable, workers share one socket queue");
    }

    let _ = socket.set_recv_buffer_size(4 * 1024 * 1024);
    let _ = socket.set_send_buffer_size(4 * 1024 * 1024);
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Receive loop: cache and override hits are answered inline, everything
/// else moves to its own task so slow upstreams never stall the socket.
async fn run_udp_worker(socket: Arc<UdpSocket>, resolver: Arc<Resolver>) {
    let mut buf = vec![0u8; 4096];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => {
                error!(error = %err, "udp recv failed");
                continue;
            }
        };
        let packet = &buf[..len];

        if let Some(response) = resolver.try_fast_answer(packet) {
            let _ = socket.send_to(&response, peer).await;
            continue;
        }

        let packet = packet.to_vec();
        let socket = Arc::clone(&socket);
        let resolver = Arc::clone(&resolver);
        tokio::spawn(async move {
            match resolver.handle_packet(&packet, peer.ip()).await {
                Ok(response) => {
                    let _ = socket.send_to(&response, peer).await;
                }
                Err(err) => {
                    error!(client = %peer, error = %err, "query handling failed");
                }
            }
        });
    }
}

fn spawn_tcp(listener: TcpListener, resolver: Arc<Resolver>) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "tcp accept failed");
                    continue;
                }
            };
            let resolver = resolver.clone();
            tokio::spawn(async move {
                let _ = serve_stream(stream, peer, resolver).await;
            });
        }
    });
}

fn spawn_tls(listener: TcpListener, acceptor: TlsAcceptor, resolver: Arc<Resolver>) {
    tokio::spawn(async move {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    error!(error = %err, "tls accept failed");
                    continue;
                }
            };
            let acceptor = acceptor.clone();
            let resolver = resolver.clone();
            tokio::spawn(async move {
                match acceptor.accept(stream).await {
                    Ok(stream) => {
                        let _ = serve_stream(stream, peer, resolver).await;
                    }
                    Err(err) => {
                        warn!(client = %peer, error = %err, "tls handshake failed");
                    }
                }
            });
        }
    });
}

/// DNS over a byte stream: 2-byte length framing, one query per frame,
/// multiple frames per connection.
async fn serve_stream<S>(
    mut stream: S,
    peer: SocketAddr,
    resolver: Arc<Resolver>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    const MAX_TCP_FRAME: usize = 64 * 1024;
    let mut len_buf = [0u8; 2];

    loop {
        if let Err(err) = stream.read_exact(&mut len_buf).await {
            if err.kind() != std::io::ErrorKind::UnexpectedEof {
                return Err(err.into());
            }
            return Ok(());
        }
        let frame_len = u16::from_be_bytes(len_buf) as usize;
        if frame_len == 0 || frame_len > MAX_TCP_FRAME {
            return Ok(());
        }

        let mut packet = vec![0u8; frame_len];
        if stream.read_exact(&mut packet).await.is_err() {
            return Ok(());
        }

        let response = match resolver.handle_packet(&packet, peer.ip()).await {
            Ok(response) => response,
            Err(_) => return Ok(()),
        };

        if response.len() <= u16::MAX as usize {
            let len_bytes = (response.len() as u16).to_be_bytes();
            if stream.write_all(&len_bytes).await.is_err() {
                return Ok(());
            }
            if stream.write_all(&response).await.is_err() {
                return Ok(());
            }
        }
    }
}

fn tls_acceptor(identity: &TlsIdentity) -> anyhow::Result<TlsAcceptor> {
    let cert_file = std::fs::File::open(&identity.cert_file)
        .with_context(|| format!("open {}", identity.cert_file.display()))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .context("read certificate chain")?;

    let key_file = std::fs::File::open(&identity.key_file)
        .with_context(|| format!("open {}", identity.key_file.display()))?;
    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(key_file))
        .context("read private key")?
        .context("no private key in key file")?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("assemble tls server config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
