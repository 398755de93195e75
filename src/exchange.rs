use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::error::UpstreamQueryError;
use crate::upstream::{NetProtocol, Upstream};

/// One raw DNS exchange with one upstream: send a wire-format query, get a
/// wire-format response within the limit. The parallel querier and the client
/// lookup are written against this seam; tests substitute their own.
pub trait Exchanger: Send + Sync {
    fn exchange<'a>(
        &'a self,
        upstream: &'a Upstream,
        packet: &'a [u8],
        limit: Duration,
    ) -> BoxFuture<'a, Result<Bytes, UpstreamQueryError>>;
}

/// Production transports: UDP with TCP retry, DNS-over-TLS, DNS-over-HTTPS.
pub struct NetExchanger {
    tls: TlsConnector,
    http: reqwest::Client,
}

impl NetExchanger {
    pub fn new() -> anyhow::Result<Self> {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        let tls_config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let http = reqwest::Client::builder()
            .build()
            .context("build https client")?;
        Ok(Self {
            tls: TlsConnector::from(Arc::new(tls_config)),
            http,
        })
    }

    async fn resolve_addr(&self, upstream: &Upstream) -> Result<SocketAddr, UpstreamQueryError> {
        if let Some(ip) = upstream.ip() {
            return Ok(SocketAddr::new(ip, upstream.port));
        }
        lookup_host((upstream.host.as_str(), upstream.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| UpstreamQueryError::Io {
                upstream: upstream.to_string(),
                reason: format!("no address for host '{}'", upstream.host),
            })
    }

    async fn udp_round(
        &self,
        upstream: &Upstream,
        addr: SocketAddr,
        packet: &[u8],
    ) -> Result<Bytes, UpstreamQueryError> {
        let io_err = |reason: String| UpstreamQueryError::Io {
            upstream: upstream.to_string(),
            reason,
        };

        let domain = if addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket =
            Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| io_err(e.to_string()))?;
        let _ = socket.set_recv_buffer_size(256 * 1024);
        socket
            .set_nonblocking(true)
            .map_err(|e| io_err(e.to_string()))?;
        let bind: SocketAddr = if addr.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| io_err("bind addr".into()))?
        } else {
            "[::]:0".parse().map_err(|_| io_err("bind addr".into()))?
        };
        socket
            .bind(&bind.into())
            .map_err(|e| io_err(e.to_string()))?;
        let socket = UdpSocket::from_std(socket.into()).map_err(|e| io_err(e.to_string()))?;
        socket.connect(addr).await.map_err(|e| io_err(e.to_string()))?;
        socket.send(packet).await.map_err(|e| io_err(e.to_string()))?;

        // Fresh connected socket, so anything arriving is from this upstream;
        // still verify the transaction id before accepting.
        let mut buf = [0u8; 4096];
        loop {
            let len = socket.recv(&mut buf).await.map_err(|e| io_err(e.to_string()))?;
            if len >= 2 && packet.len() >= 2 && buf[..2] != packet[..2] {
                continue;
            }
            return Ok(Bytes::copy_from_slice(&buf[..len]));
        }
    }

    async fn tcp_round(
        &self,
        upstream: &Upstream,
        addr: SocketAddr,
        packet: &[u8],
    ) -> Result<Bytes, UpstreamQueryError> {
        let io_err = |reason: String| UpstreamQueryError::Io {
            upstream: upstream.to_string(),
            reason,
        };
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| io_err(e.to_string()))?;
        framed_round(stream, packet).await.map_err(io_err)
    }

    async fn tls_round(
        &self,
        upstream: &Upstream,
        addr: SocketAddr,
        packet: &[u8],
    ) -> Result<Bytes, UpstreamQueryError> {
        let tls_err = |reason: String| UpstreamQueryError::Tls {
            upstream: upstream.to_string(),
            reason,
        };
        let server_name = ServerName::try_from(upstream.host.clone())
            .map_err(|e| tls_err(format!("invalid server name: {e}")))?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| tls_err(e.to_string()))?;
        let stream = self
            .tls
            .connect(server_name, stream)
            .await
            .map_err(|e| tls_err(e.to_string()))?;
        framed_round(stream, packet).await.map_err(tls_err)
    }

    async fn https_round(
        &self,
        upstream: &Upstream,
        packet: &[u8],
        limit: Duration,
    ) -> Result<Bytes, UpstreamQueryError> {
        let https_err = |reason: String| UpstreamQueryError::Https {
            upstream: upstream.to_string(),
            reason,
        };
        let response = self
            .http
            .post(upstream.url())
            .header("content-type", "application/dns-message")
            .header("accept", "application/dns-message")
            .body(packet.to_vec())
            .timeout(limit)
            .send()
            .await
            .map_err(|e| https_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(https_err(format!("http status {}", response.status())));
        }
        response
            .bytes()
            .await
            .map_err(|e| https_err(e.to_string()))
    }
}

impl Exchanger for NetExchanger {
    fn exchange<'a>(
        &'a self,
        upstream: &'a Upstream,
        packet: &'a [u8],
        limit: Duration,
    ) -> BoxFuture<'a, Result<Bytes, UpstreamQueryError>> {
        Box::pin(async move {
            let timed_out = || UpstreamQueryError::Timeout {
                upstream: upstream.to_string(),
                timeout: limit,
            };
            match upstream.net {
                NetProtocol::Https => {
                    timeout(limit, self.https_round(upstream, packet, limit))
                        .await
                        .map_err(|_| timed_out())?
                }
                NetProtocol::TcpTls => {
                    let addr = self.resolve_addr(upstream).await?;
                    timeout(limit, self.tls_round(upstream, addr, packet))
                        .await
                        .map_err(|_| timed_out())?
                }
                NetProtocol::TcpUdp => {
                    let addr = self.resolve_addr(upstream).await?;
                    let udp = timeout(limit, self.udp_round(upstream, addr, packet)).await;
                    match udp {
                        Ok(Ok(response)) if !is_truncated(&response) => Ok(response),
                        other => {
                            if let Ok(Err(err)) = &other {
                                debug!(upstream = %upstream, error = %err, "udp round failed, retrying over tcp");
                            }
                            timeout(limit, self.tcp_round(upstream, addr, packet))
                                .await
                                .map_err(|_| timed_out())?
                        }
                    }
                }
            }
        })
    }
}

/// DNS over a byte stream: 2-byte big-endian length prefix both ways.
async fn framed_round<S>(mut stream: S, packet: &[u8]) -> Result<Bytes, String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if packet.len() > u16::MAX as usize {
        return Err("query exceeds tcp frame limit".to_string());
    }
    let mut framed = Vec::with_capacity(2 + packet.len());
    framed.extend_from_slice(&(packet.len() as u16).to_be_bytes());
    framed.extend_from_slice(packet);
    stream.write_all(&framed).await.map_err(|e| e.to_string())?;

    let mut len_buf = [0u8; 2];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| e.to_string())?;
    let frame_len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; frame_len];
    stream
        .read_exact(&mut buf)
        .await
        .map_err(|e| e.to_string())?;
    Ok(Bytes::from(buf))
}

/// TC bit in the header flags: the UDP answer was cut short, ask over TCP.
fn is_truncated(packet: &[u8]) -> bool {
    packet.len() > 2 && packet[2] & 0x02 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_flag_is_detected() {
        assert!(!is_truncated(&[0, 0, 0x00, 0]));
        assert!(is_truncated(&[0, 0, 0x02, 0]));
        assert!(!is_truncated(&[0, 0]));
    }

    #[tokio::test]
    async fn framed_round_trips_over_a_duplex_stream() {
        let (client, mut server) = tokio::io::duplex(512);
        let server_task = tokio::spawn(async move {
            let mut len_buf = [0u8; 2];
            server.read_exact(&mut len_buf).await.unwrap();
            let mut query = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            server.read_exact(&mut query).await.unwrap();

            let reply = [query.as_slice(), b"-reply"].concat();
            server
                .write_all(&(reply.len() as u16).to_be_bytes())
                .await
                .unwrap();
            server.write_all(&reply).await.unwrap();
        });

        let response = framed_round(client, b"hello").await.expect("round trip");
        assert_eq!(&response[..], b"hello-reply");
        server_task.await.unwrap();
    }
}
