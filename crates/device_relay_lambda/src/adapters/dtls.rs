//! DTLS 1.2 transport for the relay session, backed by `webrtc-dtls`.
//!
//! The relay sequence is synchronous; every call bridges onto the invocation's
//! tokio runtime with `block_in_place`, so the connector must be used from a
//! multi-threaded runtime.
//!
//! Peer certificates are checked against the public web PKI roots plus any
//! CAs handed to [`DtlsConnector::with_extra_roots`], unless
//! `TransportOptions::insecure_skip_verify` is set.
//!
//! Connection identifiers (RFC 9146) are not negotiated: `webrtc-dtls` has no
//! support for them. Each invocation runs a full handshake on one socket, so
//! a NAT rebinding mid-invocation ends the session instead of resuming it.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use device_relay_core::contract::Endpoint;
use device_relay_core::session::{
    SecureSession, SessionConnector, TransportError, TransportOptions,
};
use rustls::pki_types::CertificateDer;
use rustls::RootCertStore;
use tokio::net::{lookup_host, UdpSocket};
use tracing::debug;
use webrtc_dtls::config::Config;
use webrtc_dtls::conn::DTLSConn;

#[derive(Debug, Clone)]
pub struct DtlsConnector {
    roots: RootCertStore,
}

impl DtlsConnector {
    /// Trusts the public web PKI roots and `extra_roots` (DER certificates).
    pub fn with_extra_roots(
        extra_roots: Vec<CertificateDer<'static>>,
    ) -> Result<Self, rustls::Error> {
        let mut roots = public_roots();
        for cert in extra_roots {
            roots.add(cert)?;
        }
        Ok(Self { roots })
    }

    pub fn trust_anchor_count(&self) -> usize {
        self.roots.len()
    }
}

impl Default for DtlsConnector {
    fn default() -> Self {
        Self {
            roots: public_roots(),
        }
    }
}

fn public_roots() -> RootCertStore {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    roots
}

impl SessionConnector for DtlsConnector {
    type Session = DtlsSession;

    fn connect(
        &self,
        endpoint: &Endpoint,
        options: &TransportOptions,
    ) -> Result<DtlsSession, TransportError> {
        let endpoint = endpoint.clone();
        let options = options.clone();
        let roots = self.roots.clone();
        block_on(async move { connect(&endpoint, &options, roots).await })
    }
}

async fn connect(
    endpoint: &Endpoint,
    options: &TransportOptions,
    roots: RootCertStore,
) -> Result<DtlsSession, TransportError> {
    let authority = endpoint.authority();
    let peer = resolve(&authority).await?;

    let local: SocketAddr = if peer.is_ipv4() {
        ([0, 0, 0, 0], 0).into()
    } else {
        ([0u16; 8], 0).into()
    };
    let connect_error = |error: std::io::Error| TransportError::Connect {
        endpoint: authority.clone(),
        reason: error.to_string(),
    };
    let socket = UdpSocket::bind(local).await.map_err(connect_error)?;
    socket.connect(peer).await.map_err(connect_error)?;
    debug!(%peer, "udp socket connected");

    let config = Config {
        insecure_skip_verify: options.insecure_skip_verify,
        server_name: endpoint.host.clone(),
        roots_cas: roots,
        ..Default::default()
    };

    let handshake = DTLSConn::new(Arc::new(socket), config, true, None);
    let conn = match tokio::time::timeout(options.handshake_timeout, handshake).await {
        Ok(Ok(conn)) => conn,
        Ok(Err(error)) => {
            return Err(TransportError::Handshake {
                endpoint: authority,
                reason: error.to_string(),
            })
        }
        Err(_) => {
            return Err(TransportError::Handshake {
                endpoint: authority,
                reason: format!("timed out after {:?}", options.handshake_timeout),
            })
        }
    };
    debug!(%peer, "dtls handshake complete");

    Ok(DtlsSession {
        conn: Arc::new(conn),
        closed: false,
    })
}

async fn resolve(authority: &str) -> Result<SocketAddr, TransportError> {
    let resolve_error = |reason: String| TransportError::Resolve {
        endpoint: authority.to_string(),
        reason,
    };

    let addresses: Vec<SocketAddr> = lookup_host(authority)
        .await
        .map_err(|error| resolve_error(error.to_string()))?
        .collect();

    // IPv4 first: Lambda has no IPv6 egress by default.
    addresses
        .iter()
        .find(|address| address.is_ipv4())
        .or_else(|| addresses.first())
        .copied()
        .ok_or_else(|| resolve_error("no addresses returned".to_string()))
}

pub struct DtlsSession {
    conn: Arc<DTLSConn>,
    closed: bool,
}

impl SecureSession for DtlsSession {
    fn send(&mut self, datagram: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let conn = Arc::clone(&self.conn);
        let datagram = datagram.to_vec();
        block_on(async move {
            conn.write(&datagram, None)
                .await
                .map(|_| ())
                .map_err(|error| TransportError::Io(format!("dtls write failed: {error}")))
        })
    }

    fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let conn = Arc::clone(&self.conn);
        block_on(async move {
            match tokio::time::timeout(timeout, conn.read(buf, None)).await {
                Ok(Ok(len)) => Ok(Some(len)),
                Ok(Err(error)) => Err(TransportError::Io(format!("dtls read failed: {error}"))),
                Err(_) => Ok(None),
            }
        })
    }

    fn close(&mut self) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let conn = Arc::clone(&self.conn);
        block_on(async move {
            webrtc_util::Conn::close(conn.as_ref())
                .await
                .map_err(|error| TransportError::Io(format!("dtls close failed: {error}")))
        })
    }
}

fn block_on<F: Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}

#[cfg(test)]
mod tests {
    use device_relay_core::coap::{CoapClient, Code, ContentFormat, Message, MessageType};
    use device_relay_core::config::CoapParams;
    use device_relay_core::session::SessionGuard;
    use tokio::task::JoinHandle;
    use webrtc_dtls::crypto::Certificate;
    use webrtc_dtls::listener::listen;
    use webrtc_util::conn::Listener;
    use webrtc_util::Conn;

    use super::*;

    struct LoopbackBroker {
        port: u16,
        certificate: Certificate,
        task: JoinHandle<()>,
    }

    impl Drop for LoopbackBroker {
        fn drop(&mut self) {
            self.task.abort();
        }
    }

    /// DTLS server on 127.0.0.1 presenting a self-signed `localhost`
    /// certificate. Confirmable requests get a piggybacked 2.01 when
    /// `answer` is set; otherwise requests are read and ignored.
    ///
    /// # Panics
    ///
    /// Panics if the certificate cannot be generated or the listener cannot
    /// bind.
    async fn spawn_broker(answer: bool) -> LoopbackBroker {
        let certificate = Certificate::generate_self_signed(vec!["localhost".to_owned()])
            .expect("generate certificate");
        let config = Config {
            certificates: vec![certificate.clone()],
            ..Default::default()
        };
        let listener = listen("127.0.0.1:0", config).await.expect("listen");
        let port = listener.addr().await.expect("listener address").port();

        let task = tokio::spawn(async move {
            while let Ok((conn, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 2048];
                    while let Ok(len) = conn.recv(&mut buf).await {
                        let Ok(request) = Message::decode(&buf[..len]) else {
                            continue;
                        };
                        if !answer || request.message_type != MessageType::Confirmable {
                            continue;
                        }
                        let response = Message::new(
                            MessageType::Acknowledgement,
                            Code::CREATED,
                            request.message_id,
                        )
                        .with_token(&request.token);
                        let Ok(bytes) = response.encode() else {
                            continue;
                        };
                        if conn.send(&bytes).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        LoopbackBroker {
            port,
            certificate,
            task,
        }
    }

    fn skip_verify() -> TransportOptions {
        TransportOptions {
            insecure_skip_verify: true,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    fn verify() -> TransportOptions {
        TransportOptions {
            insecure_skip_verify: false,
            handshake_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unresolvable_host_is_a_resolve_error() {
        let endpoint = Endpoint::new("relay.invalid", 5684);

        let error = DtlsConnector::default()
            .connect(&endpoint, &TransportOptions::default())
            .err()
            .expect("connect should fail");

        assert!(matches!(error, TransportError::Resolve { .. }));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn silent_peer_fails_handshake_within_timeout() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.expect("bind peer");
        let port = peer.local_addr().expect("peer address").port();
        let options = TransportOptions {
            handshake_timeout: Duration::from_millis(200),
            ..TransportOptions::default()
        };

        let error = DtlsConnector::default()
            .connect(&Endpoint::new("127.0.0.1", port), &options)
            .err()
            .expect("connect should fail");

        assert!(matches!(error, TransportError::Handshake { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn coap_round_trip_over_skip_verify_session() {
        let broker = spawn_broker(true).await;
        let endpoint = Endpoint::new("localhost", broker.port);

        let mut session = SessionGuard::new(
            DtlsConnector::default()
                .connect(&endpoint, &skip_verify())
                .expect("handshake should succeed"),
        );
        let params = CoapParams {
            rng_seed: Some(5),
            ..CoapParams::default()
        };
        let response = CoapClient::new(&mut *session, &params)
            .post("/auth/jwt", ContentFormat::TEXT_PLAIN, b"token")
            .expect("exchange should complete");

        assert_eq!(response.code, Code::CREATED);
        session.close().expect("close should succeed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recv_timeout_yields_none() {
        let broker = spawn_broker(false).await;
        let endpoint = Endpoint::new("localhost", broker.port);
        let mut session = DtlsConnector::default()
            .connect(&endpoint, &skip_verify())
            .expect("handshake should succeed");

        session.send(&[0x40, 0x02, 0x00, 0x01]).expect("send");
        let mut buf = [0u8; 64];
        let received = session
            .recv(&mut buf, Duration::from_millis(150))
            .expect("recv should not fail");

        assert_eq!(received, None);
        session.close().expect("close should succeed");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn close_is_idempotent_and_ends_the_session() {
        let broker = spawn_broker(false).await;
        let endpoint = Endpoint::new("localhost", broker.port);
        let mut session = DtlsConnector::default()
            .connect(&endpoint, &skip_verify())
            .expect("handshake should succeed");

        session.close().expect("first close");
        session.close().expect("second close is a no-op");

        assert_eq!(session.send(&[0x60, 0x00, 0x00, 0x01]), Err(TransportError::Closed));
        let mut buf = [0u8; 8];
        assert_eq!(
            session.recv(&mut buf, Duration::from_millis(10)),
            Err(TransportError::Closed)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn untrusted_certificate_fails_verification() {
        let broker = spawn_broker(true).await;
        let endpoint = Endpoint::new("localhost", broker.port);

        let error = DtlsConnector::default()
            .connect(&endpoint, &verify())
            .err()
            .expect("handshake should fail");

        assert!(matches!(error, TransportError::Handshake { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn extra_root_makes_broker_trusted() {
        let broker = spawn_broker(true).await;
        let endpoint = Endpoint::new("localhost", broker.port);
        let connector =
            DtlsConnector::with_extra_roots(vec![broker.certificate.certificate[0].clone()])
                .expect("root should be accepted");
        assert!(connector.trust_anchor_count() > DtlsConnector::default().trust_anchor_count());

        let mut session = connector
            .connect(&endpoint, &verify())
            .expect("handshake should succeed");

        session.close().expect("close should succeed");
    }

    #[test]
    fn rejects_extra_root_that_is_not_a_certificate() {
        let garbage = CertificateDer::from(vec![0x01, 0x02, 0x03]);
        assert!(DtlsConnector::with_extra_roots(vec![garbage]).is_err());
    }
}
