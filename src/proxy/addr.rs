//! Configured endpoints: TCP or Unix, plain or TLS.
//!
//! An [`AddrSpec`] is plain data with value equality; sessions detect an
//! uplink switch by comparing the spec they last dialed against the one in
//! the current config. Dialing and listening consume the spec's TLS
//! material lazily, so validation ([`AddrSpec::prepare`]) checks it up
//! front and reports every problem it finds.

use std::fmt;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::resp::IoStream;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Unix,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Network::Tcp => "tcp",
            Network::Unix => "unix",
        })
    }
}

/// One configured endpoint. An empty `addr` means the endpoint is absent
/// (optional services are disabled that way).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddrSpec {
    pub addr: String,
    pub pass: String,
    pub tls: bool,
    pub network: Network,
    pub certfile: String,
    pub keyfile: String,
    pub cacertfile: String,
    pub skipverify: bool,
}

impl AddrSpec {
    pub fn is_configured(&self) -> bool {
        !self.addr.is_empty()
    }

    pub fn has_pass(&self) -> bool {
        !self.pass.is_empty()
    }

    /// Copy safe to serialize for the admin surface.
    pub fn sanitized(&self) -> AddrSpec {
        let mut spec = self.clone();
        if spec.has_pass() {
            spec.pass = "[removed]".into();
        }
        spec
    }

    /// Connect once, performing the TLS handshake when configured.
    pub async fn dial(&self) -> io::Result<IoStream> {
        match self.network {
            Network::Tcp => {
                let stream = TcpStream::connect(&self.addr).await?;
                match self.client_tls()? {
                    Some(connector) => {
                        let name = self.server_name()?;
                        Ok(Box::new(connector.connect(name, stream).await?))
                    }
                    None => Ok(Box::new(stream)),
                }
            }
            Network::Unix => {
                let stream = UnixStream::connect(&self.addr).await?;
                match self.client_tls()? {
                    Some(connector) => {
                        let name = self.server_name()?;
                        Ok(Box::new(connector.connect(name, stream).await?))
                    }
                    None => Ok(Box::new(stream)),
                }
            }
        }
    }

    /// Bind a listener, wrapping accepted connections with TLS when
    /// configured.
    pub async fn listen(&self) -> io::Result<Listener> {
        let tls = match self.tls {
            true => Some(TlsAcceptor::from(Arc::new(self.server_tls_config()?))),
            false => None,
        };
        let kind = match self.network {
            Network::Tcp => ListenerKind::Tcp(TcpListener::bind(&self.addr).await?),
            Network::Unix => ListenerKind::Unix(UnixListener::bind(&self.addr)?),
        };
        Ok(Listener { kind, tls })
    }

    /// Validate the spec, appending human-readable problems to `errors`.
    ///
    /// For client (dialing) specs this includes a one-shot reachability
    /// probe, so every problem is reported in one pass instead of failing
    /// on the first.
    pub async fn prepare(&self, name: &str, server: bool, errors: &mut Vec<String>) {
        let no_prior_errors = errors.len();
        if !self.is_configured() {
            errors.push(format!("missing {} address", name));
            return;
        }

        if self.tls {
            if server {
                if self.certfile.is_empty() {
                    errors.push(format!("{}.tls requires certfile", name));
                } else if load_certs(&self.certfile).is_err() {
                    errors.push(format!(
                        "could not load {}.tls.certfile: {}",
                        name, self.certfile
                    ));
                }
                if self.keyfile.is_empty() {
                    errors.push(format!("{}.tls requires keyfile", name));
                } else if load_key(&self.keyfile).is_err() {
                    errors.push(format!(
                        "could not load {}.tls.keyfile: {}",
                        name, self.keyfile
                    ));
                }
            } else if self.cacertfile.is_empty() {
                if !self.skipverify {
                    errors.push(format!("{}.tls requires cacertfile or skipverify", name));
                }
            } else if load_certs(&self.cacertfile).is_err() {
                errors.push(format!(
                    "could not load {}.tls.cacertfile: {}",
                    name, self.cacertfile
                ));
            }
        }

        // Reachability probe; skipped when the spec itself is invalid.
        if !server && errors.len() == no_prior_errors && self.dial().await.is_err() {
            let mode = if self.tls { "TLS" } else { "non-TLS" };
            errors.push(format!(
                "could not connect to {}: {} ({})",
                name, self.addr, mode
            ));
        }
    }

    fn server_name(&self) -> io::Result<ServerName<'static>> {
        let host = match self.network {
            Network::Tcp => self
                .addr
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(&self.addr),
            Network::Unix => "localhost",
        };
        ServerName::try_from(host.to_string())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
    }

    fn client_tls(&self) -> io::Result<Option<TlsConnector>> {
        if !self.tls {
            return Ok(None);
        }
        let builder = ClientConfig::builder();
        let config = if self.skipverify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerification))
                .with_no_client_auth()
        } else {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(&self.cacertfile)? {
                roots
                    .add(cert)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            }
            builder
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        Ok(Some(TlsConnector::from(Arc::new(config))))
    }

    fn server_tls_config(&self) -> io::Result<ServerConfig> {
        let certs = load_certs(&self.certfile)?;
        let key = load_key(&self.keyfile)?;
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl fmt::Display for AddrSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.addr)?;
        if self.tls {
            write!(f, " (TLS)")?;
        }
        Ok(())
    }
}

fn load_certs(path: &str) -> io::Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut BufReader::new(file)).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates in PEM file",
        ));
    }
    Ok(certs)
}

fn load_key(path: &str) -> io::Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    rustls_pemfile::private_key(&mut BufReader::new(file))?.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no private key in PEM file")
    })
}

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
}

pub struct Listener {
    kind: ListenerKind,
    tls: Option<TlsAcceptor>,
}

impl Listener {
    /// Bound address, for TCP listeners (tests bind port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.kind {
            ListenerKind::Tcp(l) => l.local_addr().ok(),
            ListenerKind::Unix(_) => None,
        }
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            ListenerKind::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "tcp:?".into()),
            ListenerKind::Unix(l) => format!("unix:{:?}", l.local_addr().ok()),
        }
    }

    /// Accept one connection. The TLS handshake is deferred to
    /// [`Incoming::establish`] so it runs in the per-connection task, not
    /// in the accept loop.
    pub async fn accept(&self) -> io::Result<Incoming> {
        let (stream, peer) = match &self.kind {
            ListenerKind::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                (RawStream::Tcp(stream), peer.to_string())
            }
            ListenerKind::Unix(l) => {
                let (stream, peer) = l.accept().await?;
                (RawStream::Unix(stream), format!("unix:{:?}", peer))
            }
        };
        Ok(Incoming {
            stream,
            peer,
            tls: self.tls.clone(),
        })
    }
}

enum RawStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

pub struct Incoming {
    stream: RawStream,
    peer: String,
    tls: Option<TlsAcceptor>,
}

impl Incoming {
    pub async fn establish(self) -> io::Result<(IoStream, String)> {
        let stream: IoStream = match (self.tls, self.stream) {
            (None, RawStream::Tcp(s)) => Box::new(s),
            (None, RawStream::Unix(s)) => Box::new(s),
            (Some(acceptor), RawStream::Tcp(s)) => Box::new(acceptor.accept(s).await?),
            (Some(acceptor), RawStream::Unix(s)) => Box::new(acceptor.accept(s).await?),
        };
        Ok((stream, self.peer))
    }
}

mod danger {
    //! Certificate verifier for `skipverify` uplinks: accepts anything.

    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct NoVerification;

    impl ServerCertVerifier for NoVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
            ]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_equality() {
        let a = AddrSpec {
            addr: "a".into(),
            tls: true,
            cacertfile: "ca".into(),
            ..Default::default()
        };
        let mut b = a.clone();
        assert_eq!(a, b);
        b.cacertfile = "ca-changed".into();
        assert_ne!(a, b);

        let p1 = AddrSpec {
            addr: "a".into(),
            pass: "p".into(),
            ..Default::default()
        };
        let mut p2 = p1.clone();
        assert_eq!(p1, p2);
        p2.pass = "p-changed".into();
        assert_ne!(p1, p2);
    }

    #[test]
    fn test_sanitized_masks_password() {
        let spec = AddrSpec {
            addr: "localhost:6379".into(),
            pass: "secret".into(),
            ..Default::default()
        };
        assert_eq!(spec.sanitized().pass, "[removed]");
        // No password stays empty, not "[removed]".
        let open = AddrSpec {
            addr: "localhost:6379".into(),
            ..Default::default()
        };
        assert_eq!(open.sanitized().pass, "");
    }

    #[tokio::test]
    async fn test_prepare_reports_missing_tls_material() {
        let spec = AddrSpec {
            addr: "127.0.0.1:0".into(),
            tls: true,
            ..Default::default()
        };
        let mut errors = Vec::new();
        spec.prepare("listen", true, &mut errors).await;
        assert!(errors.contains(&"listen.tls requires certfile".to_string()));
        assert!(errors.contains(&"listen.tls requires keyfile".to_string()));

        let mut errors = Vec::new();
        spec.prepare("uplink", false, &mut errors).await;
        assert_eq!(
            errors,
            vec!["uplink.tls requires cacertfile or skipverify".to_string()]
        );
    }

    #[tokio::test]
    async fn test_prepare_probes_reachability() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let reachable = AddrSpec {
            addr: listener.local_addr().unwrap().to_string(),
            ..Default::default()
        };
        let mut errors = Vec::new();
        reachable.prepare("uplink", false, &mut errors).await;
        assert!(errors.is_empty(), "{:?}", errors);

        let unreachable = AddrSpec {
            addr: "127.0.0.1:1".into(),
            ..Default::default()
        };
        let mut errors = Vec::new();
        unreachable.prepare("uplink", false, &mut errors).await;
        assert_eq!(
            errors,
            vec!["could not connect to uplink: 127.0.0.1:1 (non-TLS)".to_string()]
        );
    }
}
