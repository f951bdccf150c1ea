//! TLS stream driver.
//!
//! Both sides present X.509 certificates.  After the handshake the peer
//! certificate runs the policy gauntlet, in order:
//!
//! 1. a certificate must be present at all,
//! 2. when a CA bundle is configured, the chain must have verified
//!    against it during the handshake,
//! 3. the certificate CN must resolve to the connection's peer address
//!    (unless `check_certificate_host` is off),
//! 4. when a fingerprint file is configured, the certificate's MD5 or
//!    SHA-1 fingerprint must appear in it; either algorithm suffices.
//!
//! Framing on the encrypted stream is identical to plain TCP.

use std::fs;
use std::io::BufReader;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use md5::Md5;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, RootCertStore, ServerConfig, SignatureScheme};
use sha1::{Digest, Sha1};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, warn};
use x509_parser::prelude::parse_x509_certificate;

use crate::config::{SecurityConfig, TlsConfig};
use crate::error::{Result, SecurityError};
use crate::util::with_euid_root;

use super::conn::{establish, Shared, Side};
use super::handle::StreamHandle;
use super::tcp::connect_socket;
use super::StreamAcceptor;

// ---------------------------------------------------------------------------
// Connect / listen
// ---------------------------------------------------------------------------

pub async fn connect(host: &str, cfg: &SecurityConfig) -> Result<StreamHandle> {
    let tcp = connect_socket(host, cfg).await?;
    let peer_ip = tcp.peer_addr().map_err(SecurityError::write)?.ip();

    let connector = TlsConnector::from(Arc::new(client_config(&cfg.tls)?));
    let server_name = ServerName::try_from(host.to_owned())
        .map_err(|_| SecurityError::ResolveHostname(host.to_owned()))?;
    let stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| SecurityError::PeerUnauthenticated(e.to_string()))?;

    let peer_name = {
        let (_, session) = stream.get_ref();
        verify_peer(&cfg.tls, session.peer_certificates(), peer_ip).await?
    };
    debug!(host, peer = %peer_name, "tls session established");

    let (read_half, write_half) = tokio::io::split(stream);
    let shared = establish(peer_name, Some(peer_ip), Side::Connect, read_half, write_half, None);
    Ok(StreamHandle::open(shared))
}

pub async fn listen(port: u16, cfg: &SecurityConfig) -> Result<StreamAcceptor> {
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(SecurityError::write)?;
    let local_addr = listener.local_addr().ok();
    let acceptor = TlsAcceptor::from(Arc::new(server_config(&cfg.tls)?));
    let tls_cfg = cfg.tls.clone();
    let (accept_tx, accept_rx) = mpsc::channel(8);

    tokio::spawn(async move {
        let mut conns: Vec<Arc<Shared>> = Vec::new();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = accept_tx.closed() => break,
            };
            let (tcp, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "tls accept failed");
                    continue;
                }
            };
            conns.retain(|c| !c.is_shut());
            let stream = match acceptor.accept(tcp).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(%peer, error = %e, "tls handshake failed");
                    continue;
                }
            };
            let peer_name = {
                let (_, session) = stream.get_ref();
                match verify_peer(&tls_cfg, session.peer_certificates(), peer.ip()).await {
                    Ok(name) => name,
                    Err(e) => {
                        warn!(%peer, error = %e, "tls peer rejected");
                        continue;
                    }
                }
            };
            debug!(%peer, peer_name = %peer_name, "accepted tls connection");
            let (read_half, write_half) = tokio::io::split(stream);
            conns.push(establish(
                peer_name,
                Some(peer.ip()),
                Side::Accept,
                read_half,
                write_half,
                Some(accept_tx.clone()),
            ));
        }
    });

    Ok(StreamAcceptor::new(accept_rx, local_addr, Vec::new()))
}

// ---------------------------------------------------------------------------
// rustls configuration
// ---------------------------------------------------------------------------

fn provider(tls: &TlsConfig) -> Result<Arc<CryptoProvider>> {
    let mut provider = rustls::crypto::ring::default_provider();
    if !tls.cipher_list.is_empty() {
        let wanted: Vec<String> = tls
            .cipher_list
            .iter()
            .map(|s| s.to_ascii_uppercase())
            .collect();
        provider.cipher_suites.retain(|suite| {
            let name = format!("{:?}", suite.suite()).to_ascii_uppercase();
            wanted.iter().any(|w| name.contains(w.as_str()))
        });
        if provider.cipher_suites.is_empty() {
            return Err(SecurityError::PeerUnauthenticated(
                "cipher list matches no supported suite".into(),
            ));
        }
    }
    Ok(Arc::new(provider))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = with_euid_root(|| fs::read(path)).map_err(SecurityError::read)?;
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(&data[..]))
        .collect::<std::io::Result<_>>()
        .map_err(SecurityError::read)?;
    if certs.is_empty() {
        return Err(SecurityError::read(format!("no certificate in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = with_euid_root(|| fs::read(path)).map_err(SecurityError::read)?;
    rustls_pemfile::private_key(&mut BufReader::new(&data[..]))
        .map_err(SecurityError::read)?
        .ok_or_else(|| SecurityError::read(format!("no private key in {}", path.display())))
}

fn root_store(path: &Path) -> Result<Arc<RootCertStore>> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| SecurityError::read(format!("bad CA certificate: {e}")))?;
    }
    Ok(Arc::new(roots))
}

fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let provider = provider(tls)?;
    let versions = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| SecurityError::PeerUnauthenticated(e.to_string()))?;
    let verifier = match &tls.ca_file {
        Some(ca) => versions.with_root_certificates(root_store(ca)?),
        // Without a CA the chain is not verified here; presence, hostname
        // and fingerprint checks still run after the handshake.
        None => versions
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AnyServerCert { provider })),
    };
    match (&tls.cert_file, &tls.key_file) {
        (Some(cert), Some(key)) => verifier
            .with_client_auth_cert(load_certs(cert)?, load_key(key)?)
            .map_err(|e| SecurityError::PeerUnauthenticated(e.to_string())),
        _ => Ok(verifier.with_no_client_auth()),
    }
}

fn server_config(tls: &TlsConfig) -> Result<ServerConfig> {
    let provider = provider(tls)?;
    let cert_file = tls
        .cert_file
        .as_ref()
        .ok_or_else(|| SecurityError::read("tls listener needs a certificate file"))?;
    let key_file = tls
        .key_file
        .as_ref()
        .ok_or_else(|| SecurityError::read("tls listener needs a key file"))?;

    let verifier: Arc<dyn ClientCertVerifier> = match &tls.ca_file {
        Some(ca) => WebPkiClientVerifier::builder_with_provider(root_store(ca)?, Arc::clone(&provider))
            .build()
            .map_err(|e| SecurityError::PeerUnauthenticated(e.to_string()))?,
        None => Arc::new(AnyClientCert { provider: Arc::clone(&provider) }),
    };

    ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| SecurityError::PeerUnauthenticated(e.to_string()))?
        .with_client_cert_verifier(verifier)
        .with_single_cert(load_certs(cert_file)?, load_key(key_file)?)
        .map_err(|e| SecurityError::PeerUnauthenticated(e.to_string()))
}

// ---------------------------------------------------------------------------
// Peer certificate policy
// ---------------------------------------------------------------------------

async fn verify_peer(
    tls: &TlsConfig,
    certs: Option<&[CertificateDer<'_>]>,
    peer_addr: IpAddr,
) -> Result<String> {
    let leaf = certs
        .and_then(|c| c.first())
        .ok_or_else(|| SecurityError::PeerUnauthenticated("peer sent no certificate".into()))?;
    let der = leaf.as_ref().to_vec();

    let common_name = common_name(&der);

    if tls.check_certificate_host {
        let cn = common_name
            .as_deref()
            .ok_or_else(|| {
                SecurityError::PeerHostnameMismatch("certificate has no common name".into())
            })?;
        if !cn_resolves_to(cn, peer_addr).await {
            return Err(SecurityError::PeerHostnameMismatch(format!(
                "certificate CN {cn} does not resolve to {peer_addr}"
            )));
        }
    }

    if let Some(path) = &tls.fingerprint_file {
        check_fingerprints(path, &der)?;
    }

    Ok(common_name.unwrap_or_else(|| peer_addr.to_string()))
}

fn common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = parse_x509_certificate(der).ok()?;
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(|s| s.to_owned())
}

async fn cn_resolves_to(cn: &str, peer_addr: IpAddr) -> bool {
    if let Ok(literal) = cn.parse::<IpAddr>() {
        return literal == peer_addr || (literal.is_loopback() && peer_addr.is_loopback());
    }
    match tokio::net::lookup_host((cn, 0u16)).await {
        Ok(addrs) => addrs.map(|a: SocketAddr| a.ip()).any(|ip| {
            ip == peer_addr || (ip.is_loopback() && peer_addr.is_loopback())
        }),
        Err(_) => false,
    }
}

fn colon_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn check_fingerprints(path: &Path, der: &[u8]) -> Result<()> {
    let md5_print = colon_hex(&Md5::digest(der));
    let sha1_print = colon_hex(&Sha1::digest(der));
    let contents = fs::read_to_string(path).map_err(SecurityError::read)?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MD5 Fingerprint=") {
            if rest.trim() == md5_print {
                debug!(fingerprint = %md5_print, "md5 fingerprint matched");
                return Ok(());
            }
        }
        if let Some(rest) = line.strip_prefix("SHA1 Fingerprint=") {
            if rest.trim() == sha1_print {
                debug!(fingerprint = %sha1_print, "sha1 fingerprint matched");
                return Ok(());
            }
        }
    }
    Err(SecurityError::FingerprintRejected(sha1_print))
}

// ---------------------------------------------------------------------------
// Verifiers for the no-CA mode
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[derive(Debug)]
struct AnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AnyClientCert {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
