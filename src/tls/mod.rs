use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::route::Route;

// -----------------------------------------------------------------------------
// ----- Backend TLS client (§4.6) ----------------------------------------------

/// Builds the TLS client leg of the PG Backend Handshake Driver's pipeline:
/// TLS 1.2+1.3, trust anchor = `route.ca_path` if present, else an explicit
/// insecure trust manager; hostname/SNI from `route.server_name`.
pub async fn connect(route: &Route, stream: TcpStream) -> std::io::Result<TlsStream<TcpStream>> {
    let connector = build_connector(route).map_err(std::io::Error::other)?;

    let server_name_str = route
        .server_name
        .clone()
        .unwrap_or_else(|| route.host.clone());
    let server_name = ServerName::try_from(server_name_str)
        .map_err(|e| std::io::Error::other(format!("invalid server name: {e}")))?;

    connector.connect(server_name, stream).await
}

fn build_connector(route: &Route) -> Result<TlsConnector, String> {
    let config = match route.ca_path.as_deref() {
        Some(ca_path) => {
            let roots = load_root_store(Path::new(ca_path))?;
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        }
        None => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(config)))
}

fn load_root_store(path: &Path) -> Result<RootCertStore, String> {
    let file = File::open(path).map_err(|e| format!("failed to open ca {}: {e}", path.display()))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("failed to read ca {}: {e}", path.display()))?;

    let mut store = RootCertStore::empty();
    for cert in certs {
        store
            .add(cert)
            .map_err(|e| format!("invalid ca certificate in {}: {e}", path.display()))?;
    }

    Ok(store)
}

// -----------------------------------------------------------------------------
// ----- InsecureVerifier --------------------------------------------------------

/// Explicit insecure trust manager used when a route has no `ca_path`. This
/// mirrors a deliberate choice in the reference system, not an oversight:
/// routes without a CA path opt into skipping verification.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::ED25519,
        ]
    }
}
