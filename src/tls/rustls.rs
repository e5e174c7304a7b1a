use std::{fs::File, io::BufReader, sync::Arc};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::PgStream;
use crate::config::{SslMode, TlsConfig};
use crate::error::{Result, StreamerError};
use crate::protocol::framing::write_ssl_request;

/// Send SSLRequest and upgrade when the server answers 'S'.
pub async fn negotiate(mut tcp: TcpStream, tls: &TlsConfig, host: &str) -> Result<PgStream> {
    if tls.mode == SslMode::Disable {
        return Ok(PgStream::Plain(tcp));
    }

    write_ssl_request(&mut tcp).await?;
    let mut resp = [0u8; 1];
    tcp.read_exact(&mut resp).await?;

    if resp[0] != b'S' {
        return match tls.mode {
            SslMode::Prefer => Ok(PgStream::Plain(tcp)),
            mode => Err(StreamerError::Tls(format!(
                "server rejected SSLRequest and sslmode is {mode:?}"
            ))),
        };
    }

    let cfg = client_config(tls)?;
    let sni = tls.sni_hostname.clone().unwrap_or_else(|| host.to_string());
    let server_name = ServerName::try_from(sni)
        .map_err(|e| StreamerError::Tls(format!("invalid SNI hostname: {e}")))?;

    let stream = TlsConnector::from(Arc::new(cfg))
        .connect(server_name, tcp)
        .await
        .map_err(|e| StreamerError::Tls(format!("tls handshake failed: {e}")))?;

    Ok(PgStream::Tls(Box::new(stream)))
}

fn client_config(tls: &TlsConfig) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    match &tls.ca_pem_path {
        Some(path) => {
            let f = File::open(path)
                .map_err(|e| StreamerError::Tls(format!("open {}: {e}", path.display())))?;
            let certs = rustls_pemfile::certs(&mut BufReader::new(f))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| StreamerError::Tls(format!("parse CA pem: {e}")))?;
            roots.add_parsable_certificates(certs);
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }

    let roots = Arc::new(roots);
    let mut cfg = ClientConfig::builder()
        .with_root_certificates(roots.clone())
        .with_no_client_auth();

    match tls.mode {
        // encrypt, do not authenticate the server
        SslMode::Prefer | SslMode::Require => {
            cfg.dangerous().set_certificate_verifier(Arc::new(AcceptAnyCert));
        }
        SslMode::VerifyCa => {
            let inner = WebPkiServerVerifier::builder(roots)
                .build()
                .map_err(|e| StreamerError::Tls(format!("certificate verifier: {e}")))?;
            cfg.dangerous().set_certificate_verifier(Arc::new(ChainOnly(inner)));
        }
        SslMode::VerifyFull | SslMode::Disable => {}
    }
    Ok(cfg)
}

/// `verify-ca`: the chain must lead to a trusted root, the host name may differ.
#[derive(Debug)]
struct ChainOnly(Arc<WebPkiServerVerifier>);

impl ServerCertVerifier for ChainOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self.0.verify_server_cert(end_entity, intermediates, server_name, ocsp, now) {
            // NotValidForName and, on newer rustls, NotValidForNameContext
            Err(rustls::Error::InvalidCertificate(e))
                if format!("{e:?}").starts_with("NotValidForName") =>
            {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.0.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.supported_verify_schemes()
    }
}

#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
        ]
    }
}
