//! Cluster TLS material.
//!
//! Generates the cluster CA and node certificates, and builds the rustls
//! configurations used by the `https` listener and requester.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tracing::info;

use ward_core::config::TlsFiles;

use crate::error::{TransportError, TransportResult};

/// ALPN protocol spoken on the `https` port.
pub const ALPN_H2: &[u8] = b"h2";

/// A generated certificate and private key pair.
#[derive(Debug, Clone)]
pub struct CertKeyPair {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// The cluster CA, kept in memory to sign node certificates.
pub struct ClusterCa {
    pub pair: CertKeyPair,
    cert: rcgen::Certificate,
    key: KeyPair,
}

/// Generate a self-signed cluster CA.
pub fn generate_ca(cluster_name: &str) -> TransportResult<ClusterCa> {
    let mut params = CertificateParams::default();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "Ward");
    dn.push(DnType::CommonName, format!("{cluster_name} cluster CA"));
    params.distinguished_name = dn;

    params.not_after = rcgen::date_time_ymd(2036, 1, 1);

    let key = KeyPair::generate()?;
    let cert = params.self_signed(&key)?;

    info!(cluster = %cluster_name, "generated cluster CA certificate");

    Ok(ClusterCa {
        pair: CertKeyPair {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        },
        cert,
        key,
    })
}

impl ClusterCa {
    /// Sign a certificate for `nodename`, valid for server and client use.
    ///
    /// `addresses` become subject alternative names: IP SANs for literal
    /// addresses, DNS SANs otherwise.
    pub fn sign_node(&self, nodename: &str, addresses: &[String]) -> TransportResult<CertKeyPair> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::OrganizationName, "Ward");
        dn.push(DnType::CommonName, nodename);
        params.distinguished_name = dn;

        for addr in addresses {
            if let Ok(ip) = addr.parse::<std::net::IpAddr>() {
                params.subject_alt_names.push(rcgen::SanType::IpAddress(ip));
            } else {
                params
                    .subject_alt_names
                    .push(rcgen::SanType::DnsName(addr.clone().try_into()?));
            }
        }
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];
        params.not_after = rcgen::date_time_ymd(2031, 1, 1);

        let node_key = KeyPair::generate()?;
        let node_cert = params.signed_by(&node_key, &self.cert, &self.key)?;

        info!(node = %nodename, sans = addresses.len(), "generated node certificate");

        Ok(CertKeyPair {
            cert_pem: node_cert.pem(),
            key_pem: node_key.serialize_pem(),
        })
    }
}

// ── PEM loading ────────────────────────────────────────────────

pub fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TransportError::Certificate(format!(
            "no certificate in {}",
            path.display()
        )));
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        TransportError::Certificate(format!("no private key in {}", path.display()))
    })
}

fn load_roots(path: &Path) -> TransportResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots.add(cert)?;
    }
    Ok(roots)
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

// ── rustls configs ─────────────────────────────────────────────

/// Server config for the `https` listener.
///
/// With a CA configured, clients may present a certificate signed by it
/// (mutual TLS); clients without one are still accepted and must send
/// encrypted envelopes.
pub fn server_config(files: &TlsFiles) -> TransportResult<Arc<ServerConfig>> {
    let certs = load_certs(&files.cert)?;
    let key = load_key(&files.key)?;

    let builder = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;
    let builder = match &files.ca {
        Some(ca) => {
            let verifier =
                WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(ca)?), provider())
                    .allow_unauthenticated()
                    .build()
                    .map_err(|e| TransportError::Tls(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
        None => builder.with_no_client_auth(),
    };
    let mut config = builder.with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

/// Client config for the requester.
///
/// Without a CA the server certificate is not checked: the payload then
/// travels as an encrypted envelope, which authenticates both ends.
pub fn client_config(files: Option<&TlsFiles>) -> TransportResult<Arc<ClientConfig>> {
    let builder = ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;
    let builder = match files.and_then(|f| f.ca.as_deref()) {
        Some(ca) => builder.with_root_certificates(load_roots(ca)?),
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(envelope_auth::AnyServerCert)),
    };
    let mut config = match files {
        Some(f) => builder.with_client_auth_cert(load_certs(&f.cert)?, load_key(&f.key)?)?,
        None => builder.with_no_client_auth(),
    };
    config.alpn_protocols = vec![ALPN_H2.to_vec()];
    Ok(Arc::new(config))
}

mod envelope_auth {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, Error, SignatureScheme};

    #[derive(Debug)]
    pub struct AnyServerCert;

    impl ServerCertVerifier for AnyServerCert {
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
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls12_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            )
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            rustls::crypto::verify_tls13_signature(
                message,
                cert,
                dss,
                &rustls::crypto::ring::default_provider().signature_verification_algorithms,
            )
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes()
        }
    }
}

/// Write a CA and one certificate per node under `dir`.
///
/// Layout: `ca.pem`, `ca.key`, `<node>.pem`, `<node>.key`.
pub fn write_cluster_certs(
    dir: &Path,
    cluster_name: &str,
    nodes: &[(String, Vec<String>)],
) -> TransportResult<()> {
    std::fs::create_dir_all(dir)?;
    let ca = generate_ca(cluster_name)?;
    std::fs::write(dir.join("ca.pem"), &ca.pair.cert_pem)?;
    write_private(&dir.join("ca.key"), &ca.pair.key_pem)?;
    for (node, addresses) in nodes {
        let pair = ca.sign_node(node, addresses)?;
        std::fs::write(dir.join(format!("{node}.pem")), &pair.cert_pem)?;
        write_private(&dir.join(format!("{node}.key")), &pair.key_pem)?;
    }
    Ok(())
}

fn write_private(path: &Path, pem: &str) -> TransportResult<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::write(path, pem)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
