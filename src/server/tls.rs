//! TLS server context built from PEM files.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tracing::info;

/// Errors raised while loading certificates and keys.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read PEM data from {}: {source}", path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} does not contain any certificates", path.display())]
    NoCertificates { path: PathBuf },

    #[error("{} does not contain a private key", path.display())]
    NoPrivateKey { path: PathBuf },

    #[error("invalid TLS configuration: {0}")]
    Config(#[from] rustls::Error),

    #[error("invalid client verification roots: {0}")]
    Verifier(#[from] VerifierBuilderError),
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Open {
            path: path.to_owned(),
            source,
        })
}

/// Reads every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            path: path.to_owned(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates {
            path: path.to_owned(),
        });
    }
    Ok(certs)
}

/// Reads the first private key (PKCS#1, PKCS#8 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(&mut open(path)?)
        .map_err(|source| TlsError::Pem {
            path: path.to_owned(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey {
            path: path.to_owned(),
        })
}

/// Builds a server context from a certificate chain and a private key.
///
/// With `verify_file`, clients must present a certificate that chains to
/// one of the roots in that file; the handshake fails otherwise.
pub fn server_config(
    cert_file: &Path,
    private_key_file: &Path,
    verify_file: Option<&Path>,
) -> Result<ServerConfig, TlsError> {
    let certs = load_certs(cert_file)?;
    let key = load_private_key(private_key_file)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder =
        ServerConfig::builder_with_provider(Arc::clone(&provider)).with_safe_default_protocol_versions()?;

    let config = match verify_file {
        Some(path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(path)? {
                roots.add(cert)?;
            }
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
            info!(roots = %path.display(), "client certificate verification enabled");
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)?
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key)?,
    };
    Ok(config)
}
