use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::sync::Arc;

use pgwire::tokio::tokio_rustls::rustls::ServerConfig;
use pgwire::tokio::TlsAcceptor;

/// Build a TLS acceptor from PEM files. Neither path set means plaintext.
pub fn load_tls_acceptor(
    cert_path: Option<&str>,
    key_path: Option<&str>,
) -> io::Result<Option<TlsAcceptor>> {
    let (cert_path, key_path) = match (cert_path, key_path) {
        (None, None) => return Ok(None),
        (Some(c), Some(k)) => (c, k),
        _ => {
            return Err(io::Error::new(
                ErrorKind::InvalidInput,
                "both SLOTLEASE_TLS_CERT and SLOTLEASE_TLS_KEY must be set, or neither",
            ));
        }
    };

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
        .collect::<Result<_, _>>()?;

    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

    config.alpn_protocols = vec![b"postgresql".to_vec()];

    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

#[cfg(test)]
mod tests {
    use super::*;

    // TlsAcceptor has no Debug impl, so no unwrap_err.
    fn err_kind(result: io::Result<Option<TlsAcceptor>>) -> ErrorKind {
        match result {
            Err(e) => e.kind(),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[test]
    fn no_paths_means_plaintext() {
        assert!(load_tls_acceptor(None, None).unwrap().is_none());
    }

    #[test]
    fn half_configured_is_rejected() {
        assert_eq!(err_kind(load_tls_acceptor(Some("cert.pem"), None)), ErrorKind::InvalidInput);
        assert_eq!(err_kind(load_tls_acceptor(None, Some("key.pem"))), ErrorKind::InvalidInput);
    }

    #[test]
    fn missing_cert_file_is_io_error() {
        let dir = std::env::temp_dir().join("slotlease_test_tls");
        let cert = dir.join("absent_cert.pem");
        let key = dir.join("absent_key.pem");
        assert_eq!(err_kind(load_tls_acceptor(cert.to_str(), key.to_str())), ErrorKind::NotFound);
    }
}
