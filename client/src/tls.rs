use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ClientConfig;
use std::env;
use std::sync::Arc;
use tracing::{debug, info_span};

use crate::ClientError;

pub const TLS_CA_CERT: &str = "TLS_CA_CERT";
pub const TLS_CLIENT_CERT: &str = "TLS_CLIENT_CERT";
pub const TLS_CLIENT_KEY: &str = "TLS_CLIENT_KEY";
pub const STOMP_SERVER_NAME: &str = "STOMP_SERVER_NAME";

/// TLS material for `ssl://` broker uris, read from the environment.
#[derive(Debug, Clone)]
pub struct TlsSettings {
    pub ca_certificate_path: String,
    /// Client certificate and key, only needed when the broker wants mutual TLS.
    pub client_identity: Option<(String, String)>,
    /// Overrides the host name presented for SNI and certificate checks.
    pub server_name: Option<String>,
}

impl TlsSettings {
    fn required_env(var: &str) -> Result<String, ClientError> {
        env::var(var).map_err(|source| ClientError::EnvVar {
            var: var.to_string(),
            source,
        })
    }

    pub fn from_env() -> Result<Self, ClientError> {
        let ca_certificate_path = Self::required_env(TLS_CA_CERT)?;

        let client_identity = match (env::var(TLS_CLIENT_CERT), env::var(TLS_CLIENT_KEY)) {
            (Ok(cert), Ok(key)) => Some((cert, key)),
            (Err(_), Err(_)) => None,
            (Ok(_), Err(source)) => {
                return Err(ClientError::EnvVar {
                    var: TLS_CLIENT_KEY.to_string(),
                    source,
                })
            }
            (Err(source), Ok(_)) => {
                return Err(ClientError::EnvVar {
                    var: TLS_CLIENT_CERT.to_string(),
                    source,
                })
            }
        };

        Ok(TlsSettings {
            ca_certificate_path,
            client_identity,
            server_name: env::var(STOMP_SERVER_NAME).ok(),
        })
    }

    pub fn client_config(&self) -> Result<Arc<ClientConfig>, ClientError> {
        let _span = info_span!("stomp.tls.init").entered();

        match rustls::crypto::aws_lc_rs::default_provider().install_default() {
            Ok(_) => debug!("Default crypto provider installed"),
            Err(_) => debug!("Crypto provider already configured"),
        }

        let ca_path = &self.ca_certificate_path;
        let mut root_cert_store = rustls::RootCertStore::empty();
        let ca_certs = CertificateDer::pem_file_iter(ca_path).map_err(|e| {
            ClientError::Tls(format!("Failed to read CA certificate from {ca_path}: {e}"))
        })?;
        for cert in ca_certs {
            let cert = cert.map_err(|e| {
                ClientError::Tls(format!("Failed to parse CA certificate in {ca_path}: {e}"))
            })?;
            root_cert_store.add(cert).map_err(|e| {
                ClientError::Tls(format!("Failed to add CA certificate to root store: {e}"))
            })?;
        }

        let verifier = WebPkiServerVerifier::builder(Arc::new(root_cert_store))
            .build()
            .map_err(|e| ClientError::Tls(format!("Failed to build WebPKI verifier: {e}")))?;

        let builder = ClientConfig::builder().with_webpki_verifier(verifier);

        let config = match &self.client_identity {
            Some((cert_path, key_path)) => {
                let client_cert = CertificateDer::from_pem_file(cert_path).map_err(|e| {
                    ClientError::Tls(format!(
                        "Failed to read client certificate from {cert_path}: {e}"
                    ))
                })?;
                let private_key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
                    ClientError::Tls(format!(
                        "Failed to read client private key from {key_path}: {e}"
                    ))
                })?;
                builder
                    .with_client_auth_cert(vec![client_cert], private_key)
                    .map_err(|e| {
                        ClientError::Tls(format!("Failed to build Rustls client config: {e}"))
                    })?
            }
            None => builder.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}
