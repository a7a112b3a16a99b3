//! KMIP Client Module
//!
//! A KMIP client supporting the three operations the escrow service needs:
//! create, get, and destroy. It interoperates with the embedded key service
//! as well as external appliances; every request rides its own TLS
//! connection, retried across the configured endpoints.

use crate::kmip::{
    read_full_ttlv, BatchResult, CreateRequest, CreateResponse, DestroyRequest, DestroyResponse,
    GetRequest, GetResponse, RequestHeader,
};
use crate::kmip_server::{KMIP_AES_KEY_BYTES, KMIP_TIMEOUT};
use crate::ttlv::{self, Item};
use anyhow::{anyhow, bail, Context, Result};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use secrecy::{ExposeSecret, SecretString};
use std::io::Write;
use std::net::TcpStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use tracing::warn;

/// Maximum number of attempts at conversing with the KMIP endpoints.
pub const CLIENT_MAX_RETRY: usize = 7;

/// Artificial delay between attempts after a failure.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// KMIP client holding credentials and TLS settings; connections are
/// established per request.
pub struct KmipClient {
    server_addrs: Vec<String>,
    username: String,
    password: SecretString,
    connector: SslConnector,
    verify_server: bool,
}

impl KmipClient {
    /// Initialise a KMIP client. No connection is established until the first
    /// request.
    pub fn new(
        server_addrs: Vec<String>,
        username: &str,
        password: &str,
        ca_pem: Option<&Path>,
        client_cert: Option<(&Path, &Path)>,
        verify_server: bool,
    ) -> Result<KmipClient> {
        let mut builder =
            SslConnector::builder(SslMethod::tls()).context("failed to initialise TLS connector")?;
        if let Some(ca) = ca_pem {
            builder
                .set_ca_file(ca)
                .with_context(|| format!("failed to load CA bundle \"{}\"", ca.display()))?;
        }
        if let Some((cert, key)) = client_cert {
            builder
                .set_certificate_chain_file(cert)
                .with_context(|| format!("failed to load client certificate \"{}\"", cert.display()))?;
            builder
                .set_private_key_file(key, SslFiletype::PEM)
                .with_context(|| format!("failed to load client key \"{}\"", key.display()))?;
        }
        Ok(KmipClient {
            server_addrs,
            username: username.to_string(),
            password: SecretString::new(password.to_string()),
            connector: builder.build(),
            verify_server,
        })
    }

    fn request_header(&self) -> RequestHeader {
        RequestHeader::new(&self.username, self.password.expose_secret())
    }

    /// Establish a TLS connection, send exactly one request, read exactly one
    /// response, and close. Endpoints are tried round-robin with a delay
    /// after each failure.
    fn converse_with_retry(&self, request: &Item) -> Result<Item> {
        if self.server_addrs.is_empty() {
            bail!("no KMIP server addresses are configured");
        }
        let encoded = ttlv::encode(request);
        let mut last_failure = None;
        for attempt in 0..CLIENT_MAX_RETRY {
            if attempt > 0 {
                sleep(RETRY_DELAY);
            }
            let addr = &self.server_addrs[attempt % self.server_addrs.len()];
            match self.converse_once(addr, &encoded) {
                Ok(response) => return Ok(response),
                Err(err) => {
                    warn!("IO failure occurred with KMIP server {} - {:#}", addr, err);
                    last_failure = Some(err);
                }
            }
        }
        Err(last_failure.unwrap_or_else(|| anyhow!("no attempt was made")))
            .context("ultimately failed in all attempts at conversing with KMIP server")
    }

    fn converse_once(&self, addr: &str, encoded: &[u8]) -> Result<Item> {
        let host = addr.rsplit_once(':').map(|(host, _)| host).unwrap_or(addr);
        let stream = TcpStream::connect(addr)
            .with_context(|| format!("failed to connect to KMIP server {}", addr))?;
        stream.set_read_timeout(Some(KMIP_TIMEOUT))?;
        stream.set_write_timeout(Some(KMIP_TIMEOUT))?;
        let mut config = self.connector.configure()?;
        if !self.verify_server {
            config.set_verify(SslVerifyMode::NONE);
            config.set_verify_hostname(false);
        }
        let mut tls = config
            .connect(host, stream)
            .map_err(|err| anyhow!("TLS handshake with {} failed - {}", addr, err))?;
        tls.write_all(encoded)?;
        Ok(read_full_ttlv(&mut tls)?)
    }

    /// Create a new disk encryption key under the name and return the id the
    /// server assigned to it.
    pub fn create_key(&self, key_name: &str) -> Result<String> {
        let request = CreateRequest::new_aes256(self.request_header(), key_name);
        let response_item = self.converse_with_retry(&request.to_item())?;
        let response = CreateResponse::from_item(&response_item)
            .context("failed to deserialise create response")?;
        result_to_error(&response.result)?;
        if response.unique_id.is_empty() {
            bail!("KMIP server did not return a key id");
        }
        Ok(response.unique_id)
    }

    /// Retrieve a disk encryption key by its id.
    pub fn get_key(&self, id: &str) -> Result<Vec<u8>> {
        let request = GetRequest {
            header: self.request_header(),
            unique_id: id.to_string(),
        };
        let response_item = self.converse_with_retry(&request.to_item())?;
        let response =
            GetResponse::from_item(&response_item).context("failed to deserialise get response")?;
        result_to_error(&response.result)?;
        if response.key.len() != KMIP_AES_KEY_BYTES {
            bail!("key content of id {} looks wrong ({} bytes)", id, response.key.len());
        }
        Ok(response.key)
    }

    /// Destroy a key record. A key that is already gone counts as destroyed.
    pub fn destroy_key(&self, id: &str) -> Result<()> {
        let request = DestroyRequest {
            header: self.request_header(),
            unique_id: id.to_string(),
        };
        let response_item = self.converse_with_retry(&request.to_item())?;
        let response = DestroyResponse::from_item(&response_item)
            .context("failed to deserialise destroy response")?;
        if response.result.is_not_found() {
            return Ok(());
        }
        result_to_error(&response.result)
    }
}

/// Translate a failed batch result into an error.
fn result_to_error(result: &BatchResult) -> Result<()> {
    if result.is_success() {
        return Ok(());
    }
    bail!(
        "KMIP response error: status {}, reason {}, message {}",
        result.status,
        result.reason.unwrap_or_default(),
        result.message.as_deref().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_converse_requires_addresses() {
        let client = KmipClient::new(Vec::new(), "", "secret", None, None, true).unwrap();
        let err = client.create_key("cryptctl-x").unwrap_err();
        assert!(format!("{:#}", err).contains("no KMIP server addresses"));
    }

    #[test]
    fn test_result_to_error() {
        result_to_error(&BatchResult::success()).unwrap();
        let err = result_to_error(&BatchResult::not_found()).unwrap_err();
        assert!(err.to_string().contains("reason 1"));
        assert!(BatchResult::not_found().is_not_found());
    }
}
