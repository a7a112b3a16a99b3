//! Embedded Key Service Module
//!
//! A partially implemented KMIP server that creates and serves encryption
//! keys upon request, tailored to the needs of the RPC server: it listens on
//! loopback only, does not validate client certificates, and authenticates
//! its sole client with a long random password generated at startup.

use crate::keydb::Db;
use crate::kmip::{
    read_full_ttlv, BatchResult, CreateRequest, CreateResponse, DestroyRequest, DestroyResponse,
    GetRequest, GetResponse, RequestHeader, ResponseHeader, AES_KEY_SIZE_BITS, CRYPTO_ALGO_AES,
};
use crate::record::{unix_now, Record};
use crate::server::constant_time_eq;
use crate::ttlv::{self, Item};
use anyhow::{anyhow, bail, Context, Result};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};
use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};

/// Name prefix that explains a key's origin when it is stored on an external
/// KMIP appliance. The key database itself only knows the volume UUID.
pub const KEY_NAME_PREFIX: &str = "cryptctl-";

/// Length of the random password that authenticates the in-process KMIP
/// client.
pub const LEN_KMIP_RANDOM_PASS: usize = 256;

/// Size of the disk encryption keys the service generates.
pub const KMIP_AES_KEY_BYTES: usize = 32;

/// Socket deadline for KMIP conversations.
pub const KMIP_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a new disk encryption key out of the cryptographic random pool.
pub fn new_disk_encryption_key() -> Result<Vec<u8>> {
    let mut key = vec![0u8; KMIP_AES_KEY_BYTES];
    openssl::rand::rand_bytes(&mut key)
        .map_err(|err| anyhow!("system is out of entropy - {}", err))?;
    Ok(key)
}

/// The three request shapes the service understands, told apart by trial
/// decoding.
enum KmipRequest {
    Create(CreateRequest),
    Get(GetRequest),
    Destroy(DestroyRequest),
}

fn decode_request(item: &Item) -> Option<KmipRequest> {
    if let Ok(request) = CreateRequest::from_item(item) {
        return Some(KmipRequest::Create(request));
    }
    if let Ok(request) = GetRequest::from_item(item) {
        return Some(KmipRequest::Get(request));
    }
    if let Ok(request) = DestroyRequest::from_item(item) {
        return Some(KmipRequest::Destroy(request));
    }
    None
}

/// The embedded key-material service backing the RPC server when no external
/// KMIP appliance is configured.
pub struct KmipServer {
    db: Arc<Db>,
    acceptor: Arc<SslAcceptor>,
    listener: TcpListener,
    password_challenge: String,
    shutting_down: AtomicBool,
}

impl KmipServer {
    /// Build the TLS acceptor, bind a loopback listener on an ephemeral port,
    /// and generate the password challenge the in-process client must present.
    pub fn new(db: Arc<Db>, cert_path: &Path, key_path: &Path) -> Result<KmipServer> {
        let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())
            .context("failed to initialise TLS acceptor")?;
        builder
            .set_certificate_chain_file(cert_path)
            .with_context(|| format!("failed to load TLS certificate \"{}\"", cert_path.display()))?;
        builder
            .set_private_key_file(key_path, SslFiletype::PEM)
            .with_context(|| format!("failed to load TLS key \"{}\"", key_path.display()))?;
        let listener =
            TcpListener::bind("127.0.0.1:0").context("failed to bind KMIP loopback listener")?;
        // The KMIP protocol wants a text password, so the random secret is
        // hex-encoded.
        let mut random_pass = [0u8; LEN_KMIP_RANDOM_PASS];
        openssl::rand::rand_bytes(&mut random_pass)
            .map_err(|err| anyhow!("failed to generate KMIP password - {}", err))?;
        let server = KmipServer {
            db,
            acceptor: Arc::new(builder.build()),
            listener,
            password_challenge: hex::encode(random_pass),
            shutting_down: AtomicBool::new(false),
        };
        info!("embedded key service listening on 127.0.0.1:{}", server.port());
        Ok(server)
    }

    /// The ephemeral port the service listens on.
    pub fn port(&self) -> u16 {
        self.listener.local_addr().map(|addr| addr.port()).unwrap_or_default()
    }

    /// The secret the in-process KMIP client must present as its password.
    pub fn password_challenge(&self) -> &str {
        &self.password_challenge
    }

    /// Process incoming requests, blocking the caller until the listener is
    /// told to shut down. One thread per accepted connection; in-flight
    /// requests complete after shutdown.
    pub fn handle_connections(self: Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.shutting_down.load(Ordering::SeqCst) {
                        return;
                    }
                    let server = Arc::clone(&self);
                    thread::spawn(move || {
                        // A non-cooperating client must not take the service
                        // down with it.
                        let outcome = catch_unwind(AssertUnwindSafe(|| {
                            server.handle_connection(stream)
                        }));
                        match outcome {
                            Ok(Err(err)) => {
                                warn!("error occurred with KMIP client {} - {:#}", peer, err)
                            }
                            Err(panic) => {
                                warn!("panic occurred with KMIP client {} - {:?}", peer, panic)
                            }
                            Ok(Ok(())) => {}
                        }
                    });
                }
                Err(err) => {
                    info!("embedded key service quits now - {}", err);
                    return;
                }
            }
        }
    }

    /// Close the listener. Requests already being served run to completion.
    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(("127.0.0.1", self.port()));
    }

    /// Serve exactly one request on the connection and close it.
    fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(KMIP_TIMEOUT))?;
        stream.set_write_timeout(Some(KMIP_TIMEOUT))?;
        let mut tls = self
            .acceptor
            .accept(stream)
            .map_err(|err| anyhow!("TLS handshake failed - {}", err))?;
        let item = read_full_ttlv(&mut tls)?;
        let Some(request) = decode_request(&item) else {
            bail!("server does not understand the request:\n{}", ttlv::describe(&item, 0));
        };
        let response = match request {
            KmipRequest::Create(request) => {
                self.check_password(&request.header)?;
                self.handle_create_request(&request)?.to_item()
            }
            KmipRequest::Get(request) => {
                self.check_password(&request.header)?;
                self.handle_get_request(&request).to_item()
            }
            KmipRequest::Destroy(request) => {
                self.check_password(&request.header)?;
                self.handle_destroy_request(&request).to_item()
            }
        };
        tls.write_all(&ttlv::encode(&response))?;
        Ok(())
    }

    /// Match the request's password against the service's challenge. The
    /// username is ignored; the password alone authorises access.
    fn check_password(&self, header: &RequestHeader) -> Result<()> {
        if !constant_time_eq(header.password.as_bytes(), self.password_challenge.as_bytes()) {
            bail!("KMIP password mismatch");
        }
        Ok(())
    }

    /// Generate the requested key and place it in a database record. The RPC
    /// server later fills in the client computer details.
    fn handle_create_request(&self, request: &CreateRequest) -> Result<CreateResponse> {
        if request.algorithm != CRYPTO_ALGO_AES || request.key_bits != AES_KEY_SIZE_BITS {
            bail!(
                "only AES-{} keys are served, request asked for algorithm {} with {} bits",
                AES_KEY_SIZE_BITS,
                request.algorithm,
                request.key_bits
            );
        }
        let uuid = request
            .key_name
            .strip_prefix(KEY_NAME_PREFIX)
            .unwrap_or(&request.key_name)
            .to_string();
        let now = unix_now();
        let id = self
            .db
            .upsert(Record {
                uuid,
                creation_time: now,
                key: new_disk_encryption_key()?,
                ..Default::default()
            })
            .map_err(|err| anyhow!("failed to store new key - {:#}", err))?;
        info!("created a key named \"{}\" with id \"{}\"", request.key_name, id);
        Ok(CreateResponse {
            header: ResponseHeader::new(now),
            result: BatchResult::success(),
            unique_id: id,
        })
    }

    /// Respond with the key bytes stored under the id, or not-found.
    fn handle_get_request(&self, request: &GetRequest) -> GetResponse {
        match self.db.get_by_id(&request.unique_id) {
            Some(record) => GetResponse {
                header: ResponseHeader::new(record.creation_time),
                result: BatchResult::success(),
                unique_id: request.unique_id.clone(),
                key: record.key,
            },
            None => GetResponse {
                header: ResponseHeader::new(unix_now()),
                result: BatchResult::not_found(),
                unique_id: String::new(),
                key: Vec::new(),
            },
        }
    }

    /// Acknowledge destruction of the key under the id. The record removal
    /// itself is carried out by the RPC server once this call returns.
    fn handle_destroy_request(&self, request: &DestroyRequest) -> DestroyResponse {
        match self.db.get_by_id(&request.unique_id) {
            Some(record) => DestroyResponse {
                header: ResponseHeader::new(record.creation_time),
                result: BatchResult::success(),
                unique_id: request.unique_id.clone(),
            },
            None => DestroyResponse {
                header: ResponseHeader::new(unix_now()),
                result: BatchResult::not_found(),
                unique_id: String::new(),
            },
        }
    }
}
