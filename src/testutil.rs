//! Shared test support: a throwaway self-signed TLS identity and a fully
//! wired server on an ephemeral loopback port.

use crate::client::CryptClient;
use crate::configs::ServerConfig;
use crate::mailer::Mailer;
use crate::protocol::LEN_PASS_SALT;
use crate::server::{hash_password, new_salt, CryptServer};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::extension::{ExtendedKeyUsage, KeyUsage};
use openssl::x509::{X509Name, X509};
use std::fs;
use std::path::{Path, PathBuf};

/// Generate a self-signed certificate for "localhost" and write the PEM pair
/// into the directory, returning (certificate path, key path).
pub fn tls_cert_files(dir: &Path) -> (PathBuf, PathBuf) {
    let rsa = openssl::rsa::Rsa::generate(2048).unwrap();
    let private_key = PKey::from_rsa(rsa).unwrap();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
    builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();

    let mut name_builder = X509Name::builder().unwrap();
    name_builder.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name_builder.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
    builder.set_pubkey(&private_key).unwrap();

    let ku = KeyUsage::new()
        .critical()
        .digital_signature()
        .key_encipherment()
        .build()
        .unwrap();
    builder.append_extension(ku).unwrap();
    let eku = ExtendedKeyUsage::new().server_auth().build().unwrap();
    builder.append_extension(eku).unwrap();
    builder.sign(&private_key, MessageDigest::sha256()).unwrap();
    let certificate = builder.build();

    let cert_path = dir.join("test.crt");
    let key_path = dir.join("test.key");
    fs::write(&cert_path, certificate.to_pem().unwrap()).unwrap();
    fs::write(&key_path, private_key.private_key_to_pem_pkcs8().unwrap()).unwrap();
    (cert_path, key_path)
}

pub const TEST_RPC_PASS: &str = "pass";

/// A running server plus everything a test needs to talk to it.
pub struct TestServer {
    pub server: std::sync::Arc<CryptServer>,
    pub salt: [u8; LEN_PASS_SALT],
}

impl TestServer {
    /// A client wired to the test server, trusting its throwaway certificate.
    pub fn client(&self) -> CryptClient {
        let mut client = CryptClient::new("localhost", self.server.port(), None, None).unwrap();
        client.insecure_skip_verify = true;
        client
    }
}

/// Start a server in a testing configuration: ephemeral loopback port,
/// temporary key database, embedded key service, no mail. With `initialised`
/// false the password salt and hash stay all-zero, as on a freshly installed
/// server.
pub fn start_test_server(tmp: &tempfile::TempDir, initialised: bool) -> TestServer {
    let (cert, key) = tls_cert_files(tmp.path());
    let (salt, hash) = if initialised {
        let salt = new_salt().unwrap();
        (salt, hash_password(&salt, TEST_RPC_PASS))
    } else {
        ([0u8; LEN_PASS_SALT], [0u8; LEN_PASS_SALT])
    };
    let config = ServerConfig {
        password_hash: hash,
        password_salt: salt,
        tls_cert_pem: cert,
        tls_cert_key_pem: key,
        tls_ca_pem: None,
        validate_client_cert: false,
        address: "127.0.0.1".to_string(),
        port: 0,
        key_db_dir: tmp.path().join("keydb"),
        kmip_addresses: Vec::new(),
        kmip_user: String::new(),
        kmip_pass: String::new(),
        kmip_tls_do_verify: true,
        kmip_ca_pem: None,
        kmip_tls_cert_pem: None,
        kmip_tls_cert_key_pem: None,
        key_creation_subject: "key created".to_string(),
        key_creation_greeting: "a key was created".to_string(),
        key_retrieval_subject: "key retrieved".to_string(),
        key_retrieval_greeting: "a key was retrieved".to_string(),
    };
    let server = std::sync::Arc::new(CryptServer::new(config, Mailer::default()).unwrap());
    server.listen_rpc().unwrap();
    let accept_server = std::sync::Arc::clone(&server);
    std::thread::spawn(move || accept_server.handle_connections());
    TestServer { server, salt }
}
