//! RPC Client Module
//!
//! Counterpart of the RPC server. Every call deliberately rides its own TLS
//! connection: key retrievals are rare, so simplicity in connection handling
//! beats throughput. Also carries the long-running client-side routines: the
//! unlock retry loop and the alive-report loop.

use crate::configs::ClientConfig;
use crate::protocol::{
    read_frame, write_frame, HashedPassword, Request, Response, RpcError, LEN_ADMIN_CHALLENGE,
    LEN_PASS_SALT,
};
use crate::record::{PendingCommand, Record};
use anyhow::{anyhow, bail, Context, Result};
use openssl::ssl::{SslConnector, SslFiletype, SslMethod, SslVerifyMode};
use std::collections::HashMap;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::thread::sleep;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Deadline for establishing the TLS connection to the server.
pub const RPC_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between attempts of the unlock retry loop.
pub const AUTO_UNLOCK_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the alive-report loop.
pub const REPORT_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// Consecutive failures reported before the loops go quiet until the next
/// success.
const MAX_REPORTED_FAILURES: usize = 5;

/// Make a best effort at determining this computer's host name. Failure
/// degrades to an empty string; the server never trusts the value anyway.
pub fn get_hostname() -> String {
    match nix::unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(err) => {
            warn!("cannot determine system host name - {}", err);
            String::new()
        }
    }
}

/// RPC client holding the server address and TLS trust settings. Connections
/// are established per call.
pub struct CryptClient {
    server_host: String,
    server_port: u16,
    connector: SslConnector,
    /// Accept whatever certificate the server presents. Tests use this with
    /// throwaway certificates.
    pub insecure_skip_verify: bool,
}

impl CryptClient {
    /// Initialise an RPC client. No connection is made until the first call.
    pub fn new(
        server_host: &str,
        server_port: u16,
        ca_pem: Option<&Path>,
        client_cert: Option<(&Path, &Path)>,
    ) -> Result<CryptClient> {
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
        Ok(CryptClient {
            server_host: server_host.to_string(),
            server_port,
            connector: builder.build(),
            insecure_skip_verify: false,
        })
    }

    /// Initialise an RPC client from the client sysconfig settings.
    pub fn from_config(config: &ClientConfig) -> Result<CryptClient> {
        let client_cert = match (&config.tls_cert_pem, &config.tls_cert_key_pem) {
            (Some(cert), Some(key)) => Some((cert.as_path(), key.as_path())),
            _ => None,
        };
        Self::new(
            &config.server_host,
            config.server_port,
            config.tls_ca_pem.as_deref(),
            client_cert,
        )
    }

    /// Establish a fresh TLS connection, send one request, and read one
    /// response. A typed error from the server becomes this function's error.
    fn do_rpc(&self, request: &Request) -> Result<Response> {
        let addr = (self.server_host.as_str(), self.server_port)
            .to_socket_addrs()
            .with_context(|| format!("failed to resolve {}", self.server_host))?
            .next()
            .ok_or_else(|| anyhow!("no address found for {}", self.server_host))?;
        let stream = TcpStream::connect_timeout(&addr, RPC_DIAL_TIMEOUT).with_context(|| {
            format!("failed to connect to {} on port {}", self.server_host, self.server_port)
        })?;
        stream.set_read_timeout(Some(RPC_DIAL_TIMEOUT))?;
        stream.set_write_timeout(Some(RPC_DIAL_TIMEOUT))?;
        let mut config = self.connector.configure()?;
        if self.insecure_skip_verify {
            config.set_verify(SslVerifyMode::NONE);
            config.set_verify_hostname(false);
        }
        let mut tls = config
            .connect(&self.server_host, stream)
            .map_err(|err| anyhow!("TLS handshake with {} failed - {}", self.server_host, err))?;
        write_frame(&mut tls, request)?;
        let response: Response = read_frame(&mut tls)?;
        if let Response::Error(err) = response {
            return Err(RpcFailure(err).into());
        }
        Ok(response)
    }

    /// Ping the server; errs on a communication mishap, a missing initial
    /// setup, or a bad password.
    pub fn ping(&self, password: HashedPassword) -> Result<()> {
        self.do_rpc(&Request::Ping { password })?;
        Ok(())
    }

    /// Retrieve the salt that went into the server's access password hash.
    pub fn get_salt(&self) -> Result<[u8; LEN_PASS_SALT]> {
        match self.do_rpc(&Request::GetSalt)? {
            Response::Salt { salt } => Ok(salt),
            other => bail!("unexpected response to GetSalt: {:?}", other),
        }
    }

    /// Create key material and a record for one encrypted volume, returning
    /// the key bytes.
    #[allow(clippy::too_many_arguments)]
    pub fn create_key(
        &self,
        password: HashedPassword,
        hostname: &str,
        uuid: &str,
        mount_point: &str,
        mount_options: &[String],
        max_active: i32,
        alive_interval_sec: i64,
        alive_count: i64,
    ) -> Result<Vec<u8>> {
        let request = Request::CreateKey {
            password,
            hostname: hostname.to_string(),
            uuid: uuid.to_string(),
            mount_point: mount_point.to_string(),
            mount_options: mount_options.to_vec(),
            max_active,
            alive_interval_sec,
            alive_count,
        };
        match self.do_rpc(&request)? {
            Response::KeyCreated { key } => Ok(key),
            other => bail!("unexpected response to CreateKey: {:?}", other),
        }
    }

    /// Retrieve keys without a password, subject to the active-holder cap.
    /// Returns (granted, rejected, missing).
    pub fn auto_retrieve_key(
        &self,
        hostname: &str,
        uuids: &[String],
    ) -> Result<(HashMap<String, Record>, Vec<String>, Vec<String>)> {
        let request = Request::AutoRetrieveKey {
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        };
        match self.do_rpc(&request)? {
            Response::Retrieved { granted, rejected, missing } => Ok((granted, rejected, missing)),
            other => bail!("unexpected response to AutoRetrieveKey: {:?}", other),
        }
    }

    /// Retrieve keys with the password, regardless of the active-holder cap.
    /// Returns (granted, missing).
    pub fn manual_retrieve_key(
        &self,
        password: HashedPassword,
        hostname: &str,
        uuids: &[String],
    ) -> Result<(HashMap<String, Record>, Vec<String>)> {
        let request = Request::ManualRetrieveKey {
            password,
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        };
        match self.do_rpc(&request)? {
            Response::Retrieved { granted, missing, .. } => Ok((granted, missing)),
            other => bail!("unexpected response to ManualRetrieveKey: {:?}", other),
        }
    }

    /// Report that this computer still holds the keys. Returns the UUIDs the
    /// server no longer considers this computer eligible to hold.
    pub fn report_alive(&self, hostname: &str, uuids: &[String]) -> Result<Vec<String>> {
        let request = Request::ReportAlive {
            hostname: hostname.to_string(),
            uuids: uuids.to_vec(),
        };
        match self.do_rpc(&request)? {
            Response::AliveReport { rejected } => Ok(rejected),
            other => bail!("unexpected response to ReportAlive: {:?}", other),
        }
    }

    /// Tell the server to destroy the key material and erase the record.
    pub fn erase_key(&self, password: HashedPassword, hostname: &str, uuid: &str) -> Result<()> {
        self.do_rpc(&Request::EraseKey {
            password,
            hostname: hostname.to_string(),
            uuid: uuid.to_string(),
        })?;
        Ok(())
    }

    /// Fetch pending commands addressed to this computer, keyed by UUID.
    pub fn poll_command(&self, uuids: &[String]) -> Result<HashMap<String, Vec<PendingCommand>>> {
        match self.do_rpc(&Request::PollCommand { uuids: uuids.to_vec() })? {
            Response::Commands { commands } => Ok(commands),
            other => bail!("unexpected response to PollCommand: {:?}", other),
        }
    }

    /// Report the outcome of a previously delivered command.
    pub fn save_command_result(&self, uuid: &str, content: &str, result: &str) -> Result<()> {
        self.do_rpc(&Request::SaveCommandResult {
            uuid: uuid.to_string(),
            content: content.to_string(),
            result: result.to_string(),
        })?;
        Ok(())
    }

    /// Shut down the server's listener.
    pub fn shutdown(&self, challenge: [u8; LEN_ADMIN_CHALLENGE]) -> Result<()> {
        self.do_rpc(&Request::Shutdown { challenge })?;
        Ok(())
    }
}

/// A typed error the server sent back, carried through anyhow.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct RpcFailure(pub RpcError);

/// Make continuous attempts at retrieving the encryption key of one volume,
/// sleeping between attempts, until the retry window closes. Stops early when
/// the server does not have the key at all. Returns the granted record.
pub fn auto_retrieve_with_retry(
    client: &CryptClient,
    uuid: &str,
    max_retry: Duration,
) -> Result<Record> {
    let begin = Instant::now();
    let uuids = [uuid.to_string()];
    let mut failures = 0usize;
    loop {
        // Always send the up-to-date hostname.
        let attempt = client.auto_retrieve_key(&get_hostname(), &uuids);
        let failure = match attempt {
            Ok((mut granted, rejected, missing)) => {
                if let Some(record) = granted.remove(uuid) {
                    return Ok(record);
                }
                if !missing.is_empty() {
                    bail!("server does not have encryption key for \"{}\"", uuid);
                }
                if !rejected.is_empty() {
                    anyhow!("maximum number of active key holders is exceeded")
                } else {
                    anyhow!("server did not grant the key")
                }
            }
            Err(err) => err,
        };
        if begin.elapsed() > max_retry {
            return Err(failure.context(format!(
                "failed to unlock \"{}\" and have given up after {} seconds",
                uuid,
                max_retry.as_secs()
            )));
        }
        // Among consecutive failures, only the first few are reported.
        if failures == MAX_REPORTED_FAILURES {
            info!("suppressing further unlock failure messages until success");
        } else if failures < MAX_REPORTED_FAILURES {
            warn!(
                "failed to unlock \"{}\", will retry in {} seconds - {:#}",
                uuid,
                AUTO_UNLOCK_RETRY_INTERVAL.as_secs(),
                failure
            );
        }
        failures += 1;
        sleep(AUTO_UNLOCK_RETRY_INTERVAL);
    }
}

/// Poll the server once for pending commands addressed to this computer,
/// hand each one to the executor, and report the outcomes back. Returns the
/// number of commands processed. Interpretation of command content (such as
/// unmounting a volume) stays with the calling tool.
pub fn poll_commands_once(
    client: &CryptClient,
    uuids: &[String],
    execute: &mut dyn FnMut(&str, &PendingCommand) -> String,
) -> Result<usize> {
    let mut processed = 0usize;
    let delivered = client.poll_command(uuids)?;
    for (uuid, commands) in &delivered {
        for command in commands {
            let outcome = execute(uuid, command);
            if let Err(err) = client.save_command_result(uuid, &command.content, &outcome) {
                warn!(
                    "failed to report result of command \"{}\" for disk \"{}\" - {:#}",
                    command.content, uuid, err
                );
            }
            processed += 1;
        }
    }
    Ok(processed)
}

/// Continuously poll the server for pending commands addressed to this
/// computer, executing and acknowledging each delivery. Transport failures
/// are tolerated and retried on the next round.
pub fn poll_command_loop(
    client: &CryptClient,
    uuids: &[String],
    interval: Duration,
    execute: &mut dyn FnMut(&str, &PendingCommand) -> String,
) {
    let mut failures = 0usize;
    loop {
        match poll_commands_once(client, uuids, execute) {
            Ok(count) => {
                if count > 0 {
                    info!("processed {} pending commands", count);
                }
                failures = 0;
            }
            Err(err) => {
                if failures == MAX_REPORTED_FAILURES {
                    info!("suppressing further command-poll failures until next success");
                } else if failures < MAX_REPORTED_FAILURES {
                    warn!("failed to poll for pending commands - {:#}", err);
                }
                failures += 1;
            }
        }
        sleep(interval);
    }
}

/// Continuously send alive reports to the server to indicate that this
/// computer still holds the encryption key. Blocks the caller until the
/// server rejects this computer.
pub fn report_alive_loop(client: &CryptClient, uuid: &str) -> Result<()> {
    info!("begin sending alive messages for encrypted disk \"{}\"", uuid);
    let uuids = [uuid.to_string()];
    let mut failures = 0usize;
    loop {
        match client.report_alive(&get_hostname(), &uuids) {
            Ok(rejected) if !rejected.is_empty() => {
                bail!(
                    "stop sending alive messages for disk \"{}\" because server has rejected it",
                    uuid
                );
            }
            Ok(_) => {
                if failures > 0 {
                    info!("alive message for disk \"{}\" succeeded again", uuid);
                }
                failures = 0;
            }
            Err(err) => {
                if failures == MAX_REPORTED_FAILURES {
                    info!("suppressing further alive-message failures until next success");
                } else if failures < MAX_REPORTED_FAILURES {
                    warn!("failed to send alive message for disk \"{}\" - {:#}", uuid, err);
                }
                failures += 1;
            }
        }
        sleep(REPORT_ALIVE_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::hash_password;
    use crate::testutil::{start_test_server, TEST_RPC_PASS};
    use tempfile::TempDir;

    #[test]
    fn test_get_hostname_is_best_effort() {
        // Whatever the environment, the lookup must not fail.
        let _ = get_hostname();
    }

    #[test]
    fn test_rpc_error_is_typed() {
        let tmp = TempDir::new().unwrap();
        let harness = start_test_server(&tmp, true);
        let client = harness.client();
        let err = client.ping([0u8; 64]).unwrap_err();
        match err.downcast_ref::<RpcFailure>() {
            Some(RpcFailure(RpcError::BadPassword)) => {}
            other => panic!("expected BadPassword, got {:?}", other),
        }
        harness.server.shutdown();
    }

    #[test]
    fn test_hashed_password_flow_via_salt() {
        let tmp = TempDir::new().unwrap();
        let harness = start_test_server(&tmp, true);
        let client = harness.client();
        // The client derives the wire password from the salt it fetched.
        let salt = client.get_salt().unwrap();
        client.ping(hash_password(&salt, TEST_RPC_PASS)).unwrap();
        harness.server.shutdown();
    }

    #[test]
    fn test_auto_retrieve_with_retry_stops_on_missing_key() {
        let tmp = TempDir::new().unwrap();
        let harness = start_test_server(&tmp, true);
        let client = harness.client();
        let err =
            auto_retrieve_with_retry(&client, "no-such-uuid", Duration::from_secs(60)).unwrap_err();
        assert!(err.to_string().contains("does not have encryption key"), "{}", err);
        harness.server.shutdown();
    }

    #[test]
    fn test_poll_commands_once_executes_and_acknowledges() {
        let tmp = TempDir::new().unwrap();
        let harness = start_test_server(&tmp, true);
        let client = harness.client();
        let password = hash_password(&harness.salt, TEST_RPC_PASS);
        client
            .create_key(password, "host-a", "uuid-p", "/mnt/p", &[], 1, 1, 4)
            .unwrap();
        let uuids = ["uuid-p".to_string()];
        harness
            .server
            .db()
            .add_pending_command(
                "uuid-p",
                PendingCommand {
                    valid_from: crate::record::unix_now(),
                    validity_sec: 3600,
                    ip: "127.0.0.1".to_string(),
                    content: "umount".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();

        let executed = std::cell::RefCell::new(Vec::new());
        let mut execute = |uuid: &str, command: &PendingCommand| {
            executed.borrow_mut().push((uuid.to_string(), command.content.clone()));
            "done".to_string()
        };
        assert_eq!(poll_commands_once(&client, &uuids, &mut execute).unwrap(), 1);
        assert_eq!(*executed.borrow(), vec![("uuid-p".to_string(), "umount".to_string())]);
        // The result has been attached and the command is not delivered again.
        let record = harness.server.db().get_by_uuid("uuid-p").unwrap();
        assert_eq!(record.pending_commands["127.0.0.1"][0].client_result, "done");
        assert_eq!(poll_commands_once(&client, &uuids, &mut execute).unwrap(), 0);
        harness.server.shutdown();
    }

    #[test]
    fn test_report_alive_loop_stops_on_rejection() {
        let tmp = TempDir::new().unwrap();
        let harness = start_test_server(&tmp, true);
        let client = harness.client();
        // The server never heard of this volume, so the very first report is
        // rejected and the loop returns.
        let err = report_alive_loop(&client, "uuid-unknown").unwrap_err();
        assert!(err.to_string().contains("server has rejected it"), "{}", err);
        harness.server.shutdown();
    }

    #[test]
    fn test_auto_retrieve_with_retry_returns_granted_record() {
        let tmp = TempDir::new().unwrap();
        let harness = start_test_server(&tmp, true);
        let client = harness.client();
        let password = hash_password(&harness.salt, TEST_RPC_PASS);
        client
            .create_key(password, "host-a", "uuid-r", "/mnt/r", &[], 0, 1, 4)
            .unwrap();
        let record = auto_retrieve_with_retry(&client, "uuid-r", Duration::from_secs(60)).unwrap();
        assert_eq!(record.uuid, "uuid-r");
        assert_eq!(record.key.len(), 32);
        harness.server.shutdown();
    }
}
