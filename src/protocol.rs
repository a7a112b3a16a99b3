//! RPC Protocol Module
//!
//! Defines the Request and Response enums exchanged between the key server
//! and its clients, the typed error kinds the server returns, and the frame
//! format carrying them: a 4-byte big-endian length followed by the bincode
//! encoding, one request and one response per connection.

use crate::record::{PendingCommand, Record};
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use thiserror::Error;

/// Default port for the key server to listen on.
pub const DEFAULT_PORT: u16 = 3737;

/// Length of the random salt that goes with the access password.
pub const LEN_PASS_SALT: usize = 64;

/// Length of the random challenge that must be presented to shut the server
/// down over RPC.
pub const LEN_ADMIN_CHALLENGE: usize = 64;

/// A frame larger than this is a protocol violation and closes the connection.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Salted SHA-512 digest of the access password. The plain password never
/// travels over the wire.
pub type HashedPassword = [u8; 64];

/// Serde helper for the 64-byte digests and challenges.
mod digest_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(digest: &[u8; 64], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(digest)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 64], D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(d)?;
        if bytes.len() != 64 {
            return Err(serde::de::Error::custom(format!(
                "expected 64 bytes, got {}",
                bytes.len()
            )));
        }
        let mut digest = [0u8; 64];
        digest.copy_from_slice(&bytes);
        Ok(digest)
    }
}

/// Typed failures the server reports back to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RpcError {
    #[error("request validation failed: {0}")]
    Validation(String),
    #[error("password is incorrect")]
    BadPassword,
    #[error("shutdown challenge is incorrect")]
    BadChallenge,
    #[error("server configuration has not yet been initialised")]
    NotInitialized,
    #[error("key material backend failure: {0}")]
    Backend(String),
    #[error("{0}")]
    Internal(String),
}

/// Request types accepted by the key server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Confirm the server is configured and the password is good.
    Ping {
        #[serde(with = "digest_serde")]
        password: HashedPassword,
    },
    /// Fetch the salt needed to hash the access password.
    GetSalt,
    /// Create key material and a record for one encrypted volume.
    CreateKey {
        #[serde(with = "digest_serde")]
        password: HashedPassword,
        hostname: String,
        uuid: String,
        mount_point: String,
        mount_options: Vec<String>,
        max_active: i32,
        alive_interval_sec: i64,
        alive_count: i64,
    },
    /// Retrieve keys without a password, subject to the active-holder cap.
    AutoRetrieveKey { hostname: String, uuids: Vec<String> },
    /// Retrieve keys with the password, ignoring the active-holder cap.
    ManualRetrieveKey {
        #[serde(with = "digest_serde")]
        password: HashedPassword,
        hostname: String,
        uuids: Vec<String>,
    },
    /// Report that the requester still holds these keys.
    ReportAlive { hostname: String, uuids: Vec<String> },
    /// Destroy the key material and erase the record.
    EraseKey {
        #[serde(with = "digest_serde")]
        password: HashedPassword,
        hostname: String,
        uuid: String,
    },
    /// Fetch pending commands addressed to the requester.
    PollCommand { uuids: Vec<String> },
    /// Report the outcome of a previously delivered command.
    SaveCommandResult {
        uuid: String,
        content: String,
        result: String,
    },
    /// Close the server listener.
    Shutdown {
        #[serde(with = "digest_serde")]
        challenge: [u8; LEN_ADMIN_CHALLENGE],
    },
}

/// Response types sent back to clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Salt {
        #[serde(with = "digest_serde")]
        salt: [u8; LEN_PASS_SALT],
    },
    KeyCreated { key: Vec<u8> },
    Retrieved {
        granted: HashMap<String, Record>,
        rejected: Vec<String>,
        missing: Vec<String>,
    },
    AliveReport { rejected: Vec<String> },
    Commands {
        commands: HashMap<String, Vec<PendingCommand>>,
    },
    Error(RpcError),
}

/// Write one length-prefixed frame.
pub fn write_frame(stream: &mut impl Write, frame: &impl Serialize) -> Result<()> {
    let payload = bincode::serialize(frame).context("failed to encode frame")?;
    if payload.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the {} byte limit", payload.len(), MAX_FRAME_LEN);
    }
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one length-prefixed frame.
pub fn read_frame<T: DeserializeOwned>(stream: &mut impl Read) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).context("failed to read frame length")?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds the {} byte limit", len, MAX_FRAME_LEN);
    }
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).context("failed to read frame payload")?;
    bincode::deserialize(&payload).context("failed to decode frame")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_round_trip() {
        let request = Request::AutoRetrieveKey {
            hostname: "client-1".to_string(),
            uuids: vec!["uuid-a".to_string(), "uuid-b".to_string()],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();
        assert_eq!(&buf[..4], &(buf.len() as u32 - 4).to_be_bytes());
        let decoded: Request = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_error_response_round_trip() {
        let response = Response::Error(RpcError::Validation("empty mount point".to_string()));
        let mut buf = Vec::new();
        write_frame(&mut buf, &response).unwrap();
        let decoded: Response = read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_read_frame_rejects_oversize_length() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_LEN as u32) + 1).to_be_bytes());
        buf.extend_from_slice(&[0; 16]);
        assert!(read_frame::<Request>(&mut buf.as_slice()).is_err());
    }

    #[test]
    fn test_read_frame_rejects_truncated_payload() {
        let request = Request::GetSalt;
        let mut buf = Vec::new();
        write_frame(&mut buf, &request).unwrap();
        buf.truncate(buf.len() - 1);
        assert!(read_frame::<Request>(&mut buf.as_slice()).is_err());
    }
}
