//! cryptctl - Centralized Disk Encryption Key Escrow
//!
//! A key escrow service with paired client tooling: a fleet of client
//! computers encrypt local block devices, while the per-device keys live on a
//! central server. At boot (or on demand) a client authenticates to the
//! server, retrieves the key, and unlocks its volume; while a volume stays
//! unlocked the client reports its liveness, and an administrator can cap the
//! number of concurrent key holders, force a retrieval with a password, queue
//! commands for holders, or erase a key to render the data unrecoverable.
//!
//! # Overview
//!
//! ```text
//! client tool ── CryptClient ══ TLS ══ CryptServer ── Db (key records)
//!                                          │
//!                                          ├── KmipServer (embedded, loopback)
//!                                          └── KmipClient ══ TLS ══ external appliance
//! ```
//!
//! The control plane is an authenticated request-per-connection RPC surface
//! over TLS ([`server::CryptServer`] / [`client::CryptClient`]). Key material
//! is created, served, and destroyed through a KMIP subset (Create, Get,
//! Destroy of AES-256 keys) spoken over the TTLV binary encoding, either by
//! the embedded loopback service ([`kmip_server::KmipServer`]) or by an
//! external KMIP appliance.
//!
//! # Trust model
//!
//! - Password-bearing operations authenticate with a salted SHA-512 hash;
//!   the plain password never crosses the wire, and all comparisons run in
//!   constant time.
//! - A client's identity for liveness and command delivery purposes is the
//!   peer address of its connection, never a name it reports about itself.
//! - Erasing a key destroys the backend material and overwrites the record
//!   file with random data before unlinking it.
//!
//! # Components
//!
//! | module | responsibility |
//! |--------|----------------|
//! | [`ttlv`] | tag-type-length-value wire codec |
//! | [`kmip`] | KMIP message catalogue for Create/Get/Destroy |
//! | [`record`] | key record model, liveness, pending commands |
//! | [`keydb`] | durable record store with UUID and sequence-id indexes |
//! | [`kmip_server`] | embedded loopback key-material service |
//! | [`kmip_client`] | retrying KMIP client for appliances and loopback |
//! | [`protocol`] | control-plane RPC request/response types and framing |
//! | [`server`] | control-plane RPC server and admin state |
//! | [`client`] | control-plane RPC client and unlock/alive loops |
//! | [`mailer`] | notification mail on key creation and retrieval |
//! | [`sysconfig`] | sysconfig file parsing |
//! | [`configs`] | typed server and client configuration |

pub mod client;
pub mod configs;
pub mod keydb;
pub mod kmip;
pub mod kmip_client;
pub mod kmip_server;
pub mod mailer;
pub mod protocol;
pub mod record;
pub mod server;
pub mod sysconfig;
pub mod ttlv;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::CryptClient;
pub use keydb::Db;
pub use protocol::{Request, Response, RpcError};
pub use record::{Heartbeat, PendingCommand, Record};
pub use server::CryptServer;
