//! Key Record Module
//!
//! Entity definitions for the key database: one record per encrypted volume,
//! the liveness bookkeeping of the hosts holding its key, and the queue of
//! pending commands addressed to those hosts. The admission predicates that
//! decide whether a retrieval request may be granted live here; the database
//! wraps them in locking and persistence.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Version of the record shape written to disk by this build.
pub const CURRENT_RECORD_VERSION: u32 = 2;

/// Current wall clock in seconds since the Unix epoch.
pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

/// A client computer actively using an encryption key regularly sends alive
/// messages to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Client computer's host name as reported by itself.
    pub hostname: String,
    /// Client computer's IP as seen by this server.
    pub ip: String,
    /// Message timestamp as seen by this server.
    pub timestamp: i64,
}

/// An out-of-band instruction queued by an administrator for one holder,
/// delivered when the holder polls.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCommand {
    /// Beginning of the command's validity window.
    pub valid_from: i64,
    /// Length of the validity window in seconds.
    pub validity_sec: i64,
    /// IP of the holder the command is addressed to.
    pub ip: String,
    /// Opaque command content interpreted by the client.
    pub content: String,
    /// Set once the command has been delivered via polling.
    pub seen_by_client: bool,
    /// Result text the client reported back, if any.
    pub client_result: String,
}

impl PendingCommand {
    /// A command is valid while its validity window has not elapsed.
    pub fn is_valid(&self, now: i64) -> bool {
        now < self.valid_from + self.validity_sec
    }
}

/// A key record that knows all about one encrypted volume, its mount point,
/// the hosts holding its key, and the commands queued for those hosts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Volume UUID, the primary logical key.
    pub uuid: String,
    /// Sequence-assigned id when the embedded key service created the
    /// material, or the external appliance's id. Secondary index.
    pub id: String,
    /// Wall-clock creation timestamp, set once.
    pub creation_time: i64,
    /// Encryption key in plain form. Empty when the material lives on an
    /// external KMIP appliance.
    pub key: Vec<u8>,
    /// Mount point on the client computer.
    pub mount_point: String,
    /// File system mount options.
    pub mount_options: Vec<String>,
    /// Maximum allowed concurrent key holders; zero or negative means
    /// unlimited.
    pub max_active: i32,
    /// Interval in seconds at which holders must report their liveness.
    pub alive_interval_sec: i64,
    /// A holder is considered dead after missing this many alive messages.
    pub alive_count: i64,
    /// The most recent host to have retrieved this key.
    pub last_retrieval: Heartbeat,
    /// Recent alive messages (latest last), keyed by holder IP as seen by
    /// this server. Each sequence is capped at `alive_count` entries.
    pub alive_messages: HashMap<String, Vec<Heartbeat>>,
    /// Commands queued per target IP, delivered via polling.
    pub pending_commands: HashMap<String, Vec<PendingCommand>>,
}

/// True if the string is a plausible volume UUID.
pub fn is_well_formed_uuid(uuid: &str) -> bool {
    !uuid.is_empty() && uuid.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

impl Record {
    /// Return mount options in a single string, as accepted by the mount
    /// command.
    pub fn mount_options_str(&self) -> String {
        self.mount_options.join(",")
    }

    /// Return an error if a record attribute does not make sense.
    pub fn validate(&self) -> Result<()> {
        if !is_well_formed_uuid(&self.uuid) {
            bail!("UUID \"{}\" does not look like a volume UUID", self.uuid);
        }
        if self.mount_point.len() < 2 {
            bail!("mount point \"{}\" looks too short", self.mount_point);
        }
        if self.alive_interval_sec < 1 {
            bail!(
                "alive interval is {} but it should be a positive integer",
                self.alive_interval_sec
            );
        }
        if self.alive_count < 1 {
            bail!(
                "alive count is {} but it should be a positive integer",
                self.alive_count
            );
        }
        Ok(())
    }

    /// A holder is expired once its latest heartbeat is older than the alive
    /// interval multiplied by the alive count.
    fn expiry_age(&self) -> i64 {
        self.alive_interval_sec * self.alive_count
    }

    /// Determine whether a host is still alive according to its recent alive
    /// messages, returning its final message alongside.
    pub fn is_host_alive(&self, host_ip: &str, now: i64) -> (bool, Option<Heartbeat>) {
        match self.alive_messages.get(host_ip).and_then(|beats| beats.last()) {
            Some(final_beat) => {
                let alive = final_beat.timestamp >= now - self.expiry_age();
                (alive, Some(final_beat.clone()))
            }
            None => (false, None),
        }
    }

    /// Remove all dead hosts from the alive message history, returning each
    /// dead host's final message.
    pub fn remove_dead_hosts(&mut self, now: i64) -> HashMap<String, Heartbeat> {
        let mut dead = HashMap::new();
        let dead_ips: Vec<String> = self
            .alive_messages
            .keys()
            .filter(|ip| !self.is_host_alive(ip.as_str(), now).0)
            .cloned()
            .collect();
        for ip in dead_ips {
            let (_, final_beat) = self.is_host_alive(&ip, now);
            dead.insert(ip.clone(), final_beat.unwrap_or_default());
            self.alive_messages.remove(&ip);
        }
        dead
    }

    /// Admission decision for a retrieval request. Dead hosts are expired
    /// first; if the maximum number of active holders is enforced and already
    /// met, nothing is updated and the request is refused. Otherwise the last
    /// retrieval and the requester's message history begin a new epoch with
    /// this heartbeat.
    pub fn update_last_retrieval(
        &mut self,
        latest_beat: Heartbeat,
        check_max_active: bool,
        now: i64,
    ) -> (bool, HashMap<String, Heartbeat>) {
        let dead = self.remove_dead_hosts(now);
        if check_max_active
            && self.max_active > 0
            && self.alive_messages.len() >= self.max_active as usize
        {
            return (false, dead);
        }
        self.alive_messages
            .insert(latest_beat.ip.clone(), vec![latest_beat.clone()]);
        self.last_retrieval = latest_beat;
        (true, dead)
    }

    /// Record the latest alive message in the history of a host that already
    /// holds the key. A host whose previous messages have all expired is no
    /// longer a holder and is refused.
    pub fn update_alive_message(&mut self, latest_beat: Heartbeat, now: i64) -> bool {
        self.remove_dead_hosts(now);
        match self.alive_messages.get_mut(&latest_beat.ip) {
            Some(beats) => {
                beats.push(latest_beat);
                let cap = self.alive_count.max(1) as usize;
                if beats.len() > cap {
                    beats.drain(..beats.len() - cap);
                }
                true
            }
            None => false,
        }
    }

    /// Drop every command whose validity window has elapsed, removing IP
    /// buckets that become empty.
    pub fn expire_pending_commands(&mut self, now: i64) {
        for commands in self.pending_commands.values_mut() {
            commands.retain(|cmd| cmd.is_valid(now));
        }
        self.pending_commands.retain(|_, commands| !commands.is_empty());
    }

    /// Queue a command for one holder, sweeping expired commands first.
    pub fn add_pending_command(&mut self, now: i64, command: PendingCommand) {
        self.expire_pending_commands(now);
        self.pending_commands
            .entry(command.ip.clone())
            .or_default()
            .push(command);
    }

    /// Remove all pending commands of all hosts.
    pub fn clear_pending_commands(&mut self) {
        self.pending_commands.clear();
    }

    /// Return the valid and not yet seen commands addressed to the requester,
    /// marking each returned command as seen.
    pub fn poll_pending_commands(&mut self, requester_ip: &str, now: i64) -> Vec<PendingCommand> {
        let mut delivered = Vec::new();
        if let Some(commands) = self.pending_commands.get_mut(requester_ip) {
            for cmd in commands.iter_mut() {
                if cmd.is_valid(now) && !cmd.seen_by_client {
                    cmd.seen_by_client = true;
                    delivered.push(cmd.clone());
                }
            }
        }
        delivered
    }

    /// Attach the client's result to the command matching the requester IP
    /// and content, forcing it seen. Expired commands are swept beforehand;
    /// unmatched content is a no-op. Returns whether a command matched.
    pub fn save_command_result(
        &mut self,
        requester_ip: &str,
        content: &str,
        result: &str,
        now: i64,
    ) -> bool {
        self.expire_pending_commands(now);
        if let Some(commands) = self.pending_commands.get_mut(requester_ip) {
            for cmd in commands.iter_mut() {
                if cmd.content == content {
                    cmd.client_result = result.to_string();
                    cmd.seen_by_client = true;
                    return true;
                }
            }
        }
        false
    }

    /// Format all attributes (except the binary key) for logging and mail
    /// notifications, using the specified separator.
    pub fn format_attrs(&self, separator: &str) -> String {
        format!(
            "Timestamp=\"{}\"{}IP=\"{}\"{}Hostname=\"{}\"{}FileSystemUUID=\"{}\"{}MountPoint=\"{}\"{}MountOptions=\"{}\"",
            self.last_retrieval.timestamp,
            separator,
            self.last_retrieval.ip,
            separator,
            self.last_retrieval.hostname,
            separator,
            self.uuid,
            separator,
            self.mount_point.replace('"', "\\\""),
            separator,
            self.mount_options_str()
        )
    }
}

// ============================================================================
// On-disk representation
// ============================================================================

/// First record shape: no sequence id, no creation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordV0 {
    pub uuid: String,
    pub key: Vec<u8>,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub max_active: i32,
    pub alive_interval_sec: i64,
    pub alive_count: i64,
    pub last_retrieval: Heartbeat,
    pub alive_messages: HashMap<String, Vec<Heartbeat>>,
}

/// Second record shape: sequence id and creation time, no command queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordV1 {
    pub uuid: String,
    pub id: String,
    pub creation_time: i64,
    pub key: Vec<u8>,
    pub mount_point: String,
    pub mount_options: Vec<String>,
    pub max_active: i32,
    pub alive_interval_sec: i64,
    pub alive_count: i64,
    pub last_retrieval: Heartbeat,
    pub alive_messages: HashMap<String, Vec<Heartbeat>>,
}

/// What actually resides in a record file: a version-tagged variant, so that
/// files written by older builds load and upgrade cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoredRecord {
    V0(RecordV0),
    V1(RecordV1),
    V2(Record),
}

impl StoredRecord {
    pub fn version(&self) -> u32 {
        match self {
            StoredRecord::V0(_) => 0,
            StoredRecord::V1(_) => 1,
            StoredRecord::V2(_) => 2,
        }
    }

    /// Upgrade the stored shape to the current record, one version step at a
    /// time. The id assigner is only consulted for records predating sequence
    /// ids. Returns the record and whether an upgrade took place.
    pub fn into_latest(self, now: i64, assign_id: impl FnOnce() -> String) -> (Record, bool) {
        let upgraded = self.version() < CURRENT_RECORD_VERSION;
        let v1 = match self {
            StoredRecord::V0(v0) => RecordV1 {
                uuid: v0.uuid,
                id: assign_id(),
                creation_time: now,
                key: v0.key,
                mount_point: v0.mount_point,
                mount_options: v0.mount_options,
                max_active: v0.max_active,
                alive_interval_sec: v0.alive_interval_sec,
                alive_count: v0.alive_count,
                last_retrieval: v0.last_retrieval,
                alive_messages: v0.alive_messages,
            },
            StoredRecord::V1(v1) => v1,
            StoredRecord::V2(record) => return (record, false),
        };
        let record = Record {
            uuid: v1.uuid,
            id: v1.id,
            creation_time: v1.creation_time,
            key: v1.key,
            mount_point: v1.mount_point,
            mount_options: v1.mount_options,
            max_active: v1.max_active,
            alive_interval_sec: v1.alive_interval_sec,
            alive_count: v1.alive_count,
            last_retrieval: v1.last_retrieval,
            alive_messages: v1.alive_messages,
            pending_commands: HashMap::new(),
        };
        (record, upgraded)
    }
}
