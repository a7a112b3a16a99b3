//! Key Database Module
//!
//! The authoritative store of key records: one file per record in a directory
//! only the service account may enter, all records held in memory for fast
//! retrieval, indexed both by volume UUID and by sequence id. All exported
//! functions are safe for concurrent use; a single reader-writer lock
//! serializes every state transition, including sequence allocation.
//!
//! Record files are bincode-encoded version-tagged blobs. Files written by
//! older builds are upgraded in place during load. Erasure overwrites the
//! file with random data before unlinking it, so a disposed key cannot be
//! recovered from the directory.

use crate::record::{unix_now, Heartbeat, PendingCommand, Record, StoredRecord};
use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{info, warn};

pub const DB_DIR_FILE_MODE: u32 = 0o700;
pub const DB_REC_FILE_MODE: u32 = 0o600;

const ERASE_NUM_PASS: usize = 10;
const ERASE_BLOCK_SIZE: usize = 128 * 1024;

/// The key record database. Outlives the RPC and KMIP servers that share it.
pub struct Db {
    dir: PathBuf,
    inner: RwLock<DbInner>,
}

struct DbInner {
    /// Records by volume UUID.
    records: HashMap<String, Record>,
    /// Sequence id to volume UUID.
    ids: HashMap<String, String>,
    /// Highest numeric sequence id ever observed or assigned.
    sequence_high_water: u64,
}

impl DbInner {
    fn next_id(&mut self) -> String {
        self.sequence_high_water += 1;
        self.sequence_high_water.to_string()
    }

    fn index(&mut self, record: Record) {
        // A record re-created under the same UUID gets a fresh id; drop the
        // stale mapping so the two indexes stay in sync.
        if let Some(previous) = self.records.get(&record.uuid) {
            if previous.id != record.id {
                self.ids.remove(&previous.id);
            }
        }
        if let Some(claimed_by) = self.ids.get(&record.id) {
            if claimed_by != &record.uuid {
                warn!(
                    id = %record.id,
                    "sequence id is claimed by records {} and {}", claimed_by, record.uuid
                );
            }
        }
        self.ids.insert(record.id.clone(), record.uuid.clone());
        self.records.insert(record.uuid.clone(), record);
    }
}

impl Db {
    /// Open a key database directory and read every record into memory,
    /// creating the directory if it does not exist. Records that fail to
    /// decode are skipped with a warning; records in an older format are
    /// upgraded and persisted immediately.
    pub fn open(dir: impl AsRef<Path>) -> Result<Db> {
        let db = Self::prepare_directory(dir)?;
        db.reload()?;
        Ok(db)
    }

    /// Open a key database directory but only load a single record into
    /// memory. An error is returned when that record is not on disk.
    pub fn open_one_record(dir: impl AsRef<Path>, uuid: &str) -> Result<Db> {
        let db = Self::prepare_directory(dir)?;
        let stored = Self::load_record_file(&db.record_path(uuid))
            .with_context(|| format!("failed to load record \"{}\"", uuid))?;
        let mut inner = db.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.sequence_high_water = stored_numeric_id(&stored).unwrap_or(0);
        let (record, upgraded) = stored.into_latest(unix_now(), || {
            inner.sequence_high_water += 1;
            inner.sequence_high_water.to_string()
        });
        if upgraded {
            if let Err(err) = db.write_record_file(&record, true) {
                warn!("failed to persist upgraded record \"{}\" - {:#}", record.uuid, err);
            }
        }
        inner.index(record);
        drop(inner);
        Ok(db)
    }

    fn prepare_directory(dir: impl AsRef<Path>) -> Result<Db> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to make db directory \"{}\"", dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&dir, fs::Permissions::from_mode(DB_DIR_FILE_MODE))?;
        }
        Ok(Db {
            dir,
            inner: RwLock::new(DbInner {
                records: HashMap::new(),
                ids: HashMap::new(),
                sequence_high_water: 0,
            }),
        })
    }

    /// Discard the in-memory state and read every record from the directory
    /// again. The sequence allocator never moves backwards, even when the
    /// record carrying its highest id has been deleted behind our back.
    pub fn reload(&self) -> Result<()> {
        let mut stored = Vec::new();
        for entry in fs::read_dir(&self.dir)
            .with_context(|| format!("failed to read db directory \"{}\"", self.dir.display()))?
        {
            let path = entry?.path();
            match Self::load_record_file(&path) {
                Ok(record) => stored.push(record),
                Err(err) => {
                    warn!("non-fatal failure reading record \"{}\" - {:#}", path.display(), err);
                }
            }
        }
        // The allocator resumes above the highest numeric id on disk.
        let high_water = stored.iter().filter_map(stored_numeric_id).max().unwrap_or(0);
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.records.clear();
        inner.ids.clear();
        inner.sequence_high_water = inner.sequence_high_water.max(high_water);
        let now = unix_now();
        let mut loaded = 0usize;
        for record in stored {
            let (record, upgraded) = record.into_latest(now, || {
                inner.sequence_high_water += 1;
                inner.sequence_high_water.to_string()
            });
            if upgraded {
                info!(uuid = %record.uuid, "upgraded record to the current format");
                if let Err(err) = self.write_record_file(&record, true) {
                    warn!("failed to persist upgraded record \"{}\" - {:#}", record.uuid, err);
                }
            }
            inner.index(record);
            loaded += 1;
        }
        info!("successfully loaded database of {} records", loaded);
        Ok(())
    }

    /// Read and deserialize one record file.
    fn load_record_file(path: &Path) -> Result<StoredRecord> {
        let content = fs::read(path)?;
        bincode::deserialize(&content).context("failed to decode record")
    }

    fn record_path(&self, uuid: &str) -> PathBuf {
        self.dir.join(uuid)
    }

    /// Overwrite the record's file with its full encoding. The write replaces
    /// the previous contents entirely, so a concurrent in-process reader
    /// (held off by the database lock) never observes a partial record.
    fn write_record_file(&self, record: &Record, do_sync: bool) -> Result<()> {
        let path = self.record_path(&record.uuid);
        let mut opts = OpenOptions::new();
        opts.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(DB_REC_FILE_MODE);
        }
        let mut file = opts
            .open(&path)
            .with_context(|| format!("failed to open record file \"{}\"", path.display()))?;
        let encoded = bincode::serialize(&StoredRecord::V2(record.clone()))
            .context("failed to encode record")?;
        file.write_all(&encoded)
            .with_context(|| format!("failed to write record file \"{}\"", path.display()))?;
        if do_sync {
            file.sync_all()
                .with_context(|| format!("failed to sync record file \"{}\"", path.display()))?;
        }
        Ok(())
    }

    fn upsert_locked(&self, inner: &mut DbInner, mut record: Record, do_sync: bool) -> Result<String> {
        if record.id.is_empty() {
            record.id = inner.next_id();
        }
        self.write_record_file(&record, do_sync)
            .map_err(|err| {
                let message = format!("failed to write db record for {} - {:#}", record.uuid, err);
                warn!("{}", message);
                anyhow!(message)
            })?;
        let id = record.id.clone();
        inner.index(record);
        Ok(id)
    }

    /// Create or update a record and persist it immediately.
    ///
    /// A record arriving without an id is assigned the next sequence id; a
    /// record that already carries one (typically assigned by an external
    /// KMIP appliance) keeps it untouched.
    ///
    /// # Arguments
    ///
    /// * `record` - The record to store; its `uuid` decides the file name.
    ///
    /// # Returns
    ///
    /// * `Result<String>` - The id under which the record is indexed.
    ///
    /// # Errors
    ///
    /// Returns an error if the record file cannot be written or synced. The
    /// in-memory indexes are only updated after the file write succeeds.
    pub fn upsert(&self, record: Record) -> Result<String> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        self.upsert_locked(&mut inner, record, true)
    }

    /// Look up a record by volume UUID.
    pub fn get_by_uuid(&self, uuid: &str) -> Option<Record> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.records.get(uuid).cloned()
    }

    /// Look up a record by sequence id.
    pub fn get_by_id(&self, id: &str) -> Option<Record> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let uuid = inner.ids.get(id)?;
        inner.records.get(uuid).cloned()
    }

    /// Return all records without their key material, sorted latest-retrieved
    /// first.
    pub fn list(&self) -> Vec<Record> {
        let inner = self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut records: Vec<Record> = inner
            .records
            .values()
            .map(|record| {
                let mut record = record.clone();
                record.key = Vec::new();
                record
            })
            .collect();
        records.sort_by_key(|record| std::cmp::Reverse(record.last_retrieval.timestamp));
        records
    }

    /// Admission control for a retrieval request over a set of UUIDs.
    ///
    /// For each UUID: holders that have missed all of their allowed alive
    /// messages are expired first; then, if `check_max_active` is set and the
    /// record's cap is met by the remaining holders, the request is refused
    /// for that UUID. Otherwise the requester becomes a holder, its message
    /// history starts over with this heartbeat, and the record is persisted.
    ///
    /// # Arguments
    ///
    /// * `heartbeat` - Who is asking, as seen by this server.
    /// * `check_max_active` - Enforce the per-record holder cap. Password
    ///   bearing retrievals pass false and are always admitted.
    /// * `uuids` - The volumes the requester wants to unlock.
    ///
    /// # Returns
    ///
    /// The granted records keyed by UUID, the UUIDs refused because of the
    /// cap, and the UUIDs this database has never heard of.
    pub fn select(
        &self,
        heartbeat: Heartbeat,
        check_max_active: bool,
        uuids: &[String],
    ) -> (HashMap<String, Record>, Vec<String>, Vec<String>) {
        let mut granted = HashMap::new();
        let mut rejected = Vec::new();
        let mut missing = Vec::new();
        let now = unix_now();
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for uuid in uuids {
            let Some(record) = inner.records.get(uuid) else {
                missing.push(uuid.clone());
                continue;
            };
            let mut record = record.clone();
            let (ok, dead) = record.update_last_retrieval(heartbeat.clone(), check_max_active, now);
            if !dead.is_empty() {
                info!(
                    uuid = %uuid,
                    "removed holders that stopped reporting: {:?}",
                    dead.keys().collect::<Vec<_>>()
                );
            }
            if ok {
                // IO failure is logged inside upsert_locked.
                let _ = self.upsert_locked(&mut inner, record.clone(), true);
                granted.insert(record.uuid.clone(), record);
            } else {
                rejected.push(uuid.clone());
            }
        }
        (granted, rejected, missing)
    }

    /// Record and persist an alive message from a host, for each UUID it
    /// claims to hold. UUIDs that are unknown, or whose holder entry for this
    /// host is gone or expired, are returned as rejected.
    pub fn update_alive_message(&self, heartbeat: Heartbeat, uuids: &[String]) -> Vec<String> {
        let mut rejected = Vec::new();
        let now = unix_now();
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for uuid in uuids {
            let Some(record) = inner.records.get(uuid) else {
                rejected.push(uuid.clone());
                continue;
            };
            let mut record = record.clone();
            if record.update_alive_message(heartbeat.clone(), now) {
                let _ = self.upsert_locked(&mut inner, record, false);
            } else {
                rejected.push(uuid.clone());
            }
        }
        rejected
    }

    /// Queue a pending command on a record and persist it.
    pub fn add_pending_command(&self, uuid: &str, command: PendingCommand) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = inner
            .records
            .get(uuid)
            .ok_or_else(|| anyhow!("record \"{}\" does not exist", uuid))?;
        let mut record = record.clone();
        record.add_pending_command(unix_now(), command);
        self.upsert_locked(&mut inner, record, true)?;
        Ok(())
    }

    /// Remove all pending commands of a record and persist it.
    pub fn clear_pending_commands(&self, uuid: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = inner
            .records
            .get(uuid)
            .ok_or_else(|| anyhow!("record \"{}\" does not exist", uuid))?;
        let mut record = record.clone();
        record.clear_pending_commands();
        self.upsert_locked(&mut inner, record, true)?;
        Ok(())
    }

    /// For each UUID, deliver the valid and unseen commands addressed to the
    /// requester, marking them seen. Unknown UUIDs deliver nothing.
    pub fn poll_pending_commands(
        &self,
        requester_ip: &str,
        uuids: &[String],
    ) -> HashMap<String, Vec<PendingCommand>> {
        let mut delivered = HashMap::new();
        let now = unix_now();
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for uuid in uuids {
            let Some(record) = inner.records.get(uuid) else {
                continue;
            };
            let mut record = record.clone();
            let commands = record.poll_pending_commands(requester_ip, now);
            if !commands.is_empty() {
                let _ = self.upsert_locked(&mut inner, record, false);
                delivered.insert(uuid.clone(), commands);
            }
        }
        delivered
    }

    /// Attach a client's result to the matching pending command and persist
    /// the record. Sweeps expired commands as a side effect; unmatched
    /// content leaves the record unchanged apart from the sweep.
    pub fn save_command_result(
        &self,
        requester_ip: &str,
        uuid: &str,
        content: &str,
        result: &str,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(record) = inner.records.get(uuid) else {
            return false;
        };
        let mut record = record.clone();
        let matched = record.save_command_result(requester_ip, content, result, unix_now());
        let _ = self.upsert_locked(&mut inner, record, false);
        matched
    }

    /// Erase a record from memory and disk.
    ///
    /// The record disappears from both indexes and its file is overwritten
    /// with random data before removal, so the key cannot be recovered from
    /// the directory afterwards. The sequence id is never handed out again.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - The record existed and has been destroyed.
    /// * `Ok(false)` - No record is stored under the UUID.
    ///
    /// # Errors
    ///
    /// Returns an error if the overwrite or the removal fails; the record is
    /// already gone from the in-memory indexes at that point.
    pub fn erase(&self, uuid: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(record) = inner.records.remove(uuid) else {
            return Ok(false);
        };
        inner.ids.remove(&record.id);
        secure_erase(&self.record_path(uuid))
            .with_context(|| format!("failed to erase db record for {}", uuid))?;
        Ok(true)
    }
}

/// The numeric value of a stored record's sequence id, if it has one.
fn stored_numeric_id(record: &StoredRecord) -> Option<u64> {
    let id = match record {
        StoredRecord::V0(_) => return None,
        StoredRecord::V1(v1) => &v1.id,
        StoredRecord::V2(v2) => &v2.id,
    };
    id.parse().ok()
}

/// Overwrite a file with random data over several passes, then delete it.
/// Needless to say this is painfully slow. It relies on the file system
/// overwriting data in place, which journaling, compression, caching and
/// RAID layers may not honor.
fn secure_erase(path: &Path) -> Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .with_context(|| format!("failed to open \"{}\"", path.display()))?;
    let file_size = file.metadata()?.len() as usize;
    let mut block = vec![0u8; ERASE_BLOCK_SIZE];
    for _ in 0..ERASE_NUM_PASS {
        file.seek(SeekFrom::Start(0))?;
        let mut written = 0usize;
        while written < file_size {
            let block_size = ERASE_BLOCK_SIZE.min(file_size - written);
            openssl::rand::rand_bytes(&mut block[..block_size])
                .map_err(|err| anyhow!("failed to gather random data - {}", err))?;
            file.write_all(&block[..block_size])?;
            written += block_size;
        }
        file.sync_all()?;
    }
    drop(file);
    fs::remove_file(path).with_context(|| format!("failed to remove \"{}\"", path.display()))?;
    Ok(())
}
