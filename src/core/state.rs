//! Persisted resource records and address locks.
//!
//! Layout under `<state_dir>/<environment>/`:
//! - `state.json`: address-keyed records with a store-level `serial`
//! - `locks.json`: address locks held by in-flight runs
//! - `events.jsonl`: run event log (see [`crate::tripwire::eventlog`])
//!
//! Every write is atomic (temp file + rename). Each read-check-write runs
//! under an exclusive OS lock on `<environment>/.lock`, shared by every
//! handle and process using the directory. Writes check the on-disk serial
//! against the serial last loaded and fail on mismatch, so external
//! mutation between load and write is detected instead of overwritten.

use super::error::{EngineError, LockConflict, StateError};
use super::types::{Address, Attributes};
use crate::tripwire::{eventlog, hasher};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Supported state file schema.
pub const STATE_SCHEMA: &str = "1";

/// Last-applied snapshot of one address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub kind: String,

    /// Starts at 1, incremented on every committed change
    pub version: u64,

    /// Observed attributes; secret-valued attributes hold their handle marker
    pub attributes: Attributes,

    /// Attribute names declared at last apply
    #[serde(default)]
    pub declared: Vec<String>,

    /// Attribute names whose value is a secret handle
    #[serde(default)]
    pub sensitive: BTreeSet<String>,

    /// Addresses this resource depended on at last apply
    #[serde(default)]
    pub dependencies: BTreeSet<Address>,

    #[serde(default)]
    pub create_before_destroy: bool,

    /// Replaced instances whose delete has not succeeded yet
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deposed: Vec<Attributes>,

    pub applied_at: String,

    /// BLAKE3 over the canonical attribute JSON
    pub checksum: String,
}

impl ResourceRecord {
    /// Build a record, stamping `applied_at` and the checksum.
    pub fn new(kind: impl Into<String>, version: u64, attributes: Attributes) -> Self {
        let checksum = hasher::hash_attributes(&attributes);
        Self {
            kind: kind.into(),
            version,
            attributes,
            declared: Vec::new(),
            sensitive: BTreeSet::new(),
            dependencies: BTreeSet::new(),
            create_before_destroy: false,
            deposed: Vec::new(),
            applied_at: eventlog::now_iso8601(),
            checksum,
        }
    }

    /// Recompute the checksum after mutating attributes.
    pub fn rehash(&mut self) {
        self.checksum = hasher::hash_attributes(&self.attributes);
    }
}

/// On-disk `state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    pub schema: String,
    pub serial: u64,
    pub lineage: String,
    pub generator: String,
    pub updated_at: String,
    #[serde(default)]
    pub resources: BTreeMap<Address, ResourceRecord>,
}

impl StateFile {
    fn empty() -> Self {
        Self {
            schema: STATE_SCHEMA.to_string(),
            serial: 0,
            lineage: eventlog::generate_id("l"),
            generator: format!("terrane {}", env!("CARGO_PKG_VERSION")),
            updated_at: eventlog::now_iso8601(),
            resources: BTreeMap::new(),
        }
    }
}

/// One held address lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockEntry {
    pub owner: String,
    pub acquired_at: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LockTable {
    #[serde(default)]
    locks: BTreeMap<Address, LockEntry>,
}

struct Inner {
    state: StateFile,
    /// Serial of the file as last read or written by this handle
    loaded_serial: u64,
    on_disk: bool,
}

/// Handle on one environment's state directory.
///
/// Shared by concurrent executor tasks; every read-modify-write happens
/// under the internal mutex, and never across an await point.
pub struct StateStore {
    root: PathBuf,
    dir: PathBuf,
    environment: String,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("dir", &self.dir)
            .field("environment", &self.environment)
            .finish()
    }
}

/// Exclusive lock on the environment directory, released on drop.
struct DirLock {
    file: std::fs::File,
}

impl DirLock {
    fn acquire(dir: &Path) -> Result<Self, StateError> {
        std::fs::create_dir_all(dir).map_err(|e| StateError::io(dir, e))?;
        let path = dir.join(".lock");
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StateError::io(&path, e))?;
        FileExt::lock_exclusive(&file).map_err(|e| StateError::io(&path, e))?;
        Ok(Self { file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Derive the state file path for an environment.
pub fn state_file_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(environment).join("state.json")
}

/// Derive the lock file path for an environment.
pub fn lock_file_path(state_dir: &Path, environment: &str) -> PathBuf {
    state_dir.join(environment).join("locks.json")
}

impl StateStore {
    /// Open (or lazily create) the store for an environment.
    pub fn open(state_dir: &Path, environment: &str) -> Result<Self, StateError> {
        let dir = state_dir.join(environment);
        let path = state_file_path(state_dir, environment);
        let (state, on_disk) = match read_json::<StateFile>(&path)? {
            Some(state) => {
                if state.schema != STATE_SCHEMA {
                    return Err(StateError::UnsupportedSchema {
                        found: state.schema,
                        expected: STATE_SCHEMA.to_string(),
                    });
                }
                (state, true)
            }
            None => (StateFile::empty(), false),
        };
        tracing::debug!(
            environment,
            serial = state.serial,
            records = state.resources.len(),
            "opened state"
        );
        Ok(Self {
            root: state_dir.to_path_buf(),
            dir,
            environment: environment.to_string(),
            inner: Mutex::new(Inner {
                loaded_serial: state.serial,
                state,
                on_disk,
            }),
        })
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// The state directory shared by all environments.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The `<state_dir>/<environment>` directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self) -> PathBuf {
        state_file_path(&self.root, &self.environment)
    }

    fn lock_path(&self) -> PathBuf {
        lock_file_path(&self.root, &self.environment)
    }

    fn guard(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the in-process mutex, then the directory lock. Always in this
    /// order; the directory lock is never taken twice by one thread.
    fn exclusive(&self) -> Result<(MutexGuard<'_, Inner>, DirLock), StateError> {
        let inner = self.guard();
        let dir = DirLock::acquire(&self.dir)?;
        Ok((inner, dir))
    }

    pub fn serial(&self) -> u64 {
        self.guard().state.serial
    }

    pub fn lineage(&self) -> String {
        self.guard().state.lineage.clone()
    }

    /// Snapshot of every record.
    pub fn records(&self) -> BTreeMap<Address, ResourceRecord> {
        self.guard().state.resources.clone()
    }

    pub fn get(&self, address: &Address) -> Option<ResourceRecord> {
        self.guard().state.resources.get(address).cloned()
    }

    pub fn len(&self) -> usize {
        self.guard().state.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write an empty state file if none exists yet (`init`).
    pub fn initialize(&self) -> Result<bool, StateError> {
        let (mut inner, _dir) = self.exclusive()?;
        if inner.on_disk || self.state_path().exists() {
            return Ok(false);
        }
        self.persist(&mut inner)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Store a record for `address`.
    ///
    /// `expected` is the version the caller based its change on (`None`
    /// when no record existed). The new record's version must exceed it.
    /// The caller must hold the address lock.
    pub fn commit(
        &self,
        owner: &str,
        address: &Address,
        expected: Option<u64>,
        record: ResourceRecord,
    ) -> Result<u64, StateError> {
        let (mut inner, _dir) = self.exclusive()?;
        self.require_lock(owner, address)?;
        check_version(&inner.state, address, expected)?;
        if record.version <= expected.unwrap_or(0) {
            return Err(StateError::VersionMismatch {
                address: address.clone(),
                expected: expected.unwrap_or(0) + 1,
                found: record.version,
            });
        }
        let version = record.version;
        let previous = inner.state.resources.insert(address.clone(), record);
        if let Err(e) = self.persist(&mut inner) {
            match previous {
                Some(prev) => inner.state.resources.insert(address.clone(), prev),
                None => inner.state.resources.remove(address),
            };
            return Err(e);
        }
        tracing::debug!(%address, version, "committed record");
        Ok(version)
    }

    /// Remove the record for `address` after a successful delete.
    pub fn remove(
        &self,
        owner: &str,
        address: &Address,
        expected: Option<u64>,
    ) -> Result<(), StateError> {
        let (mut inner, _dir) = self.exclusive()?;
        self.require_lock(owner, address)?;
        check_version(&inner.state, address, expected)?;
        let Some(previous) = inner.state.resources.remove(address) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&mut inner) {
            inner.state.resources.insert(address.clone(), previous);
            return Err(e);
        }
        tracing::debug!(%address, "removed record");
        Ok(())
    }

    /// Caller holds the directory lock.
    fn persist(&self, inner: &mut Inner) -> Result<(), StateError> {
        let path = self.state_path();
        if let Some(disk) = read_json::<StateFile>(&path)? {
            if disk.serial != inner.loaded_serial || !inner.on_disk {
                return Err(StateError::Conflict {
                    expected: inner.loaded_serial,
                    found: disk.serial,
                });
            }
        }
        inner.state.serial += 1;
        inner.state.updated_at = eventlog::now_iso8601();
        if let Err(e) = write_json_atomic(&path, &inner.state) {
            inner.state.serial -= 1;
            return Err(e);
        }
        inner.loaded_serial = inner.state.serial;
        inner.on_disk = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Current lock table, read from disk.
    pub fn locks(&self) -> Result<BTreeMap<Address, LockEntry>, StateError> {
        let _inner = self.guard();
        Ok(self.read_locks()?.locks)
    }

    fn read_locks(&self) -> Result<LockTable, StateError> {
        Ok(read_json::<LockTable>(&self.lock_path())?.unwrap_or_default())
    }

    /// Lock every address for `owner`, or none of them.
    ///
    /// Fails with [`LockConflict`] if any address is held by another owner.
    /// Addresses already held by `owner` are kept as-is.
    pub fn acquire_locks(
        &self,
        owner: &str,
        addresses: &BTreeSet<Address>,
    ) -> Result<(), EngineError> {
        let (_inner, _dir) = self.exclusive()?;
        let mut table = self.read_locks()?;

        for address in addresses {
            if let Some(held) = table.locks.get(address) {
                if held.owner != owner {
                    return Err(LockConflict {
                        address: address.clone(),
                        holder: held.owner.clone(),
                        since: held.acquired_at.clone(),
                    }
                    .into());
                }
            }
        }

        let now = eventlog::now_iso8601();
        for address in addresses {
            table
                .locks
                .entry(address.clone())
                .or_insert_with(|| LockEntry {
                    owner: owner.to_string(),
                    acquired_at: now.clone(),
                });
        }
        write_json_atomic(&self.lock_path(), &table)?;
        tracing::debug!(owner, count = addresses.len(), "acquired locks");
        Ok(())
    }

    /// Release one address if held by `owner`.
    pub fn release_lock(&self, owner: &str, address: &Address) -> Result<(), StateError> {
        let (_inner, _dir) = self.exclusive()?;
        let mut table = self.read_locks()?;
        if table.locks.get(address).is_some_and(|l| l.owner == owner) {
            table.locks.remove(address);
            write_json_atomic(&self.lock_path(), &table)?;
        }
        Ok(())
    }

    /// Release every lock held by `owner`; returns the released addresses.
    ///
    /// Also used by `unlock` to clear a stale owner after a crashed run.
    pub fn force_unlock(&self, owner: &str) -> Result<Vec<Address>, StateError> {
        let (_inner, _dir) = self.exclusive()?;
        let mut table = self.read_locks()?;
        let released: Vec<Address> = table
            .locks
            .iter()
            .filter(|(_, l)| l.owner == owner)
            .map(|(a, _)| a.clone())
            .collect();
        if !released.is_empty() {
            for a in &released {
                table.locks.remove(a);
            }
            write_json_atomic(&self.lock_path(), &table)?;
        }
        Ok(released)
    }

    /// Caller holds the directory lock.
    fn require_lock(&self, owner: &str, address: &Address) -> Result<(), StateError> {
        let table = self.read_locks()?;
        match table.locks.get(address) {
            Some(l) if l.owner == owner => Ok(()),
            _ => Err(StateError::NotLocked {
                address: address.clone(),
                owner: owner.to_string(),
            }),
        }
    }
}

fn check_version(
    state: &StateFile,
    address: &Address,
    expected: Option<u64>,
) -> Result<(), StateError> {
    let current = state.resources.get(address).map(|r| r.version);
    if current != expected {
        return Err(StateError::VersionMismatch {
            address: address.clone(),
            expected: expected.unwrap_or(0),
            found: current.unwrap_or(0),
        });
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| StateError::io(path, e))?;
    let value = serde_json::from_str(&content).map_err(|e| StateError::corrupt(path, e))?;
    Ok(Some(value))
}

/// Atomic write: uniquely named temp file in the same directory + rename.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StateError::io(parent, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StateError::io(parent, e))?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StateError::io(tmp.path(), e))?;
    tmp.persist(path).map_err(|e| StateError::io(path, e.error))?;
    Ok(())
}
