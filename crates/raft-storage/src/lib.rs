//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written by raft-peer under its state lock, encodes raft-core's PersistentState
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing, load/save helpers

pub mod codec;

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use raft_core::PersistentState;

pub use codec::{decode_state, encode_state, StorageError};

/// trait for durable storage of raft state
///
/// state and snapshot are opaque bytes. implementations must make
/// `save_state_and_snapshot` atomic: after a crash either both or neither
/// of the new values are visible.
pub trait Storage: Send {
    /// the last saved state, empty on first boot
    fn read_state(&self) -> io::Result<Vec<u8>>;

    /// replace the saved state, keeping the snapshot
    fn save_state(&mut self, state: &[u8]) -> io::Result<()>;

    /// the last saved snapshot, empty if none
    fn read_snapshot(&self) -> io::Result<Vec<u8>>;

    /// replace state and snapshot together
    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()>;

    /// size in bytes of the saved state
    fn state_size(&self) -> io::Result<usize>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

/// Loads what a previous incarnation saved. First boot yields the default
/// state and no snapshot.
pub fn load(storage: &dyn Storage) -> Result<(PersistentState, Vec<u8>), StorageError> {
    let state = decode_state(&storage.read_state()?)?.unwrap_or_default();
    let snapshot = storage.read_snapshot()?;
    Ok((state, snapshot))
}

/// Encodes and saves `state`, together with `snapshot` when one is given.
pub fn save(
    storage: &mut dyn Storage,
    state: &PersistentState,
    snapshot: Option<&[u8]>,
) -> Result<(), StorageError> {
    let bytes = encode_state(state)?;
    match snapshot {
        Some(snapshot) => storage.save_state_and_snapshot(&bytes, snapshot)?,
        None => storage.save_state(&bytes)?,
    }
    Ok(())
}

// -- file storage implementation --

const DATA_FILE: &str = "raft.dat";
const TEMP_FILE: &str = "raft.tmp";
const HEADER_LEN: usize = 8;

/// file-based storage implementation using std::fs
///
/// state and snapshot share one file so they are replaced together:
/// an 8-byte little-endian state length, the state, then the snapshot.
/// both are cached in memory after the file is opened.
#[derive(Debug)]
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist and loads any saved state
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let (state, snapshot) = match fs::read(dir.join(DATA_FILE)) {
            Ok(bytes) => split_file(bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => (Vec::new(), Vec::new()),
            Err(err) => return Err(err),
        };
        Ok(Self { dir, state, snapshot })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// get the path to the data file
    pub fn data_path(&self) -> PathBuf {
        self.dir.join(DATA_FILE)
    }

    /// atomic write: write to temp file, sync, then rename over the old file
    fn write_file(&self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let temp_path = self.dir.join(TEMP_FILE);
        let mut file = File::create(&temp_path)?;
        file.write_all(&(state.len() as u64).to_le_bytes())?;
        file.write_all(state)?;
        file.write_all(snapshot)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.data_path())?;
        Ok(())
    }
}

fn split_file(mut bytes: Vec<u8>) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let corrupt = || io::Error::new(io::ErrorKind::InvalidData, "truncated raft data file");
    if bytes.len() < HEADER_LEN {
        return Err(corrupt());
    }
    let mut header = [0u8; HEADER_LEN];
    header.copy_from_slice(&bytes[..HEADER_LEN]);
    let state_len = usize::try_from(u64::from_le_bytes(header)).map_err(|_| corrupt())?;
    let state_end = HEADER_LEN.checked_add(state_len).ok_or_else(corrupt)?;
    if state_end > bytes.len() {
        return Err(corrupt());
    }

    let snapshot = bytes.split_off(state_end);
    let state = bytes.split_off(HEADER_LEN);
    Ok((state, snapshot))
}

impl Storage for FileStorage {
    fn read_state(&self) -> io::Result<Vec<u8>> {
        Ok(self.state.clone())
    }

    fn save_state(&mut self, state: &[u8]) -> io::Result<()> {
        self.write_file(state, &self.snapshot)?;
        self.state = state.to_vec();
        Ok(())
    }

    fn read_snapshot(&self) -> io::Result<Vec<u8>> {
        Ok(self.snapshot.clone())
    }

    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        self.write_file(state, snapshot)?;
        self.state = state.to_vec();
        self.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn state_size(&self) -> io::Result<usize> {
        Ok(self.state.len())
    }

    fn clear(&mut self) -> io::Result<()> {
        match fs::remove_file(self.data_path()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        self.state.clear();
        self.snapshot.clear();
        Ok(())
    }
}

// -- in-memory storage implementation --

#[derive(Debug, Default, Clone)]
struct Disk {
    state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// in-memory storage for testing
///
/// clones share the same bytes, so a handle kept outside a peer acts as a
/// disk that survives the peer's crash. `deep_copy` detaches a private copy.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStorage {
    disk: Arc<Mutex<Disk>>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }

    /// a new handle to a copy of the current bytes, no longer shared with this one
    pub fn deep_copy(&self) -> Self {
        let disk = self.disk().clone();
        Self {
            disk: Arc::new(Mutex::new(disk)),
        }
    }

    fn disk(&self) -> MutexGuard<'_, Disk> {
        self.disk.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for InMemoryStorage {
    fn read_state(&self) -> io::Result<Vec<u8>> {
        Ok(self.disk().state.clone())
    }

    fn save_state(&mut self, state: &[u8]) -> io::Result<()> {
        self.disk().state = state.to_vec();
        Ok(())
    }

    fn read_snapshot(&self) -> io::Result<Vec<u8>> {
        Ok(self.disk().snapshot.clone())
    }

    fn save_state_and_snapshot(&mut self, state: &[u8], snapshot: &[u8]) -> io::Result<()> {
        let mut disk = self.disk();
        disk.state = state.to_vec();
        disk.snapshot = snapshot.to_vec();
        Ok(())
    }

    fn state_size(&self) -> io::Result<usize> {
        Ok(self.disk().state.len())
    }

    fn clear(&mut self) -> io::Result<()> {
        *self.disk() = Disk::default();
        Ok(())
    }
}
