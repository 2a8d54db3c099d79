//! File-backed key/value persistence.
//!
//! Every key maps to one JSON file in the data directory. A missing file reads
//! as the default value of the requested type. Writes go to a temporary file
//! first and are then renamed over the target, so a crash never leaves a
//! half-written document behind.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Serialize, de::DeserializeOwned};
use std::{
    fs::{self, OpenOptions},
    io::{BufReader, BufWriter, ErrorKind, Write},
    path::PathBuf,
    sync::Mutex,
};

pub const PENDING_OPERATIONS_KEY: &str = "pending_operations";
pub const SAVED_NETWORKS_KEY: &str = "saved_networks";
pub const SESSION_KEY: &str = "session";

#[derive(Clone, Debug)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).context(format!("failed to create store directory: {dir:?}"))?;
        Ok(Self { dir })
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Read the value stored under `key`, or the default if nothing was stored yet
    pub fn load<T>(&self, key: &str) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let path = self.path(key);

        let file = match OpenOptions::new().read(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no stored value for {key}, using default");
                return Ok(T::default());
            }
            Err(e) => return Err(e).context(format!("failed to open store file: {path:?}")),
        };

        serde_json::from_reader(BufReader::new(file))
            .context(format!("failed to deserialize store file: {path:?}"))
    }

    /// Replace the value stored under `key`
    pub fn save<T>(&self, key: &str, value: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let path = self.path(key);
        let tmp_path = self.dir.join(format!(".{key}.json.tmp"));

        {
            let file = fs::File::create(&tmp_path)
                .context(format!("failed to create temporary store file: {tmp_path:?}"))?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, value)
                .context(format!("failed to serialize value for {key}"))?;
            writer
                .flush()
                .context(format!("failed to flush temporary store file: {tmp_path:?}"))?;
        }

        fs::rename(&tmp_path, &path)
            .context(format!("failed to replace store file: {path:?}"))
    }

    /// Remove the value stored under `key`. A missing value is not an error.
    pub fn remove(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("removed stored value for {key}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("failed to remove store file: {path:?}")),
        }
    }
}

/// Wi-Fi network names entered during earlier pairing attempts, for autocomplete
pub struct SavedNetworks {
    store: JsonStore,
    lock: Mutex<()>,
}

impl SavedNetworks {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn list(&self) -> Result<Vec<String>> {
        self.store.load(SAVED_NETWORKS_KEY)
    }

    /// Remember `ssid`. Returns false if it was already known.
    pub fn add(&self, ssid: &str) -> Result<bool> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("failed to lock saved networks"))?;

        let mut networks: Vec<String> = self.store.load(SAVED_NETWORKS_KEY)?;
        if networks.iter().any(|known| known == ssid) {
            return Ok(false);
        }

        networks.push(ssid.to_string());
        self.store.save(SAVED_NETWORKS_KEY, &networks)?;
        Ok(true)
    }
}
