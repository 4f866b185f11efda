//! `ConfigStore` implementations.
//!
//! `MemoryStore` backs tests and the simulator. `JsonFileStore` keeps the same
//! map in a JSON file and rewrites it on every mutation, which is enough for
//! settings and a 100-entry alert history.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::capabilities::ConfigStore;
use crate::error::{SentinelError, SentinelResult};

/// One stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoreValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    StringList(Vec<String>),
}

type StoreMap = HashMap<String, StoreValue>;

fn lock(map: &Mutex<StoreMap>) -> MutexGuard<'_, StoreMap> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read_bool(map: &StoreMap, key: &str) -> Option<bool> {
    match map.get(key)? {
        StoreValue::Bool(v) => Some(*v),
        _ => None,
    }
}

fn read_int(map: &StoreMap, key: &str) -> Option<i64> {
    match map.get(key)? {
        StoreValue::Int(v) => Some(*v),
        _ => None,
    }
}

fn read_float(map: &StoreMap, key: &str) -> Option<f64> {
    match map.get(key)? {
        StoreValue::Float(v) => Some(*v),
        StoreValue::Int(v) => Some(*v as f64),
        _ => None,
    }
}

fn read_string(map: &StoreMap, key: &str) -> Option<String> {
    match map.get(key)? {
        StoreValue::String(v) => Some(v.clone()),
        _ => None,
    }
}

fn read_string_list(map: &StoreMap, key: &str) -> Option<Vec<String>> {
    match map.get(key)? {
        StoreValue::StringList(v) => Some(v.clone()),
        _ => None,
    }
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: Mutex<StoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys stored.
    pub fn len(&self) -> usize {
        lock(&self.map).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn put(&self, key: &str, value: StoreValue) -> SentinelResult<()> {
        lock(&self.map).insert(key.to_string(), value);
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        read_bool(&lock(&self.map), key)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        read_int(&lock(&self.map), key)
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        read_float(&lock(&self.map), key)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        read_string(&lock(&self.map), key)
    }

    fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        read_string_list(&lock(&self.map), key)
    }

    fn set_bool(&self, key: &str, value: bool) -> SentinelResult<()> {
        self.put(key, StoreValue::Bool(value))
    }

    fn set_int(&self, key: &str, value: i64) -> SentinelResult<()> {
        self.put(key, StoreValue::Int(value))
    }

    fn set_float(&self, key: &str, value: f64) -> SentinelResult<()> {
        self.put(key, StoreValue::Float(value))
    }

    fn set_string(&self, key: &str, value: &str) -> SentinelResult<()> {
        self.put(key, StoreValue::String(value.to_string()))
    }

    fn set_string_list(&self, key: &str, value: &[String]) -> SentinelResult<()> {
        self.put(key, StoreValue::StringList(value.to_vec()))
    }

    fn remove(&self, key: &str) -> SentinelResult<()> {
        lock(&self.map).remove(key);
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    map: Mutex<StoreMap>,
}

impl JsonFileStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> SentinelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let map = if path.exists() {
            let content = fs::read_to_string(&path)
                .map_err(|e| SentinelError::Store(format!("read {}: {e}", path.display())))?;
            if content.trim().is_empty() {
                StoreMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            StoreMap::new()
        };
        Ok(Self {
            path,
            map: Mutex::new(map),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, apply: impl FnOnce(&mut StoreMap)) -> SentinelResult<()> {
        let mut map = lock(&self.map);
        apply(&mut map);
        let data = serde_json::to_string_pretty(&*map)?;
        fs::write(&self.path, data)
            .map_err(|e| SentinelError::Store(format!("write {}: {e}", self.path.display())))
    }

    fn put(&self, key: &str, value: StoreValue) -> SentinelResult<()> {
        self.mutate(|map| {
            map.insert(key.to_string(), value);
        })
    }
}

impl ConfigStore for JsonFileStore {
    fn get_bool(&self, key: &str) -> Option<bool> {
        read_bool(&lock(&self.map), key)
    }

    fn get_int(&self, key: &str) -> Option<i64> {
        read_int(&lock(&self.map), key)
    }

    fn get_float(&self, key: &str) -> Option<f64> {
        read_float(&lock(&self.map), key)
    }

    fn get_string(&self, key: &str) -> Option<String> {
        read_string(&lock(&self.map), key)
    }

    fn get_string_list(&self, key: &str) -> Option<Vec<String>> {
        read_string_list(&lock(&self.map), key)
    }

    fn set_bool(&self, key: &str, value: bool) -> SentinelResult<()> {
        self.put(key, StoreValue::Bool(value))
    }

    fn set_int(&self, key: &str, value: i64) -> SentinelResult<()> {
        self.put(key, StoreValue::Int(value))
    }

    fn set_float(&self, key: &str, value: f64) -> SentinelResult<()> {
        self.put(key, StoreValue::Float(value))
    }

    fn set_string(&self, key: &str, value: &str) -> SentinelResult<()> {
        self.put(key, StoreValue::String(value.to_string()))
    }

    fn set_string_list(&self, key: &str, value: &[String]) -> SentinelResult<()> {
        self.put(key, StoreValue::StringList(value.to_vec()))
    }

    fn remove(&self, key: &str) -> SentinelResult<()> {
        self.mutate(|map| {
            map.remove(key);
        })
    }
}
