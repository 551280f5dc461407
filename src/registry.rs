//! Registry of device nodes currently held by a reader
//!
//! One registry is shared by every supervisor so a node opened by one device
//! class is skipped by all the others. The lock is meant to be held for a
//! single scan-and-claim pass, never across a blocking read.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use thiserror::Error;

/// Maximum number of devices held at once across all classes
pub const MAX_OPEN_DEVICES: usize = 65;

/// Registry error type
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The lock was poisoned by a panicking holder
    #[error("device registry lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Entries {
    paths: HashSet<PathBuf>,
    capacity: usize,
}

/// Shared set of claimed device paths
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(MAX_OPEN_DEVICES)
    }
}

impl DeviceRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(Entries {
                paths: HashSet::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    /// Take the registry lock for one discovery pass
    pub fn lock(&self) -> Result<RegistryGuard<'_>, RegistryError> {
        let entries = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(RegistryGuard { entries })
    }

    /// Claim `path`; false if it is already claimed or the registry is full
    pub fn try_register(&self, path: &Path) -> Result<bool, RegistryError> {
        Ok(self.lock()?.try_register(path))
    }

    /// Drop the claim on `path`
    pub fn unregister(&self, path: &Path) {
        // Releasing must work even after a panic elsewhere poisoned the lock.
        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !entries.paths.remove(path) {
            tracing::debug!(path = %path.display(), "Released path was not registered");
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lock().map(|g| g.contains(path)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The registry, locked for the duration of a discovery pass
pub struct RegistryGuard<'a> {
    entries: MutexGuard<'a, Entries>,
}

impl RegistryGuard<'_> {
    pub fn contains(&self, path: &Path) -> bool {
        self.entries.paths.contains(path)
    }

    /// Claim `path` under the already-held lock
    pub fn try_register(&mut self, path: &Path) -> bool {
        if self.entries.paths.contains(path) {
            return false;
        }
        if self.entries.paths.len() >= self.entries.capacity {
            tracing::warn!(
                path = %path.display(),
                capacity = self.entries.capacity,
                "Device registry full"
            );
            return false;
        }
        self.entries.paths.insert(path.to_path_buf())
    }

    pub fn len(&self) -> usize {
        self.entries.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.paths.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_is_rejected() {
        let registry = DeviceRegistry::default();
        let path = Path::new("/dev/input/event3");
        assert!(registry.try_register(path).unwrap());
        assert!(!registry.try_register(path).unwrap());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_unregister_allows_reclaim() {
        let registry = DeviceRegistry::default();
        let path = Path::new("/dev/hidraw0");
        assert!(registry.try_register(path).unwrap());
        registry.unregister(path);
        assert!(registry.is_empty());
        assert!(registry.try_register(path).unwrap());
    }

    #[test]
    fn test_shared_between_clones() {
        let registry = DeviceRegistry::default();
        let other = registry.clone();
        let path = Path::new("/sys/bus/iio/devices/iio:device0");
        assert!(registry.try_register(path).unwrap());
        assert!(other.contains(path));
        assert!(!other.try_register(path).unwrap());
    }

    #[test]
    fn test_capacity_limit() {
        let registry = DeviceRegistry::new(2);
        let mut guard = registry.lock().unwrap();
        assert!(guard.try_register(Path::new("/a")));
        assert!(guard.try_register(Path::new("/b")));
        assert!(!guard.try_register(Path::new("/c")));
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_default_capacity() {
        assert_eq!(MAX_OPEN_DEVICES, 65);
    }
}
