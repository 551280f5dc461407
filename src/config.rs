//! Configuration management for inputd
//!
//! Handles loading and validation of the JSON configuration file.
//! Configuration is stored at `~/.config/inputd/config.json`.
//!
//! Every device class section is optional; a class without a section has no
//! supervisor.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::evdev::{EvdevSource, INPUT_DIR};
use crate::filter::FilterKind;
use crate::hidraw::{HidrawSource, DEV_DIR, HIDRAW_SYSFS_DIR, LEGION_GO_IDS};
use crate::iio::{IioSource, DEFAULT_SAMPLE_INTERVAL_MS, IIO_DIR};
use crate::message::{DEFAULT_EVENTS_IN_REPORT, HIDRAW_FRAME_SIZE};
use crate::pool::MAX_MESSAGES_IN_FLIGHT;
use crate::registry::MAX_OPEN_DEVICES;
use crate::rumble::DEFAULT_RUMBLE_LENGTH_MS;
use crate::supervisor::Timing;

// ============================================================================
// Constants
// ============================================================================

/// Default config directory name
const CONFIG_DIR: &str = "inputd";

/// Default config file name
const CONFIG_FILE: &str = "config.json";

// ============================================================================
// evdev
// ============================================================================

/// Input event device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvdevConfig {
    /// Kernel-reported device name to match exactly
    pub name: String,

    /// Filter applied to every complete report
    #[serde(default)]
    pub filter: FilterKind,

    /// Take exclusive access to the device
    #[serde(default = "default_true")]
    pub grab: bool,

    /// Drop MSC_SCAN events before framing
    #[serde(default = "default_true")]
    pub ignore_scan_codes: bool,

    #[serde(default = "default_input_dir")]
    pub input_dir: PathBuf,

    /// Replay length of the rumble effect in milliseconds
    #[serde(default = "default_rumble_length")]
    pub rumble_length_ms: u16,

    /// Capacity of the rumble command channel
    #[serde(default = "default_rumble_queue")]
    pub rumble_queue: usize,
}

fn default_true() -> bool { true }
fn default_input_dir() -> PathBuf { PathBuf::from(INPUT_DIR) }
fn default_rumble_length() -> u16 { DEFAULT_RUMBLE_LENGTH_MS }
fn default_rumble_queue() -> usize { 16 }

impl EvdevConfig {
    pub fn validate(&mut self) {
        self.rumble_queue = self.rumble_queue.max(1);
    }

    /// Build the source described by this section
    pub fn source(&self, batch_capacity: usize, read_timeout: Duration) -> EvdevSource {
        EvdevSource::new(self.name.clone(), self.filter.build())
            .with_input_dir(&self.input_dir)
            .with_grab(self.grab)
            .with_ignore_scan(self.ignore_scan_codes)
            .with_read_timeout(read_timeout)
            .with_batch_capacity(batch_capacity)
    }
}

// ============================================================================
// IIO
// ============================================================================

/// Industrial-I/O motion sensor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IioConfig {
    /// Sensor name as found in the device's `name` file
    pub name: String,

    #[serde(default = "default_iio_dir")]
    pub iio_dir: PathBuf,

    /// Delay between two samples in milliseconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,
}

fn default_iio_dir() -> PathBuf { PathBuf::from(IIO_DIR) }
fn default_sample_interval() -> u64 { DEFAULT_SAMPLE_INTERVAL_MS }

impl IioConfig {
    pub fn validate(&mut self) {
        self.sample_interval_ms = self.sample_interval_ms.max(1);
    }

    pub fn source(&self) -> IioSource {
        IioSource::new(self.name.clone())
            .with_iio_dir(&self.iio_dir)
            .with_sample_interval(Duration::from_millis(self.sample_interval_ms))
    }
}

// ============================================================================
// hidraw
// ============================================================================

/// Raw HID settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HidrawConfig {
    /// Allowed `HID_ID` values (bus:vendor:product)
    #[serde(default = "default_hid_ids")]
    pub ids: Vec<String>,

    #[serde(default = "default_sysfs_dir")]
    pub sysfs_dir: PathBuf,

    #[serde(default = "default_dev_dir")]
    pub dev_dir: PathBuf,

    /// Report size in bytes (at most 64)
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,

    /// How long a candidate gets to deliver its first report
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Delay between two reads
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Pause between losing the device on a mode switch and looking for it again
    #[serde(default = "default_reconnect_pause")]
    pub reconnect_pause_ms: u64,
}

fn default_hid_ids() -> Vec<String> { LEGION_GO_IDS.iter().map(|id| id.to_string()).collect() }
fn default_sysfs_dir() -> PathBuf { PathBuf::from(HIDRAW_SYSFS_DIR) }
fn default_dev_dir() -> PathBuf { PathBuf::from(DEV_DIR) }
fn default_frame_size() -> usize { HIDRAW_FRAME_SIZE }
fn default_probe_timeout() -> u64 { 1000 }
fn default_poll_interval() -> u64 { 20 }
fn default_reconnect_pause() -> u64 { 3000 }

impl Default for HidrawConfig {
    fn default() -> Self {
        Self {
            ids: default_hid_ids(),
            sysfs_dir: default_sysfs_dir(),
            dev_dir: default_dev_dir(),
            frame_size: HIDRAW_FRAME_SIZE,
            probe_timeout_ms: 1000,
            poll_interval_ms: 20,
            reconnect_pause_ms: 3000,
        }
    }
}

impl HidrawConfig {
    pub fn validate(&mut self) {
        self.frame_size = self.frame_size.clamp(1, HIDRAW_FRAME_SIZE);
        self.probe_timeout_ms = self.probe_timeout_ms.max(1);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
    }

    pub fn source(&self, discovery_interval: Duration) -> HidrawSource {
        HidrawSource::new(self.ids.clone())
            .with_dirs(&self.sysfs_dir, &self.dev_dir)
            .with_frame_size(self.frame_size)
            .with_probe_timeout(Duration::from_millis(self.probe_timeout_ms))
            .with_poll_interval(Duration::from_millis(self.poll_interval_ms))
            .with_reconnect_pause(Duration::from_millis(self.reconnect_pause_ms))
            .with_discovery_interval(discovery_interval)
    }
}

// ============================================================================
// Timing
// ============================================================================

/// Retry and wait intervals shared by all supervisors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    #[serde(default = "default_discovery_backoff")]
    pub discovery_backoff_ms: u64,

    #[serde(default = "default_lock_backoff")]
    pub lock_backoff_ms: u64,

    /// Rescan interval for hidraw while no controller matches
    #[serde(default = "default_hidraw_discovery_interval")]
    pub hidraw_discovery_interval_ms: u64,

    /// Retry delay while every message slot is in flight
    #[serde(default = "default_stall_delay")]
    pub stall_delay_ms: u64,

    /// Longest blocking wait on an evdev node
    #[serde(default = "default_read_timeout")]
    pub read_timeout_ms: u64,

    /// Capacity of the downstream message queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_discovery_backoff() -> u64 { 250 }
fn default_lock_backoff() -> u64 { 250 }
fn default_hidraw_discovery_interval() -> u64 { 5000 }
fn default_stall_delay() -> u64 { 30 }
fn default_read_timeout() -> u64 { 250 }
fn default_queue_capacity() -> usize { 64 }

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_backoff_ms: 250,
            lock_backoff_ms: 250,
            hidraw_discovery_interval_ms: 5000,
            stall_delay_ms: 30,
            read_timeout_ms: 250,
            queue_capacity: 64,
        }
    }
}

impl TimingConfig {
    /// Clamp every interval to at least one millisecond
    pub fn validate(&mut self) {
        self.discovery_backoff_ms = self.discovery_backoff_ms.max(1);
        self.lock_backoff_ms = self.lock_backoff_ms.max(1);
        self.hidraw_discovery_interval_ms = self.hidraw_discovery_interval_ms.max(1);
        self.stall_delay_ms = self.stall_delay_ms.max(1);
        self.read_timeout_ms = self.read_timeout_ms.max(1);
        self.queue_capacity = self.queue_capacity.max(1);
    }

    pub fn supervisor(&self) -> Timing {
        Timing {
            discovery_backoff: Duration::from_millis(self.discovery_backoff_ms),
            lock_backoff: Duration::from_millis(self.lock_backoff_ms),
            stall_delay: Duration::from_millis(self.stall_delay_ms),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn hidraw_discovery_interval(&self) -> Duration {
        Duration::from_millis(self.hidraw_discovery_interval_ms)
    }
}

// ============================================================================
// Main Configuration
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Message slots per device class
    #[serde(default = "default_pool_capacity")]
    pub pool_capacity: usize,

    /// Devices held at once across all classes
    #[serde(default = "default_registry_capacity")]
    pub registry_capacity: usize,

    /// Events a fresh batch can hold before it grows
    #[serde(default = "default_batch_capacity")]
    pub initial_batch_capacity: usize,

    #[serde(default)]
    pub evdev: Option<EvdevConfig>,

    #[serde(default)]
    pub iio: Option<IioConfig>,

    #[serde(default)]
    pub hidraw: Option<HidrawConfig>,

    #[serde(default)]
    pub timing: TimingConfig,

    /// Configuration file path (not serialized)
    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

fn default_pool_capacity() -> usize { MAX_MESSAGES_IN_FLIGHT }
fn default_registry_capacity() -> usize { MAX_OPEN_DEVICES }
fn default_batch_capacity() -> usize { DEFAULT_EVENTS_IN_REPORT }

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_capacity: MAX_MESSAGES_IN_FLIGHT,
            registry_capacity: MAX_OPEN_DEVICES,
            initial_batch_capacity: DEFAULT_EVENTS_IN_REPORT,
            evdev: None,
            iio: None,
            hidraw: Some(HidrawConfig::default()),
            timing: TimingConfig::default(),
            config_path: None,
        }
    }
}

impl Config {
    /// Get the default config directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join(CONFIG_DIR))
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load configuration from the default location
    ///
    /// Returns default config if file doesn't exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_config_path() {
            Some(path) => Self::load(&path),
            None => {
                tracing::warn!("Could not determine config directory, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from file path
    ///
    /// Returns default config if file doesn't exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            let mut config = Self::default();
            config.config_path = Some(path.to_path_buf());
            return Ok(config);
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        config.config_path = Some(path.to_path_buf());

        tracing::info!(
            path = %path.display(),
            evdev = config.evdev.is_some(),
            iio = config.iio.is_some(),
            hidraw = config.hidraw.is_some(),
            pool_capacity = config.pool_capacity,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Clamp values into range and reject unusable sections
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        self.pool_capacity = self.pool_capacity.max(1);
        self.registry_capacity = self.registry_capacity.max(1);
        self.initial_batch_capacity = self.initial_batch_capacity.max(1);
        self.timing.validate();

        if let Some(evdev) = self.evdev.as_mut() {
            if evdev.name.is_empty() {
                return Err(ConfigError::Validation("evdev.name must not be empty".to_string()));
            }
            evdev.validate();
        }
        if let Some(iio) = self.iio.as_mut() {
            if iio.name.is_empty() {
                return Err(ConfigError::Validation("iio.name must not be empty".to_string()));
            }
            iio.validate();
        }
        if let Some(hidraw) = self.hidraw.as_mut() {
            if hidraw.ids.is_empty() {
                return Err(ConfigError::Validation("hidraw.ids must not be empty".to_string()));
            }
            hidraw.validate();
        }
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading the file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Tests
// ============================================================================
