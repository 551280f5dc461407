//! Industrial-I/O motion sensor source
//!
//! IIO devices are sampled on demand through their sysfs channel files under
//! `/sys/bus/iio/devices/iio:deviceN`. One read of all axis channels makes one
//! [`MotionSample`].

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::{Message, MotionSample, Payload};
use crate::registry::RegistryGuard;
use crate::source::{scan_namespace, DeviceClass, DeviceSource, Frame, SourceError};

/// Default IIO namespace
pub const IIO_DIR: &str = "/sys/bus/iio/devices";

/// Default delay between two samples (about 66 Hz)
pub const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 15;

const ACCEL_CHANNELS: [&str; 3] = ["in_accel_x_raw", "in_accel_y_raw", "in_accel_z_raw"];
const GYRO_CHANNELS: [&str; 3] = ["in_anglvel_x_raw", "in_anglvel_y_raw", "in_anglvel_z_raw"];

/// An opened IIO device
#[derive(Debug, Clone)]
pub struct IioDevice {
    path: PathBuf,
    name: String,
    accel_scale: f64,
    gyro_scale: f64,
}

impl IioDevice {
    /// Read the identity and scales of the device at `path`
    pub fn open(path: &Path) -> io::Result<Self> {
        let name = fs::read_to_string(path.join("name"))?.trim().to_string();
        Ok(Self {
            path: path.to_path_buf(),
            name,
            accel_scale: read_scale(path, "in_accel_scale"),
            gyro_scale: read_scale(path, "in_anglvel_scale"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every axis channel into `sample`
    ///
    /// Missing axis channels read as zero. A channel that exists but cannot be
    /// read or parsed fails the whole sample.
    pub fn read_imu(&self, sample: &mut MotionSample) -> io::Result<()> {
        // Unplugged sensors take their whole directory with them.
        fs::metadata(&self.path)?;

        for (axis, channel) in ACCEL_CHANNELS.iter().enumerate() {
            sample.accel[axis] = self.read_channel(channel)?.unwrap_or(0);
        }
        for (axis, channel) in GYRO_CHANNELS.iter().enumerate() {
            sample.gyro[axis] = self.read_channel(channel)?.unwrap_or(0);
        }
        sample.accel_scale = self.accel_scale;
        sample.gyro_scale = self.gyro_scale;
        sample.temperature = self.read_channel("in_temp_raw")?;
        Ok(())
    }

    fn read_channel(&self, channel: &str) -> io::Result<Option<i32>> {
        let contents = match fs::read_to_string(self.path.join(channel)) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{channel}: {e}")))
    }
}

fn read_scale(path: &Path, file: &str) -> f64 {
    fs::read_to_string(path.join(file))
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(1.0)
}

/// IIO source configuration
#[derive(Debug, Clone)]
pub struct IioSource {
    /// Exact sensor name to match
    name: String,
    iio_dir: PathBuf,
    sample_interval: Duration,
}

impl IioSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            iio_dir: PathBuf::from(IIO_DIR),
            sample_interval: Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS),
        }
    }

    pub fn with_iio_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.iio_dir = dir.into();
        self
    }

    pub fn with_sample_interval(mut self, interval: Duration) -> Self {
        self.sample_interval = interval;
        self
    }
}

impl DeviceSource for IioSource {
    type Handle = IioDevice;

    fn class(&self) -> DeviceClass {
        DeviceClass::Iio
    }

    fn payload(&self) -> Payload {
        Payload::Motion(MotionSample::default())
    }

    fn discover(&mut self, claimed: &RegistryGuard<'_>) -> Option<IioDevice> {
        let candidates = match scan_namespace(&self.iio_dir) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!(dir = %self.iio_dir.display(), error = %e, "Cannot scan iio directory");
                return None;
            }
        };

        for path in candidates {
            if claimed.contains(&path) {
                tracing::debug!(path = %path.display(), "Already opened iio device, skipped");
                continue;
            }

            let device = match IioDevice::open(&path) {
                Ok(device) => device,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Could not create iio device");
                    continue;
                }
            };

            if device.name() != self.name {
                tracing::debug!(
                    path = %path.display(),
                    name = %device.name(),
                    expected = %self.name,
                    "iio device name does not match"
                );
                continue;
            }

            tracing::info!(path = %path.display(), name = %device.name(), "Opened iio device");
            return Some(device);
        }
        None
    }

    fn path<'a>(&self, handle: &'a IioDevice) -> &'a Path {
        handle.path()
    }

    fn read_frame(&mut self, handle: &mut IioDevice, message: &mut Message) -> Result<Frame, SourceError> {
        match handle.read_imu(message.motion_mut()) {
            Ok(()) => Ok(Frame::Ready),
            Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                tracing::warn!("Out of memory reading {}, skipping the current frame", handle.name());
                Ok(Frame::Skipped)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Frame::Pending),
            Err(e) if e.kind() == io::ErrorKind::NotFound || e.raw_os_error() == Some(libc::ENODEV) => {
                Err(SourceError::DeviceGone)
            }
            Err(e) => {
                tracing::error!(name = %handle.name(), error = %e, "Error reading iio device");
                Err(e.into())
            }
        }
    }

    fn release(&mut self, handle: IioDevice) {
        tracing::info!(path = %handle.path().display(), name = %handle.name(), "Closing iio device");
    }

    fn pacing(&self) -> Option<Duration> {
        Some(self.sample_interval)
    }
}
