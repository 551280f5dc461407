//! Capability interface shared by every device class
//!
//! A [`DeviceSource`] knows how to find a device in its namespace, read one
//! frame from it into a pooled message, and close it again. The
//! [`Supervisor`](crate::supervisor::Supervisor) drives any source through the
//! same discover / read / release cycle.

use std::fmt;
use std::fs;
use std::io;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use thiserror::Error;

use crate::message::{Message, Payload};
use crate::registry::{DeviceRegistry, RegistryGuard};
use crate::rumble::RumbleDevice;

/// Device class served by a source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Evdev,
    Iio,
    Hidraw,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceClass::Evdev => write!(f, "evdev"),
            DeviceClass::Iio => write!(f, "iio"),
            DeviceClass::Hidraw => write!(f, "hidraw"),
        }
    }
}

/// Result of one [`DeviceSource::read_frame`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frame {
    /// The message is complete; push it
    Ready,
    /// The frame was filtered out; release the message
    Suppressed,
    /// Nothing complete yet; keep the message and call again
    Pending,
    /// Transient failure; keep the message and retry without pacing
    Skipped,
    /// The device switched mode or vanished and has to be rediscovered
    ModeSwitch,
}

/// Reader-fatal source error
#[derive(Debug, Error)]
pub enum SourceError {
    /// The device node disappeared
    #[error("device removed")]
    DeviceGone,
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A device class the supervisor can drive
pub trait DeviceSource: Send + 'static {
    /// An opened and matched device
    type Handle: Send + 'static;

    fn class(&self) -> DeviceClass;

    /// Fresh payload for the message pool
    fn payload(&self) -> Payload;

    /// Slow candidate checks, run before the registry lock is taken
    ///
    /// `registry` may be consulted for a snapshot of claimed paths, which
    /// [`discover`](Self::discover) must re-check under the lock.
    fn prepare(&mut self, _registry: &DeviceRegistry) {}

    /// Scan the namespace for a device that is not yet claimed
    ///
    /// Runs with the registry locked and must not block on device reads.
    /// The caller registers the returned handle's path.
    fn discover(&mut self, claimed: &RegistryGuard<'_>) -> Option<Self::Handle>;

    /// Registry key of an opened device
    fn path<'a>(&self, handle: &'a Self::Handle) -> &'a Path;

    /// Read one frame into `message`
    fn read_frame(&mut self, handle: &mut Self::Handle, message: &mut Message) -> Result<Frame, SourceError>;

    /// Close the device
    fn release(&mut self, handle: Self::Handle);

    /// Delay between reads
    fn pacing(&self) -> Option<Duration> {
        None
    }

    /// Interval between discovery scans while nothing matches
    fn discovery_interval(&self) -> Option<Duration> {
        None
    }

    /// Pause between closing a device after a mode switch and rediscovering it
    fn reconnect_pause(&self) -> Duration {
        Duration::from_secs(3)
    }

    /// Force-feedback writer for the device, if it has one
    fn rumble(&mut self, _handle: &Self::Handle) -> Option<Box<dyn RumbleDevice>> {
        None
    }
}

/// Whether a directory entry is a device candidate
///
/// Skips hidden entries and the `by-id`, `by-path` and `js*` aliases.
pub fn is_candidate(name: &str) -> bool {
    !(name.starts_with('.') || name.starts_with("by-") || name.starts_with("js"))
}

/// List candidate entries of a device namespace, in directory order
pub fn scan_namespace(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)?.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_candidate(name) {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

/// Wait until `fd` is readable, up to `timeout`
///
/// Returns false on timeout. A hangup or error condition counts as readable
/// so the following read reports it.
pub fn wait_readable(fd: &impl AsFd, timeout: Duration) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd.as_fd(), PollFlags::POLLIN)];
    let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;

    match poll(&mut fds, PollTimeout::from(timeout_ms)) {
        Ok(0) => Ok(false),
        Ok(_) => Ok(true),
        Err(Errno::EINTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_candidate_filter() {
        assert!(is_candidate("event3"));
        assert!(is_candidate("iio:device0"));
        assert!(is_candidate("hidraw2"));
        assert!(!is_candidate(".hidden"));
        assert!(!is_candidate("by-id"));
        assert!(!is_candidate("by-path"));
        assert!(!is_candidate("js0"));
    }

    #[test]
    fn test_scan_namespace_skips_aliases() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["event0", "event1", "by-id", "js0", ".lock"] {
            fs::write(dir.path().join(name), b"").unwrap();
        }
        let mut names: Vec<String> = scan_namespace(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["event0", "event1"]);
    }

    #[test]
    fn test_scan_missing_namespace() {
        assert!(scan_namespace(Path::new("/nonexistent/inputd/ns")).is_err());
    }

    #[test]
    fn test_wait_readable_regular_file() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(b"data").unwrap();
        assert!(wait_readable(&file, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_wait_readable_times_out_without_data() {
        let (idle, _peer) = std::os::unix::net::UnixStream::pair().unwrap();
        assert!(!wait_readable(&idle, Duration::from_millis(10)).unwrap());
    }

    #[test]
    fn test_class_display() {
        assert_eq!(DeviceClass::Evdev.to_string(), "evdev");
        assert_eq!(DeviceClass::Iio.to_string(), "iio");
        assert_eq!(DeviceClass::Hidraw.to_string(), "hidraw");
    }
}
