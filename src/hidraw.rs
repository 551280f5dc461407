//! Raw HID source for controllers read as fixed-size reports
//!
//! Candidates under `/sys/class/hidraw/` are matched on the `HID_ID` line of
//! their `device/uevent` file. A match is only accepted after it delivers one
//! full-size report within the probe timeout, since some controllers expose
//! several interfaces with the same ID and only one of them streams.
//!
//! When the controller switches firmware mode it drops off the bus and comes
//! back, possibly under another node. The read then fails with an errno other
//! than EAGAIN, which this source reports as [`Frame::ModeSwitch`].
//!
//! SPDX-License-Identifier: GPL-3.0

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::message::{HidrawFrame, Message, Payload, HIDRAW_FRAME_SIZE};
use crate::registry::{DeviceRegistry, RegistryGuard};
use crate::source::{is_candidate, wait_readable, DeviceClass, DeviceSource, Frame, SourceError};

/// Default hidraw sysfs class directory
pub const HIDRAW_SYSFS_DIR: &str = "/sys/class/hidraw";

/// Directory holding the hidraw device nodes
pub const DEV_DIR: &str = "/dev";

/// Lenovo Legion Go controller identities (bus:vendor:product)
pub const LEGION_GO_IDS: &[&str] = &[
    "0003:000017EF:00006182", // XInput mode
    "0003:000017EF:00006183", // DInput mode
];

/// Expected report size
pub const DATA_LENGTH: usize = HIDRAW_FRAME_SIZE;

/// Extract the `HID_ID` value from a uevent file body
pub fn parse_hid_id(uevent: &str) -> Option<&str> {
    uevent
        .lines()
        .find_map(|line| line.trim().strip_prefix("HID_ID="))
}

/// An opened hidraw node
#[derive(Debug)]
pub struct HidrawHandle {
    path: PathBuf,
    file: File,
}

impl HidrawHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Raw HID source configuration
#[derive(Debug, Clone)]
pub struct HidrawSource {
    ids: Vec<String>,
    sysfs_dir: PathBuf,
    dev_dir: PathBuf,
    frame_size: usize,
    probe_timeout: Duration,
    poll_interval: Duration,
    discovery_interval: Duration,
    reconnect_pause: Duration,
    /// Nodes that delivered a full report in the last [`DeviceSource::prepare`]
    live: Vec<PathBuf>,
}

impl Default for HidrawSource {
    fn default() -> Self {
        Self::new(LEGION_GO_IDS.iter().map(|id| id.to_string()).collect())
    }
}

impl HidrawSource {
    pub fn new(ids: Vec<String>) -> Self {
        Self {
            ids,
            sysfs_dir: PathBuf::from(HIDRAW_SYSFS_DIR),
            dev_dir: PathBuf::from(DEV_DIR),
            frame_size: DATA_LENGTH,
            probe_timeout: Duration::from_secs(1),
            poll_interval: Duration::from_millis(20),
            discovery_interval: Duration::from_secs(5),
            reconnect_pause: Duration::from_secs(3),
            live: Vec::new(),
        }
    }

    pub fn with_dirs(mut self, sysfs_dir: impl Into<PathBuf>, dev_dir: impl Into<PathBuf>) -> Self {
        self.sysfs_dir = sysfs_dir.into();
        self.dev_dir = dev_dir.into();
        self
    }

    /// Report size, capped at [`HIDRAW_FRAME_SIZE`]
    pub fn with_frame_size(mut self, size: usize) -> Self {
        self.frame_size = size.clamp(1, HIDRAW_FRAME_SIZE);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_discovery_interval(mut self, interval: Duration) -> Self {
        self.discovery_interval = interval;
        self
    }

    pub fn with_reconnect_pause(mut self, pause: Duration) -> Self {
        self.reconnect_pause = pause;
        self
    }

    /// Whether the sysfs entry at `sysfs_entry` carries an allowed HID_ID
    pub fn check_device_match(&self, sysfs_entry: &Path) -> bool {
        let uevent = match fs::read_to_string(sysfs_entry.join("device/uevent")) {
            Ok(uevent) => uevent,
            Err(e) => {
                tracing::debug!(path = %sysfs_entry.display(), error = %e, "Cannot read uevent");
                return false;
            }
        };
        match parse_hid_id(&uevent) {
            Some(id) => self.ids.iter().any(|allowed| allowed.eq_ignore_ascii_case(id)),
            None => false,
        }
    }

    /// Check that `dev_path` delivers one full report within the probe timeout
    pub fn test_device_data_length(&self, dev_path: &Path) -> bool {
        let mut file = match open_nonblocking(dev_path) {
            Ok(file) => file,
            Err(e) => {
                tracing::debug!(path = %dev_path.display(), error = %e, "Cannot open hidraw node");
                return false;
            }
        };

        match wait_readable(&file, self.probe_timeout) {
            Ok(true) => {}
            Ok(false) => return false,
            Err(e) => {
                tracing::debug!(path = %dev_path.display(), error = %e, "poll failed");
                return false;
            }
        }

        let mut buf = [0u8; HIDRAW_FRAME_SIZE];
        matches!(file.read(&mut buf[..self.frame_size]), Ok(n) if n == self.frame_size)
    }

    /// Device nodes whose sysfs entry carries an allowed HID_ID
    pub fn find_matching(&self) -> Vec<PathBuf> {
        let entries = match fs::read_dir(&self.sysfs_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.sysfs_dir.display(), error = %e, "Cannot scan hidraw class");
                return Vec::new();
            }
        };

        entries
            .flatten()
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| is_candidate(name) && self.check_device_match(&entry.path()))
            })
            .map(|entry| self.dev_dir.join(entry.file_name()))
            .collect()
    }

    /// List hidraw nodes with their HID_ID
    pub fn list_devices(&self) -> Vec<(PathBuf, String)> {
        let Ok(entries) = fs::read_dir(&self.sysfs_dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let uevent = fs::read_to_string(entry.path().join("device/uevent")).ok()?;
                let id = parse_hid_id(&uevent)?.to_string();
                Some((self.dev_dir.join(entry.file_name()), id))
            })
            .collect()
    }
}

fn open_nonblocking(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

impl DeviceSource for HidrawSource {
    type Handle = HidrawHandle;

    fn class(&self) -> DeviceClass {
        DeviceClass::Hidraw
    }

    fn payload(&self) -> Payload {
        Payload::Hidraw(HidrawFrame::default())
    }

    fn prepare(&mut self, registry: &DeviceRegistry) {
        let mut live = Vec::new();
        for dev_path in self.find_matching() {
            if registry.contains(&dev_path) {
                continue;
            }
            tracing::info!(path = %dev_path.display(), "Matching hidraw device found");

            if self.test_device_data_length(&dev_path) {
                live.push(dev_path);
            } else {
                tracing::info!(
                    path = %dev_path.display(),
                    expected = self.frame_size,
                    "Device has no full report available"
                );
            }
        }
        self.live = live;
    }

    fn discover(&mut self, claimed: &RegistryGuard<'_>) -> Option<HidrawHandle> {
        for dev_path in std::mem::take(&mut self.live) {
            // Another class may have claimed it since `prepare`.
            if claimed.contains(&dev_path) {
                continue;
            }
            match open_nonblocking(&dev_path) {
                Ok(file) => {
                    tracing::info!(path = %dev_path.display(), "Opened hidraw device");
                    return Some(HidrawHandle { path: dev_path, file });
                }
                Err(e) => {
                    tracing::warn!(path = %dev_path.display(), error = %e, "Failed to open device");
                }
            }
        }
        None
    }

    fn path<'a>(&self, handle: &'a HidrawHandle) -> &'a Path {
        &handle.path
    }

    fn read_frame(&mut self, handle: &mut HidrawHandle, message: &mut Message) -> Result<Frame, SourceError> {
        let frame = message.hidraw_mut();
        match handle.file.read(&mut frame.data[..self.frame_size]) {
            Ok(0) => Ok(Frame::Pending),
            Ok(n) => {
                frame.len = n;
                Ok(Frame::Ready)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {
                Ok(Frame::Pending)
            }
            Err(e) => {
                tracing::warn!(path = %handle.path.display(), error = %e, "Lost hidraw device, mode switch");
                Ok(Frame::ModeSwitch)
            }
        }
    }

    fn release(&mut self, handle: HidrawHandle) {
        tracing::info!(path = %handle.path.display(), "Closing hidraw device");
    }

    fn pacing(&self) -> Option<Duration> {
        Some(self.poll_interval)
    }

    fn discovery_interval(&self) -> Option<Duration> {
        Some(self.discovery_interval)
    }

    fn reconnect_pause(&self) -> Duration {
        self.reconnect_pause
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    use nix::sys::stat::Mode;
    use nix::unistd::mkfifo;

    use crate::supervisor::acquire;

    const UEVENT_XINPUT: &str = "DRIVER=hid-generic\nHID_ID=0003:000017EF:00006182\nHID_NAME=Legion Controller\n";
    const UEVENT_MOUSE: &str = "DRIVER=hid-generic\nHID_ID=0003:0000046D:0000C548\n";

    struct FakeTree {
        _root: tempfile::TempDir,
        sysfs: PathBuf,
        dev: PathBuf,
    }

    impl FakeTree {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let sysfs = root.path().join("sys");
            let dev = root.path().join("dev");
            fs::create_dir_all(&sysfs).unwrap();
            fs::create_dir_all(&dev).unwrap();
            Self { _root: root, sysfs, dev }
        }

        fn add(&self, node: &str, uevent: &str, data_len: usize) {
            let device = self.sysfs.join(node).join("device");
            fs::create_dir_all(&device).unwrap();
            fs::write(device.join("uevent"), uevent).unwrap();
            fs::write(self.dev.join(node), vec![0xA5u8; data_len]).unwrap();
        }

        /// A node that opens fine but never has data
        fn add_silent(&self, node: &str, uevent: &str) {
            let device = self.sysfs.join(node).join("device");
            fs::create_dir_all(&device).unwrap();
            fs::write(device.join("uevent"), uevent).unwrap();
            mkfifo(&self.dev.join(node), Mode::S_IRWXU).unwrap();
        }

        fn source(&self) -> HidrawSource {
            HidrawSource::default()
                .with_dirs(&self.sysfs, &self.dev)
                .with_probe_timeout(Duration::from_millis(50))
        }
    }

    fn discover(source: &mut HidrawSource, registry: &DeviceRegistry) -> Option<HidrawHandle> {
        source.prepare(registry);
        source.discover(&registry.lock().unwrap())
    }

    #[test]
    fn test_parse_hid_id() {
        assert_eq!(parse_hid_id(UEVENT_XINPUT), Some("0003:000017EF:00006182"));
        assert_eq!(parse_hid_id("DRIVER=usbhid\n"), None);
    }

    #[test]
    fn test_identity_match_is_case_insensitive() {
        let tree = FakeTree::new();
        tree.add("hidraw0", &UEVENT_XINPUT.to_lowercase().replace("hid_id", "HID_ID"), 64);
        assert!(tree.source().check_device_match(&tree.sysfs.join("hidraw0")));
    }

    #[test]
    fn test_discover_requires_full_report() {
        let tree = FakeTree::new();
        tree.add("hidraw0", UEVENT_MOUSE, 64);
        tree.add("hidraw1", UEVENT_XINPUT, 10);
        tree.add("hidraw2", UEVENT_XINPUT, 64);

        let registry = DeviceRegistry::default();
        let mut source = tree.source();
        let handle = discover(&mut source, &registry).unwrap();
        assert_eq!(handle.path(), tree.dev.join("hidraw2"));
    }

    #[test]
    fn test_discover_skips_claimed_node() {
        let tree = FakeTree::new();
        tree.add("hidraw3", UEVENT_XINPUT, 64);

        let registry = DeviceRegistry::default();
        assert!(registry.try_register(&tree.dev.join("hidraw3")).unwrap());
        assert!(discover(&mut tree.source(), &registry).is_none());
    }

    #[test]
    fn test_node_claimed_after_prepare_is_skipped() {
        let tree = FakeTree::new();
        tree.add("hidraw0", UEVENT_XINPUT, 64);

        let registry = DeviceRegistry::default();
        let mut source = tree.source();
        source.prepare(&registry);
        assert!(registry.try_register(&tree.dev.join("hidraw0")).unwrap());
        assert!(source.discover(&registry.lock().unwrap()).is_none());
    }

    #[test]
    fn test_registry_usable_while_waiting_for_report() {
        let tree = FakeTree::new();
        tree.add_silent("hidraw0", UEVENT_XINPUT);

        let registry = DeviceRegistry::default();
        let mut source = tree.source().with_probe_timeout(Duration::from_millis(600));
        let worker = {
            let registry = registry.clone();
            std::thread::spawn(move || acquire(&mut source, &registry))
        };

        std::thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        assert!(registry.try_register(Path::new("/dev/input/event3")).unwrap());
        assert!(started.elapsed() < Duration::from_millis(100));

        assert!(worker.join().unwrap().unwrap().is_none());
        assert!(!registry.contains(&tree.dev.join("hidraw0")));
    }

    #[test]
    fn test_read_frame_then_pending() {
        let tree = FakeTree::new();
        tree.add("hidraw0", UEVENT_XINPUT, 64);

        let registry = DeviceRegistry::default();
        let mut source = tree.source();
        let mut handle = discover(&mut source, &registry).unwrap();
        let mut message = Message::new(source.payload());

        assert_eq!(source.read_frame(&mut handle, &mut message).unwrap(), Frame::Ready);
        let frame = message.hidraw().unwrap();
        assert_eq!(frame.len, 64);
        assert!(frame.bytes().iter().all(|&b| b == 0xA5));

        assert_eq!(source.read_frame(&mut handle, &mut message).unwrap(), Frame::Pending);
    }

    #[test]
    fn test_list_devices() {
        let tree = FakeTree::new();
        tree.add("hidraw0", UEVENT_MOUSE, 0);
        let devices = tree.source().list_devices();
        assert_eq!(devices, vec![(tree.dev.join("hidraw0"), "0003:0000046D:0000C548".to_string())]);
    }

    #[test]
    fn test_frame_size_is_capped() {
        let source = HidrawSource::default().with_frame_size(4096);
        assert_eq!(source.frame_size, HIDRAW_FRAME_SIZE);
    }
}
