//! evdev input source
//!
//! Scans `/dev/input` for an event device whose kernel-reported name matches
//! the configured one, grabs it, and turns its event stream into batches.
//!
//! ## Framing
//! Devices that declare EV_SYN accumulate events until SYN_REPORT and emit the
//! whole report as one batch. Devices without EV_SYN emit every event on its
//! own. MSC_SCAN can be dropped before framing; MSC_TIMESTAMP is kept for the
//! consumer.

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use evdev::{Device, EventType, FFEffectCode, MiscCode, SynchronizationCode};

use crate::filter::{self, InputFilter};
use crate::message::{EventBatch, Message, Payload, RawEvent, DEFAULT_EVENTS_IN_REPORT};
use crate::registry::RegistryGuard;
use crate::rumble::{EvdevRumble, RumbleDevice};
use crate::source::{scan_namespace, wait_readable, DeviceClass, DeviceSource, Frame, SourceError};

/// Default input namespace
pub const INPUT_DIR: &str = "/dev/input";

/// Information about a detected input device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the event device (e.g., /dev/input/event5)
    pub path: PathBuf,
    /// Device name as reported by the kernel
    pub name: String,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Whether the device declares EV_FF
    pub has_ff: bool,
}

/// What the framer decided after taking one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Keep accumulating
    Continue,
    /// The batch is a complete report
    Flush,
}

/// Splits an event stream into reports
#[derive(Debug, Clone, Copy)]
pub struct Framer {
    has_syn: bool,
    ignore_scan: bool,
}

impl Framer {
    pub fn new(has_syn: bool, ignore_scan: bool) -> Self {
        Self { has_syn, ignore_scan }
    }

    pub fn has_syn(&self) -> bool {
        self.has_syn
    }

    /// Take one event into `batch`
    pub fn feed(&self, event: RawEvent, batch: &mut EventBatch) -> Feed {
        if self.ignore_scan && event.kind == EventType::MISC.0 && event.code == MiscCode::MSC_SCAN.0 {
            return Feed::Continue;
        }

        let is_report = event.kind == EventType::SYNCHRONIZATION.0
            && event.code == SynchronizationCode::SYN_REPORT.0;

        if !self.has_syn {
            batch.push(event);
            return Feed::Flush;
        }
        if is_report {
            return Feed::Flush;
        }
        batch.push(event);
        Feed::Continue
    }
}

/// An opened, matched evdev device
pub struct EvdevHandle {
    path: PathBuf,
    name: String,
    device: Device,
    framer: Framer,
    has_ff: bool,
    /// Events read from the kernel but not framed yet
    backlog: VecDeque<RawEvent>,
}

impl EvdevHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has_ff(&self) -> bool {
        self.has_ff
    }
}

/// evdev source configuration
pub struct EvdevSource {
    /// Exact device name to match
    name: String,
    input_dir: PathBuf,
    filter: Box<dyn InputFilter>,
    grab: bool,
    ignore_scan: bool,
    read_timeout: Duration,
    batch_capacity: usize,
}

impl EvdevSource {
    pub fn new(name: impl Into<String>, filter: Box<dyn InputFilter>) -> Self {
        Self {
            name: name.into(),
            input_dir: PathBuf::from(INPUT_DIR),
            filter,
            grab: true,
            ignore_scan: true,
            read_timeout: Duration::from_millis(250),
            batch_capacity: DEFAULT_EVENTS_IN_REPORT,
        }
    }

    pub fn with_input_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.input_dir = dir.into();
        self
    }

    pub fn with_grab(mut self, grab: bool) -> Self {
        self.grab = grab;
        self
    }

    pub fn with_ignore_scan(mut self, ignore: bool) -> Self {
        self.ignore_scan = ignore;
        self
    }

    /// Upper bound on one blocking wait before the reader checks for shutdown
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Initial event capacity of every pooled batch
    pub fn with_batch_capacity(mut self, capacity: usize) -> Self {
        self.batch_capacity = capacity.max(1);
        self
    }

    /// Open `path` and check it against the configured name
    fn try_open(&self, path: &Path) -> io::Result<Option<EvdevHandle>> {
        let mut device = Device::open(path)?;

        let name = device.name().unwrap_or("").to_string();
        if name != self.name {
            tracing::debug!(
                path = %path.display(),
                name = %name,
                expected = %self.name,
                "Device name does not match"
            );
            return Ok(None);
        }

        if self.grab {
            if let Err(e) = device.grab() {
                tracing::warn!(path = %path.display(), error = %e, "Unable to grab the device");
            }
        }

        let has_syn = device.supported_events().contains(EventType::SYNCHRONIZATION);
        let has_ff = device.supported_events().contains(EventType::FORCEFEEDBACK);
        let has_rumble = device
            .supported_ff()
            .map(|ff| ff.contains(FFEffectCode::FF_RUMBLE))
            .unwrap_or(false);

        tracing::info!(
            path = %path.display(),
            name = %name,
            ff = has_ff,
            rumble = has_rumble,
            syn = has_syn,
            "Opened input device"
        );

        Ok(Some(EvdevHandle {
            path: path.to_path_buf(),
            name,
            device,
            framer: Framer::new(has_syn, self.ignore_scan),
            has_ff,
            backlog: VecDeque::new(),
        }))
    }

    /// Run the filter on a complete batch and decide its fate
    pub fn flush(&self, batch: &mut EventBatch) -> Frame {
        if filter::apply(self.filter.as_ref(), batch) {
            Frame::Ready
        } else {
            Frame::Suppressed
        }
    }

    /// Describe every event device in the namespace
    pub fn list_devices(dir: &Path) -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        let Ok(candidates) = scan_namespace(dir) else {
            return devices;
        };

        for path in candidates {
            match Device::open(&path) {
                Ok(device) => {
                    let input_id = device.input_id();
                    devices.push(DeviceInfo {
                        name: device.name().unwrap_or("Unknown").to_string(),
                        vendor_id: input_id.vendor(),
                        product_id: input_id.product(),
                        has_ff: device.supported_events().contains(EventType::FORCEFEEDBACK),
                        path,
                    });
                }
                Err(e) => tracing::debug!("Could not check device {:?}: {:?}", path, e),
            }
        }

        devices
    }
}

impl DeviceSource for EvdevSource {
    type Handle = EvdevHandle;

    fn class(&self) -> DeviceClass {
        DeviceClass::Evdev
    }

    fn payload(&self) -> Payload {
        Payload::Events(EventBatch::with_capacity(self.batch_capacity))
    }

    fn discover(&mut self, claimed: &RegistryGuard<'_>) -> Option<EvdevHandle> {
        let candidates = match scan_namespace(&self.input_dir) {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::debug!(dir = %self.input_dir.display(), error = %e, "Cannot scan input directory");
                return None;
            }
        };

        for path in candidates {
            if claimed.contains(&path) {
                continue;
            }
            match self.try_open(&path) {
                Ok(Some(handle)) => return Some(handle),
                Ok(None) => continue,
                Err(e) => {
                    tracing::debug!(path = %path.display(), error = %e, "Cannot open device, skipped");
                }
            }
        }
        None
    }

    fn path<'a>(&self, handle: &'a EvdevHandle) -> &'a Path {
        &handle.path
    }

    fn read_frame(&mut self, handle: &mut EvdevHandle, message: &mut Message) -> Result<Frame, SourceError> {
        let batch = message.events_mut();

        loop {
            while let Some(event) = handle.backlog.pop_front() {
                if handle.framer.feed(event, batch) == Feed::Flush {
                    return Ok(self.flush(batch));
                }
            }

            if !wait_readable(&handle.device, self.read_timeout)? {
                return Ok(Frame::Pending);
            }

            match handle.device.fetch_events() {
                Ok(events) => handle.backlog.extend(events.map(RawEvent::from)),
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
                Err(e) if e.raw_os_error() == Some(libc::ENODEV) => return Err(SourceError::DeviceGone),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn release(&mut self, handle: EvdevHandle) {
        tracing::info!(path = %handle.path.display(), name = %handle.name, "Closing input device");
        // Closing the descriptor drops the grab.
        drop(handle);
    }

    fn rumble(&mut self, handle: &EvdevHandle) -> Option<Box<dyn RumbleDevice>> {
        if !handle.has_ff {
            return None;
        }
        match EvdevRumble::open(&handle.path) {
            Ok(rumble) => Some(Box::new(rumble)),
            Err(e) => {
                tracing::warn!(path = %handle.path.display(), error = %e, "Cannot open force-feedback descriptor");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterFlags, Identity, Suppress};
    use crate::message::BatchFlags;
    use evdev::AbsoluteAxisCode;

    fn abs(code: AbsoluteAxisCode, value: i32) -> RawEvent {
        RawEvent::new(EventType::ABSOLUTE.0, code.0, value)
    }

    fn syn() -> RawEvent {
        RawEvent::new(EventType::SYNCHRONIZATION.0, SynchronizationCode::SYN_REPORT.0, 0)
    }

    fn frame_all(framer: Framer, input: &[RawEvent]) -> Vec<Vec<i32>> {
        let mut batches = Vec::new();
        let mut batch = EventBatch::new();
        for &ev in input {
            if framer.feed(ev, &mut batch) == Feed::Flush {
                batches.push(batch.events().iter().map(|e| e.value).collect());
                batch.clear();
            }
        }
        batches
    }

    #[test]
    fn test_syn_device_batches_report() {
        let input = [abs(AbsoluteAxisCode::ABS_X, 10), abs(AbsoluteAxisCode::ABS_Y, 20), syn()];
        let batches = frame_all(Framer::new(true, true), &input);
        assert_eq!(batches, vec![vec![10, 20]]);
    }

    #[test]
    fn test_non_syn_device_flushes_each_event() {
        let input = [abs(AbsoluteAxisCode::ABS_X, 10), abs(AbsoluteAxisCode::ABS_Y, 20)];
        let batches = frame_all(Framer::new(false, true), &input);
        assert_eq!(batches, vec![vec![10], vec![20]]);
    }

    #[test]
    fn test_scan_codes_dropped_timestamps_kept() {
        let scan = RawEvent::new(EventType::MISC.0, MiscCode::MSC_SCAN.0, 0x90001);
        let stamp = RawEvent::new(EventType::MISC.0, MiscCode::MSC_TIMESTAMP.0, 1234);
        let key = RawEvent::new(EventType::KEY.0, 304, 1);

        let batches = frame_all(Framer::new(true, true), &[scan, key, stamp, syn()]);
        assert_eq!(batches, vec![vec![1, 1234]]);

        let batches = frame_all(Framer::new(true, false), &[scan, key, syn()]);
        assert_eq!(batches, vec![vec![0x90001, 1]]);
    }

    #[test]
    fn test_long_report_grows_batch() {
        let framer = Framer::new(true, true);
        let mut batch = EventBatch::new();
        for i in 0..20 {
            assert_eq!(framer.feed(abs(AbsoluteAxisCode::ABS_X, i), &mut batch), Feed::Continue);
        }
        assert_eq!(framer.feed(syn(), &mut batch), Feed::Flush);
        assert_eq!(batch.len(), 20);
        assert_eq!(batch.capacity(), 32);
    }

    #[test]
    fn test_flush_with_suppressing_filter() {
        let source = EvdevSource::new("pad", Box::new(Suppress));
        let mut batch = EventBatch::new();
        for i in 0..3 {
            batch.push(abs(AbsoluteAxisCode::ABS_X, i));
        }
        assert_eq!(source.flush(&mut batch), Frame::Suppressed);

        let source = EvdevSource::new("pad", Box::new(Identity));
        assert_eq!(source.flush(&mut batch), Frame::Ready);
    }

    #[test]
    fn test_flush_sets_filter_flags() {
        let mark = |_: &mut [RawEvent], _: &mut usize, flags: &mut BatchFlags| {
            *flags |= BatchFlags::PRESERVE_TIME;
            FilterFlags::empty()
        };
        let source = EvdevSource::new("pad", Box::new(mark));
        let mut batch = EventBatch::new();
        batch.push(abs(AbsoluteAxisCode::ABS_X, 1));
        assert_eq!(source.flush(&mut batch), Frame::Ready);
        assert_eq!(batch.flags, BatchFlags::PRESERVE_TIME);
    }

    #[test]
    fn test_discover_skips_unopenable_nodes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("event0"), b"not a device").unwrap();

        let registry = crate::registry::DeviceRegistry::default();
        let guard = registry.lock().unwrap();
        let mut source = EvdevSource::new("pad", Box::new(Identity)).with_input_dir(dir.path());
        assert!(source.discover(&guard).is_none());
    }

    #[test]
    fn test_list_devices_missing_dir() {
        assert!(EvdevSource::list_devices(Path::new("/nonexistent/input")).is_empty());
    }
}
