//! Message payloads carried from the readers to the downstream consumer
//!
//! Every message lives in a [`MessagePool`](crate::pool::MessagePool) slot and
//! keeps its allocations between uses, so an [`EventBatch`] that grew once
//! stays grown for the lifetime of the pool.

use std::time::SystemTime;

use bitflags::bitflags;

/// Default number of events a fresh batch can hold
pub const DEFAULT_EVENTS_IN_REPORT: usize = 8;

/// Size of a raw HID frame buffer
pub const HIDRAW_FRAME_SIZE: usize = 64;

/// A single input event as read from an evdev node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawEvent {
    /// Event type (EV_KEY, EV_ABS, ...)
    pub kind: u16,
    /// Event code within the type
    pub code: u16,
    /// Event value
    pub value: i32,
    /// Kernel timestamp of the event
    pub time: SystemTime,
}

impl RawEvent {
    /// Create an event stamped with the current time
    pub fn new(kind: u16, code: u16, value: i32) -> Self {
        Self {
            kind,
            code,
            value,
            time: SystemTime::now(),
        }
    }
}

impl From<evdev::InputEvent> for RawEvent {
    fn from(ev: evdev::InputEvent) -> Self {
        Self {
            kind: ev.event_type().0,
            code: ev.code(),
            value: ev.value(),
            time: ev.timestamp(),
        }
    }
}

bitflags! {
    /// Provenance flags set by the input filter on a flushed batch
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BatchFlags: u32 {
        /// Keep the kernel timestamps instead of re-stamping on output
        const PRESERVE_TIME = 0x0000_0001;
        /// The batch carries relative pointer motion
        const MOUSE         = 0x0000_0002;
    }
}

/// Outcome of pushing one event into a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Stored in the existing buffer
    Stored,
    /// Buffer was doubled, then stored
    Grown,
    /// Growth failed; the event was dropped and the buffer left intact
    Dropped,
}

/// Growable buffer of events belonging to one report
///
/// Capacity starts at [`DEFAULT_EVENTS_IN_REPORT`] and doubles whenever the
/// next write would fill the buffer. Previously written events are never lost.
#[derive(Debug, Clone)]
pub struct EventBatch {
    events: Vec<RawEvent>,
    capacity: usize,
    /// Flags set by the filter stage
    pub flags: BatchFlags,
}

impl Default for EventBatch {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_EVENTS_IN_REPORT)
    }
}

impl EventBatch {
    /// Create an empty batch with the default capacity
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty batch able to hold `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
            flags: BatchFlags::empty(),
        }
    }

    /// Append an event, doubling the buffer first if it would become full
    pub fn push(&mut self, event: RawEvent) -> Append {
        if self.events.len() + 1 < self.capacity {
            self.events.push(event);
            return Append::Stored;
        }

        let new_capacity = self.capacity * 2;
        let mut grown = Vec::new();
        if let Err(e) = grown.try_reserve_exact(new_capacity) {
            tracing::warn!(
                capacity = self.capacity,
                error = %e,
                "Unable to enlarge event buffer, dropping event"
            );
            return Append::Dropped;
        }

        grown.extend_from_slice(&self.events);
        grown.push(event);
        self.events = grown;
        self.capacity = new_capacity;

        tracing::debug!(capacity = new_capacity, "Event buffer enlarged");
        Append::Grown
    }

    /// Number of events currently stored
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Current buffer size in events
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn events(&self) -> &[RawEvent] {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut [RawEvent] {
        &mut self.events
    }

    /// Shrink the stored count; never grows it
    pub fn truncate(&mut self, count: usize) {
        self.events.truncate(count);
    }

    /// Forget all events and flags, keeping the allocation
    pub fn clear(&mut self) {
        self.events.clear();
        self.flags = BatchFlags::empty();
    }
}

/// One IMU reading taken from an IIO device
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MotionSample {
    /// Raw accelerometer axes (x, y, z)
    pub accel: [i32; 3],
    /// Raw gyroscope axes (x, y, z)
    pub gyro: [i32; 3],
    /// Multiplier converting raw accelerometer values to m/s^2
    pub accel_scale: f64,
    /// Multiplier converting raw gyroscope values to rad/s
    pub gyro_scale: f64,
    /// Raw temperature, when the sensor exposes it
    pub temperature: Option<i32>,
}

/// Bytes of one hidraw read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidrawFrame {
    pub data: [u8; HIDRAW_FRAME_SIZE],
    /// Number of valid bytes in `data`
    pub len: usize,
}

impl Default for HidrawFrame {
    fn default() -> Self {
        Self {
            data: [0; HIDRAW_FRAME_SIZE],
            len: 0,
        }
    }
}

impl HidrawFrame {
    /// The valid part of the frame
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len]
    }
}

/// Type tag of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Events,
    Motion,
    Hidraw,
}

/// Message payload, one variant per device class
#[derive(Debug, Clone)]
pub enum Payload {
    Events(EventBatch),
    Motion(MotionSample),
    Hidraw(HidrawFrame),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Events(_) => MessageKind::Events,
            Payload::Motion(_) => MessageKind::Motion,
            Payload::Hidraw(_) => MessageKind::Hidraw,
        }
    }
}

/// A message as handed to the downstream consumer
#[derive(Debug, Clone)]
pub struct Message {
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self { payload }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Empty the payload for a new fill cycle, keeping allocations
    pub fn reset(&mut self) {
        match &mut self.payload {
            Payload::Events(batch) => batch.clear(),
            Payload::Motion(sample) => *sample = MotionSample::default(),
            Payload::Hidraw(frame) => frame.len = 0,
        }
    }

    /// Event batch payload, switching the slot to that variant if needed
    pub fn events_mut(&mut self) -> &mut EventBatch {
        if !matches!(self.payload, Payload::Events(_)) {
            self.payload = Payload::Events(EventBatch::new());
        }
        match &mut self.payload {
            Payload::Events(batch) => batch,
            _ => unreachable!("payload was just set to Events"),
        }
    }

    pub fn motion_mut(&mut self) -> &mut MotionSample {
        if !matches!(self.payload, Payload::Motion(_)) {
            self.payload = Payload::Motion(MotionSample::default());
        }
        match &mut self.payload {
            Payload::Motion(sample) => sample,
            _ => unreachable!("payload was just set to Motion"),
        }
    }

    pub fn hidraw_mut(&mut self) -> &mut HidrawFrame {
        if !matches!(self.payload, Payload::Hidraw(_)) {
            self.payload = Payload::Hidraw(HidrawFrame::default());
        }
        match &mut self.payload {
            Payload::Hidraw(frame) => frame,
            _ => unreachable!("payload was just set to Hidraw"),
        }
    }

    pub fn events(&self) -> Option<&EventBatch> {
        match &self.payload {
            Payload::Events(batch) => Some(batch),
            _ => None,
        }
    }

    pub fn motion(&self) -> Option<&MotionSample> {
        match &self.payload {
            Payload::Motion(sample) => Some(sample),
            _ => None,
        }
    }

    pub fn hidraw(&self) -> Option<&HidrawFrame> {
        match &self.payload {
            Payload::Hidraw(frame) => Some(frame),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(value: i32) -> RawEvent {
        RawEvent::new(3, 0, value)
    }

    #[test]
    fn test_batch_default_capacity() {
        let batch = EventBatch::new();
        assert_eq!(batch.capacity(), DEFAULT_EVENTS_IN_REPORT);
        assert!(batch.is_empty());
    }

    #[test]
    fn test_batch_grows_when_one_below_capacity() {
        let mut batch = EventBatch::new();
        for i in 0..(DEFAULT_EVENTS_IN_REPORT as i32 - 1) {
            assert_eq!(batch.push(ev(i)), Append::Stored);
        }
        assert_eq!(batch.capacity(), DEFAULT_EVENTS_IN_REPORT);

        assert_eq!(batch.push(ev(100)), Append::Grown);
        assert_eq!(batch.capacity(), DEFAULT_EVENTS_IN_REPORT * 2);
        assert_eq!(batch.len(), DEFAULT_EVENTS_IN_REPORT);

        let values: Vec<i32> = batch.events().iter().map(|e| e.value).collect();
        assert_eq!(values, vec![0, 1, 2, 3, 4, 5, 6, 100]);
    }

    #[test]
    fn test_batch_keeps_growing() {
        let mut batch = EventBatch::with_capacity(2);
        for i in 0..40 {
            assert_ne!(batch.push(ev(i)), Append::Dropped);
        }
        assert_eq!(batch.len(), 40);
        assert_eq!(batch.capacity(), 64);
        assert!(batch.events().iter().enumerate().all(|(i, e)| e.value == i as i32));
    }

    #[test]
    fn test_batch_clear_keeps_capacity() {
        let mut batch = EventBatch::with_capacity(2);
        batch.push(ev(1));
        batch.push(ev(2));
        batch.flags = BatchFlags::MOUSE;
        batch.clear();
        assert!(batch.is_empty());
        assert_eq!(batch.capacity(), 4);
        assert_eq!(batch.flags, BatchFlags::empty());
    }

    #[test]
    fn test_message_variant_switch() {
        let mut msg = Message::new(Payload::Motion(MotionSample::default()));
        assert_eq!(msg.kind(), MessageKind::Motion);
        msg.hidraw_mut().len = 3;
        assert_eq!(msg.kind(), MessageKind::Hidraw);
        assert_eq!(msg.hidraw().map(|f| f.bytes().len()), Some(3));
        assert!(msg.events().is_none());
    }
}
