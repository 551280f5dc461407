//! Pluggable filter applied to every flushed evdev batch
//!
//! A filter sees the events of one report and may rewrite them in place,
//! shrink the count, set [`BatchFlags`] on the batch, or ask for the batch to
//! be dropped with [`FilterFlags::DO_NOT_EMIT`].

use bitflags::bitflags;
use evdev::{AbsoluteAxisCode, EventType, RelativeAxisCode};
use serde::{Deserialize, Serialize};

use crate::message::{BatchFlags, EventBatch, RawEvent};

bitflags! {
    /// Result flags returned by an input filter
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FilterFlags: u32 {
        /// Release the slot instead of queuing the batch
        const DO_NOT_EMIT = 0x0000_0001;
    }
}

/// Filter invoked on each flushed batch
///
/// `events` is the full written range of the buffer; the filter may only
/// lower `count`. Writes are bounded by the slice length.
pub trait InputFilter: Send + Sync {
    fn filter(&self, events: &mut [RawEvent], count: &mut usize, flags: &mut BatchFlags) -> FilterFlags;
}

impl<F> InputFilter for F
where
    F: Fn(&mut [RawEvent], &mut usize, &mut BatchFlags) -> FilterFlags + Send + Sync,
{
    fn filter(&self, events: &mut [RawEvent], count: &mut usize, flags: &mut BatchFlags) -> FilterFlags {
        self(events, count, flags)
    }
}

/// Run `filter` over `batch` and report whether the batch should be emitted
///
/// Resets the batch flags first. A count raised by the filter is ignored.
pub fn apply(filter: &dyn InputFilter, batch: &mut EventBatch) -> bool {
    let original = batch.len();
    let mut count = original;
    let mut flags = BatchFlags::empty();

    let result = filter.filter(batch.events_mut(), &mut count, &mut flags);

    if count > original {
        tracing::warn!(original, count, "Input filter tried to grow a batch, ignoring");
        count = original;
    }
    batch.truncate(count);
    batch.flags = flags;

    !result.contains(FilterFlags::DO_NOT_EMIT) && count > 0
}

/// Pass every event through unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl InputFilter for Identity {
    fn filter(&self, _events: &mut [RawEvent], _count: &mut usize, _flags: &mut BatchFlags) -> FilterFlags {
        FilterFlags::empty()
    }
}

/// Drop every batch
///
/// Used for IMU evdev nodes whose data is already taken from IIO.
#[derive(Debug, Clone, Copy, Default)]
pub struct Suppress;

impl InputFilter for Suppress {
    fn filter(&self, _events: &mut [RawEvent], _count: &mut usize, _flags: &mut BatchFlags) -> FilterFlags {
        FilterFlags::DO_NOT_EMIT
    }
}

/// Turn gyroscope axes into relative pointer motion
///
/// ABS_RX becomes REL_Y (inverted) and ABS_RY becomes REL_X. All other events
/// are discarded. The batch is marked as mouse motion with kernel timestamps.
#[derive(Debug, Clone, Copy, Default)]
pub struct GyroMouse;

impl InputFilter for GyroMouse {
    fn filter(&self, events: &mut [RawEvent], count: &mut usize, flags: &mut BatchFlags) -> FilterFlags {
        let abs = EventType::ABSOLUTE.0;
        let mut gyro_x = 0;
        let mut gyro_y = 0;
        let mut time = None;

        for ev in events.iter().take(*count).filter(|ev| ev.kind == abs) {
            if ev.code == AbsoluteAxisCode::ABS_RX.0 {
                gyro_x = ev.value;
            } else if ev.code == AbsoluteAxisCode::ABS_RY.0 {
                gyro_y = ev.value;
            } else {
                continue;
            }
            time = Some(ev.time);
        }

        let Some(time) = time else {
            return FilterFlags::DO_NOT_EMIT;
        };

        let rel = EventType::RELATIVE.0;
        let mut written = 0;
        if gyro_x != 0 {
            events[written] = RawEvent {
                kind: rel,
                code: RelativeAxisCode::REL_Y.0,
                value: -gyro_x,
                time,
            };
            written += 1;
        }
        if gyro_y != 0 {
            events[written] = RawEvent {
                kind: rel,
                code: RelativeAxisCode::REL_X.0,
                value: gyro_y,
                time,
            };
            written += 1;
        }

        *count = written;
        *flags |= BatchFlags::PRESERVE_TIME | BatchFlags::MOUSE;
        FilterFlags::empty()
    }
}

/// Built-in filter selectable from the configuration file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    #[default]
    Identity,
    Suppress,
    GyroMouse,
}

impl FilterKind {
    pub fn build(self) -> Box<dyn InputFilter> {
        match self {
            FilterKind::Identity => Box::new(Identity),
            FilterKind::Suppress => Box::new(Suppress),
            FilterKind::GyroMouse => Box::new(GyroMouse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(events: &[(u16, u16, i32)]) -> EventBatch {
        let mut batch = EventBatch::new();
        for &(kind, code, value) in events {
            batch.push(RawEvent::new(kind, code, value));
        }
        batch
    }

    #[test]
    fn test_identity_emits() {
        let mut batch = batch_of(&[(3, 0, 10), (3, 1, 20)]);
        assert!(apply(&Identity, &mut batch));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_suppress_regardless_of_count() {
        let mut batch = batch_of(&[(1, 30, 1), (1, 31, 1), (1, 32, 0)]);
        assert!(!apply(&Suppress, &mut batch));
    }

    #[test]
    fn test_empty_result_not_emitted() {
        let drop_all = |_: &mut [RawEvent], count: &mut usize, _: &mut BatchFlags| {
            *count = 0;
            FilterFlags::empty()
        };
        let mut batch = batch_of(&[(1, 30, 1)]);
        assert!(!apply(&drop_all, &mut batch));
        assert!(batch.is_empty());
    }

    #[test]
    fn test_filter_cannot_grow_count() {
        let grow = |_: &mut [RawEvent], count: &mut usize, _: &mut BatchFlags| {
            *count += 5;
            FilterFlags::empty()
        };
        let mut batch = batch_of(&[(1, 30, 1), (1, 31, 1)]);
        assert!(apply(&grow, &mut batch));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_gyro_mouse_translation() {
        let abs = EventType::ABSOLUTE.0;
        let mut batch = batch_of(&[
            (abs, AbsoluteAxisCode::ABS_X.0, 500),
            (abs, AbsoluteAxisCode::ABS_RX.0, 7),
            (abs, AbsoluteAxisCode::ABS_RY.0, -3),
        ]);
        assert!(apply(&GyroMouse, &mut batch));
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.flags, BatchFlags::PRESERVE_TIME | BatchFlags::MOUSE);

        let rel = EventType::RELATIVE.0;
        let ev = batch.events();
        assert_eq!((ev[0].kind, ev[0].code, ev[0].value), (rel, RelativeAxisCode::REL_Y.0, -7));
        assert_eq!((ev[1].kind, ev[1].code, ev[1].value), (rel, RelativeAxisCode::REL_X.0, -3));
    }

    #[test]
    fn test_gyro_mouse_without_gyro_is_dropped() {
        let mut batch = batch_of(&[(EventType::KEY.0, 304, 1)]);
        assert!(!apply(&GyroMouse, &mut batch));
    }

    #[test]
    fn test_filter_kind_from_json() {
        let kind: FilterKind = serde_json::from_str(r#""gyro_mouse""#).unwrap();
        assert_eq!(kind, FilterKind::GyroMouse);
        assert_eq!(FilterKind::default(), FilterKind::Identity);
    }
}
