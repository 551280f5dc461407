//! inputd Library
//!
//! Device-input acquisition for handheld gaming hardware: evdev, IIO and
//! hidraw sources feeding pooled messages into one downstream queue.

pub mod config;
pub mod evdev;
pub mod filter;
pub mod hidraw;
pub mod iio;
pub mod message;
pub mod pool;
pub mod registry;
pub mod rumble;
pub mod source;
pub mod supervisor;

/// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use evdev::{DeviceInfo, EvdevSource};
pub use filter::{FilterFlags, FilterKind, InputFilter};
pub use hidraw::HidrawSource;
pub use iio::IioSource;
pub use message::{BatchFlags, EventBatch, HidrawFrame, Message, MessageKind, MotionSample, Payload, RawEvent};
pub use pool::{MessagePool, PooledMessage};
pub use registry::{DeviceRegistry, RegistryError};
pub use rumble::{rumble_channel, RumbleCommand, RumbleError, RumbleSender};
pub use source::{DeviceClass, DeviceSource, Frame, SourceError};
pub use supervisor::{MessageReceiver, MessageSender, Supervisor, SupervisorState, Timing};
