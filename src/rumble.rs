//! Force-feedback output for evdev devices
//!
//! Rumble commands arrive on a bounded channel. For each one the active effect
//! is stopped, the effect descriptor is re-uploaded with the new magnitudes and
//! then played. Commands for one device are handled strictly one at a time.

use std::io;
use std::path::Path;

use evdev::{Device, FFEffect, FFEffectData, FFEffectKind, FFReplay, FFTrigger};
use thiserror::Error;
use tokio::sync::mpsc;

/// Replay length of the rumble effect
pub const DEFAULT_RUMBLE_LENGTH_MS: u16 = 250;

/// Kernel-assigned force-feedback effect id
pub type EffectId = u16;

/// Rumble request from the downstream consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleCommand {
    pub strong_magnitude: u16,
    pub weak_magnitude: u16,
}

/// Sender half of the rumble channel
pub type RumbleSender = mpsc::Sender<RumbleCommand>;

/// Receiver half of the rumble channel
pub type RumbleReceiver = mpsc::Receiver<RumbleCommand>;

/// Create the bounded rumble command channel
pub fn rumble_channel(capacity: usize) -> (RumbleSender, RumbleReceiver) {
    mpsc::channel(capacity.max(1))
}

/// Drop commands queued while no device could play them
pub fn discard_pending(commands: &mut RumbleReceiver) -> usize {
    let mut dropped = 0;
    while commands.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "Discarded stale rumble commands");
    }
    dropped
}

/// Rumble effect descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RumbleEffect {
    /// Uploaded effect id, `None` until the first successful upload
    pub id: Option<EffectId>,
    pub strong_magnitude: u16,
    pub weak_magnitude: u16,
    pub length_ms: u16,
}

impl RumbleEffect {
    pub fn new(length_ms: u16) -> Self {
        Self {
            id: None,
            strong_magnitude: 0xFFFF,
            weak_magnitude: 0xFFFF,
            length_ms,
        }
    }

    fn data(&self) -> FFEffectData {
        FFEffectData {
            direction: 0,
            trigger: FFTrigger {
                button: 0,
                interval: 0,
            },
            replay: FFReplay {
                length: self.length_ms,
                delay: 0,
            },
            kind: FFEffectKind::Rumble {
                strong_magnitude: self.strong_magnitude,
                weak_magnitude: self.weak_magnitude,
            },
        }
    }
}

/// Rumble error type
#[derive(Debug, Error)]
pub enum RumbleError {
    /// Uploading the effect descriptor failed
    #[error("failed to upload force-feedback effect: {0}")]
    Upload(#[source] io::Error),
    /// Writing the play event failed
    #[error("failed to play effect {id}: {source}")]
    Play { id: EffectId, source: io::Error },
}

/// Kernel force-feedback operations on one device
pub trait RumbleDevice: Send {
    /// Upload `effect`, reusing its id if it has one, and return the id
    fn upload(&mut self, effect: &RumbleEffect) -> io::Result<EffectId>;

    /// Write the play event for `id`
    fn play(&mut self, id: EffectId) -> io::Result<()>;

    /// Write the stop event for `id`
    fn stop(&mut self, id: EffectId) -> io::Result<()>;

    /// Remove the uploaded effect `id`
    fn remove(&mut self, id: EffectId) -> io::Result<()>;
}

/// Sequences rumble commands against one device
pub struct RumbleOutput {
    device: Box<dyn RumbleDevice>,
    effect: RumbleEffect,
}

impl RumbleOutput {
    pub fn new(device: Box<dyn RumbleDevice>, length_ms: u16) -> Self {
        Self {
            device,
            effect: RumbleEffect::new(length_ms),
        }
    }

    /// Currently uploaded effect id
    pub fn active(&self) -> Option<EffectId> {
        self.effect.id
    }

    pub fn effect(&self) -> &RumbleEffect {
        &self.effect
    }

    /// Stop the previous effect, upload the new magnitudes and play them
    pub fn handle(&mut self, cmd: RumbleCommand) -> Result<EffectId, RumbleError> {
        if let Some(id) = self.effect.id {
            if let Err(e) = self.device.stop(id) {
                tracing::warn!(id, error = %e, "Unable to stop the previous rumble");
            }
        }

        self.effect.strong_magnitude = cmd.strong_magnitude;
        self.effect.weak_magnitude = cmd.weak_magnitude;

        tracing::trace!(
            strong = cmd.strong_magnitude,
            weak = cmd.weak_magnitude,
            "Rumble command received"
        );

        let id = match self.device.upload(&self.effect) {
            Ok(id) => id,
            Err(e) => {
                self.effect.id = None;
                return Err(RumbleError::Upload(e));
            }
        };
        self.effect.id = Some(id);

        self.device
            .play(id)
            .map_err(|source| RumbleError::Play { id, source })?;
        Ok(id)
    }

    /// Stop and remove the active effect
    pub fn shutdown(&mut self) {
        let Some(id) = self.effect.id.take() else {
            return;
        };
        if let Err(e) = self.device.stop(id) {
            tracing::warn!(id, error = %e, "Unable to stop rumble effect");
        }
        match self.device.remove(id) {
            Ok(()) => tracing::debug!(id, "Rumble effect removed"),
            Err(e) => tracing::warn!(id, error = %e, "Error removing rumble effect"),
        }
    }

    /// Service commands until the channel closes
    pub async fn run(&mut self, commands: &mut RumbleReceiver) {
        while let Some(cmd) = commands.recv().await {
            if let Err(e) = self.handle(cmd) {
                tracing::warn!(error = %e, "Rumble command failed");
            }
        }
    }
}

/// [`RumbleDevice`] backed by a second descriptor on the evdev node
///
/// The reader keeps the first descriptor busy with blocking reads, so effects
/// are uploaded and played through an independent open of the same node.
pub struct EvdevRumble {
    device: Device,
    effect: Option<FFEffect>,
}

impl EvdevRumble {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            device: Device::open(path)?,
            effect: None,
        })
    }

    fn effect_mut(&mut self, id: EffectId) -> io::Result<&mut FFEffect> {
        match self.effect.as_mut() {
            Some(effect) if effect.id() == id => Ok(effect),
            _ => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no uploaded effect with id {id}"),
            )),
        }
    }
}

impl RumbleDevice for EvdevRumble {
    fn upload(&mut self, effect: &RumbleEffect) -> io::Result<EffectId> {
        if let (Some(id), Some(current)) = (effect.id, self.effect.as_mut()) {
            if current.id() == id {
                if let Err(e) = current.update(effect.data()) {
                    self.effect = None;
                    return Err(e);
                }
                return Ok(id);
            }
        }

        let uploaded = self.device.upload_ff_effect(effect.data())?;
        let id = uploaded.id();
        self.effect = Some(uploaded);
        Ok(id)
    }

    fn play(&mut self, id: EffectId) -> io::Result<()> {
        self.effect_mut(id)?.play(1)
    }

    fn stop(&mut self, id: EffectId) -> io::Result<()> {
        self.effect_mut(id)?.stop()
    }

    fn remove(&mut self, id: EffectId) -> io::Result<()> {
        self.effect_mut(id)?;
        // Dropping the handle issues EVIOCRMFF.
        self.effect = None;
        Ok(())
    }
}
