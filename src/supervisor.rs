//! Per-device-class discovery and reader supervision
//!
//! A [`Supervisor`] owns one [`DeviceSource`] and cycles it through
//!
//! ```text
//! Discovering -> Acquired -> Reading -> Discovering | Terminated
//! ```
//!
//! Discovery runs its slow checks unlocked, then holds the shared registry
//! lock for one scan-and-claim pass. The reader runs on a blocking thread and
//! hands filled messages to the downstream queue. A reader that panics has its
//! device released and discovery starts over. For devices with force feedback
//! the supervisor services rumble commands on the async side while the reader
//! is running; commands queued while no such device was open are dropped.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::pool::{MessagePool, PooledMessage};
use crate::registry::{DeviceRegistry, RegistryError};
use crate::rumble::{discard_pending, RumbleOutput, RumbleReceiver, DEFAULT_RUMBLE_LENGTH_MS};
use crate::source::{DeviceClass, DeviceSource, Frame, SourceError};

/// Longest uninterrupted sleep on a reader thread
const NAP_SLICE: Duration = Duration::from_millis(50);

/// Downstream queue sender
pub type MessageSender = mpsc::Sender<PooledMessage>;

/// Downstream queue receiver
pub type MessageReceiver = mpsc::Receiver<PooledMessage>;

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Discovering,
    Acquired,
    Reading,
    Terminated,
}

/// Why a reader stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderExit {
    /// The device went away
    DeviceGone,
    /// Unrecoverable read error
    Fatal,
    /// Shutdown was requested
    Cancelled,
    /// The read loop panicked
    Panicked,
}

/// Delays used by the supervisor and its reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    /// Wait after a discovery pass that found nothing
    pub discovery_backoff: Duration,
    /// Wait after failing to take the registry lock
    pub lock_backoff: Duration,
    /// Wait between pool checkouts while every slot is in flight
    pub stall_delay: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            discovery_backoff: Duration::from_millis(250),
            lock_backoff: Duration::from_millis(250),
            stall_delay: Duration::from_millis(30),
        }
    }
}

/// Scan for a device and claim it in the registry
///
/// Slow candidate checks run first without the lock. The registry lock is
/// then held for the rest of the pass so two classes can never claim the same
/// node. A handle whose path cannot be registered is released.
pub fn acquire<S: DeviceSource>(
    source: &mut S,
    registry: &DeviceRegistry,
) -> Result<Option<S::Handle>, RegistryError> {
    source.prepare(registry);

    let mut claimed = registry.lock()?;
    let Some(handle) = source.discover(&claimed) else {
        return Ok(None);
    };

    if claimed.try_register(source.path(&handle)) {
        return Ok(Some(handle));
    }
    drop(claimed);

    tracing::warn!(
        class = %source.class(),
        path = %source.path(&handle).display(),
        "Could not register device, releasing"
    );
    source.release(handle);
    Ok(None)
}

/// Sleep for `duration` unless cancelled first; true if cancelled
fn nap(cancel: &CancellationToken, duration: Duration) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(NAP_SLICE));
    }
}

/// What the reader thread hands back to its supervisor
struct ReaderOutcome<S: DeviceSource> {
    source: S,
    handle: Option<S::Handle>,
    exit: ReaderExit,
}

struct ReaderContext {
    class: DeviceClass,
    registry: DeviceRegistry,
    pool: MessagePool,
    queue: MessageSender,
    cancel: CancellationToken,
    timing: Timing,
}

impl ReaderContext {
    /// Rediscover after a mode switch, blocking until found or cancelled
    fn reacquire<S: DeviceSource>(&self, source: &mut S) -> Option<S::Handle> {
        let interval = source.discovery_interval().unwrap_or(self.timing.discovery_backoff);
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            let wait = match acquire(source, &self.registry) {
                Ok(Some(handle)) => {
                    tracing::info!(
                        class = %self.class,
                        path = %source.path(&handle).display(),
                        "Device back after mode switch"
                    );
                    return Some(handle);
                }
                Ok(None) => interval,
                Err(e) => {
                    tracing::warn!(class = %self.class, error = %e, "Registry lock failed");
                    self.timing.lock_backoff
                }
            };
            if nap(&self.cancel, wait) {
                return None;
            }
        }
    }
}

/// Blocking reader loop for one acquired device
///
/// `current` holds the open handle; it is `None` on return only when the
/// device was closed for a mode switch and not reacquired.
fn read_loop<S: DeviceSource>(source: &mut S, current: &mut Option<S::Handle>, ctx: &ReaderContext) -> ReaderExit {
    let mut slot: Option<PooledMessage> = None;
    let mut stalled = false;

    loop {
        if ctx.cancel.is_cancelled() {
            return ReaderExit::Cancelled;
        }
        let Some(handle) = current.as_mut() else {
            return ReaderExit::Cancelled;
        };

        if slot.is_none() {
            match ctx.pool.acquire() {
                Some(mut message) => {
                    message.reset();
                    slot = Some(message);
                    if stalled {
                        stalled = false;
                        tracing::info!(class = %ctx.class, "Reader resumed");
                    }
                }
                None => {
                    if !stalled {
                        stalled = true;
                        tracing::warn!(
                            class = %ctx.class,
                            in_flight = ctx.pool.in_flight(),
                            "Stalled: no free message slot"
                        );
                    }
                    nap(&ctx.cancel, ctx.timing.stall_delay);
                    continue;
                }
            }
        }
        let Some(message) = slot.as_mut() else {
            continue;
        };

        match source.read_frame(handle, message) {
            Ok(Frame::Ready) => {
                if let Some(message) = slot.take() {
                    if ctx.queue.blocking_send(message).is_err() {
                        // The returned message is dropped here, freeing its slot.
                        tracing::warn!(class = %ctx.class, "Error pushing message, dropped");
                    }
                }
            }
            Ok(Frame::Suppressed) => slot = None,
            Ok(Frame::Pending) => {}
            Ok(Frame::Skipped) => continue,
            Ok(Frame::ModeSwitch) => {
                slot = None;
                if let Some(handle) = current.take() {
                    let path = source.path(&handle).to_path_buf();
                    source.release(handle);
                    ctx.registry.unregister(&path);
                }

                if nap(&ctx.cancel, source.reconnect_pause()) {
                    return ReaderExit::Cancelled;
                }
                *current = ctx.reacquire(source);
                continue;
            }
            Err(SourceError::DeviceGone) => {
                tracing::info!(
                    class = %ctx.class,
                    path = %source.path(handle).display(),
                    "Device removed, read terminated"
                );
                return ReaderExit::DeviceGone;
            }
            Err(e) => {
                tracing::error!(
                    class = %ctx.class,
                    path = %source.path(handle).display(),
                    error = %e,
                    "Read terminated"
                );
                return ReaderExit::Fatal;
            }
        }

        if let Some(pacing) = source.pacing() {
            nap(&ctx.cancel, pacing);
        }
    }
}

/// Run [`read_loop`] on the current thread, keeping the source if it panics
fn run_reader<S: DeviceSource>(mut source: S, handle: S::Handle, ctx: ReaderContext) -> ReaderOutcome<S> {
    let mut current = Some(handle);
    let exit = panic::catch_unwind(AssertUnwindSafe(|| read_loop(&mut source, &mut current, &ctx)))
        .unwrap_or(ReaderExit::Panicked);
    ReaderOutcome {
        source,
        handle: current,
        exit,
    }
}

/// Drives one device class through discovery and reading
pub struct Supervisor<S: DeviceSource> {
    source: Option<S>,
    class: DeviceClass,
    registry: DeviceRegistry,
    pool: MessagePool,
    queue: MessageSender,
    rumble: Option<RumbleReceiver>,
    rumble_length_ms: u16,
    cancel: CancellationToken,
    timing: Timing,
    state: SupervisorState,
}

impl<S: DeviceSource> Supervisor<S> {
    /// Create a supervisor with its own pool of `pool_capacity` messages
    pub fn new(
        source: S,
        registry: DeviceRegistry,
        pool_capacity: usize,
        queue: MessageSender,
        cancel: CancellationToken,
        timing: Timing,
    ) -> Self {
        let pool = MessagePool::new(pool_capacity, || source.payload());
        Self {
            class: source.class(),
            source: Some(source),
            registry,
            pool,
            queue,
            rumble: None,
            rumble_length_ms: DEFAULT_RUMBLE_LENGTH_MS,
            cancel,
            timing,
            state: SupervisorState::Discovering,
        }
    }

    /// Route rumble commands from `commands` to acquired devices
    pub fn with_rumble(mut self, commands: RumbleReceiver, length_ms: u16) -> Self {
        self.rumble = Some(commands);
        self.rumble_length_ms = length_ms;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn pool(&self) -> &MessagePool {
        &self.pool
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    fn set_state(&mut self, state: SupervisorState) {
        if self.state != state {
            tracing::debug!(class = %self.class, from = ?self.state, to = ?state, "Supervisor state");
            self.state = state;
        }
    }

    /// Run until cancelled
    pub async fn run(&mut self) {
        tracing::info!(class = %self.class, slots = self.pool.capacity(), "Supervisor started");

        loop {
            self.set_state(SupervisorState::Discovering);
            if self.cancel.is_cancelled() {
                break;
            }
            let Some(mut source) = self.source.take() else {
                break;
            };

            let registry = self.registry.clone();
            let discovery = tokio::task::spawn_blocking(move || {
                let acquired = acquire(&mut source, &registry);
                (source, acquired)
            });
            let (mut source, acquired) = match discovery.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!(class = %self.class, error = %e, "Discovery task failed");
                    break;
                }
            };

            let handle = match acquired {
                Ok(Some(handle)) => handle,
                Ok(None) => {
                    let wait = source.discovery_interval().unwrap_or(self.timing.discovery_backoff);
                    self.source = Some(source);
                    if backoff(&self.cancel, wait).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(class = %self.class, error = %e, "Registry lock failed");
                    self.source = Some(source);
                    if backoff(&self.cancel, self.timing.lock_backoff).await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(SupervisorState::Acquired);
            let path = source.path(&handle).to_path_buf();
            let rumble = match self.rumble {
                Some(_) => source.rumble(&handle),
                None => None,
            };

            self.set_state(SupervisorState::Reading);
            let ctx = ReaderContext {
                class: self.class,
                registry: self.registry.clone(),
                pool: self.pool.clone(),
                queue: self.queue.clone(),
                cancel: self.cancel.clone(),
                timing: self.timing,
            };
            let reader = tokio::task::spawn_blocking(move || run_reader(source, handle, ctx));

            let joined = match (rumble, self.rumble.as_mut()) {
                (Some(device), Some(commands)) => {
                    discard_pending(commands);
                    let mut output = RumbleOutput::new(device, self.rumble_length_ms);
                    let joined = serve_rumble(reader, &mut output, commands).await;
                    output.shutdown();
                    joined
                }
                _ => reader.await,
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    tracing::error!(class = %self.class, error = %e, "Reader task failed");
                    self.registry.unregister(&path);
                    break;
                }
            };

            let ReaderOutcome {
                mut source,
                handle,
                exit,
            } = outcome;
            if let Some(handle) = handle {
                release(&mut source, handle, &self.registry);
            }
            self.source = Some(source);

            match exit {
                ReaderExit::Cancelled => break,
                ReaderExit::DeviceGone | ReaderExit::Fatal => {
                    tracing::info!(class = %self.class, ?exit, "Reader ended, rediscovering");
                }
                ReaderExit::Panicked => {
                    tracing::error!(class = %self.class, "Reader panicked, rediscovering");
                    if backoff(&self.cancel, self.timing.discovery_backoff).await {
                        break;
                    }
                }
            }
        }

        self.set_state(SupervisorState::Terminated);
        tracing::info!(class = %self.class, "Supervisor stopped");
    }
}

/// Sleep unless cancelled first; true if cancelled
async fn backoff(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

fn release<S: DeviceSource>(source: &mut S, handle: S::Handle, registry: &DeviceRegistry) {
    let path = source.path(&handle).to_path_buf();
    source.release(handle);
    registry.unregister(&path);
}

/// Forward rumble commands until the reader finishes
async fn serve_rumble<T>(
    mut reader: tokio::task::JoinHandle<T>,
    output: &mut RumbleOutput,
    commands: &mut RumbleReceiver,
) -> Result<T, tokio::task::JoinError> {
    let mut open = true;
    loop {
        tokio::select! {
            joined = &mut reader => return joined,
            cmd = commands.recv(), if open => match cmd {
                Some(cmd) => {
                    if let Err(e) = output.handle(cmd) {
                        tracing::warn!(error = %e, "Rumble command failed");
                    }
                }
                None => open = false,
            },
        }
    }
}
