//! Alert driver - renders the blink pattern on a dedicated thread
//!
//! The render thread owns the output driver outright, so every pin write happens
//! on that one thread. Other contexts only touch the shared [`AlertTarget`] cell
//! through an [`AlertHandle`].
//!
//! Render loop:
//! - `Idle`: both outputs low, wait `idle_poll`, re-check
//! - `Blinking(i)`: both high, wait `i`, both low, wait `i`, re-check
//!
//! A target written mid-cycle is picked up at the next cycle boundary. `silence()`
//! cuts the current wait short instead, so the outputs drop within one step. Every
//! wait is interruptible by `stop()`, and the loop always exits with both outputs low.

use crate::domain::types::AlertTarget;
use crate::io::gpio::{OutputDriver, OutputError};
use parking_lot::{Condvar, Mutex};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, warn};

const RENDER_THREAD_NAME: &str = "alert-render";

#[derive(Debug, Error)]
pub enum AlertError {
    #[error("failed to spawn render thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("output driver failed: {0}")]
    Output(#[from] OutputError),

    #[error("render thread panicked; outputs may not have been de-asserted")]
    Panicked,

    #[error("output driver is no longer available (lost with a previous render thread)")]
    OutputLost,
}

/// Where the link supervisor pushes targets.
///
/// Implemented by [`AlertHandle`]; tests substitute a recorder.
pub trait AlertSink: Send + Sync {
    /// Last-write-wins; must not block on the render loop.
    fn set_target(&self, target: AlertTarget);

    /// Go idle without waiting out the current blink cycle.
    fn silence(&self) {
        self.set_target(AlertTarget::Idle);
    }

    /// True once the renderer has died on an output error.
    fn is_failed(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct RenderState {
    target: AlertTarget,
    stop: bool,
    preempt: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<RenderState>,
    wake: Condvar,
    running: AtomicBool,
    failed: AtomicBool,
}

impl Shared {
    /// Current target, or `None` once stop has been requested
    fn next_target(&self) -> Option<AlertTarget> {
        let mut state = self.state.lock();
        state.preempt = false;
        (!state.stop).then_some(state.target)
    }

    /// Sleep for `duration` unless stopped or preempted first. Returns true if stop
    /// was requested.
    fn pause(&self, duration: Duration) -> bool {
        // Too far out to represent: wait for a wake-up only
        let deadline = Instant::now().checked_add(duration);
        let mut state = self.state.lock();
        while !state.stop && !state.preempt {
            match deadline {
                Some(deadline) => {
                    if self.wake.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.wake.wait(&mut state),
            }
        }
        state.stop
    }
}

/// Cheap, cloneable writer for the shared target
#[derive(Debug, Clone)]
pub struct AlertHandle {
    shared: Arc<Shared>,
}

impl AlertHandle {
    pub fn target(&self) -> AlertTarget {
        self.shared.state.lock().target
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }
}

impl AlertSink for AlertHandle {
    fn set_target(&self, target: AlertTarget) {
        // A zero interval would spin the render loop; store it as idle
        self.shared.state.lock().target = AlertTarget::from_interval(target.interval());
    }

    fn silence(&self) {
        let mut state = self.shared.state.lock();
        state.target = AlertTarget::Idle;
        state.preempt = true;
        drop(state);
        self.shared.wake.notify_all();
    }

    fn is_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }
}

struct RenderExit<O> {
    output: O,
    result: Result<(), OutputError>,
}

/// Owns the render thread and, while stopped, the output driver.
pub struct AlertDriver<O: OutputDriver> {
    handle: AlertHandle,
    idle_poll: Duration,
    output: Option<O>,
    thread: Option<JoinHandle<RenderExit<O>>>,
    loops_started: usize,
}

impl<O: OutputDriver> AlertDriver<O> {
    pub fn new(output: O, idle_poll: Duration) -> Self {
        Self {
            handle: AlertHandle { shared: Arc::new(Shared::default()) },
            idle_poll,
            output: Some(output),
            thread: None,
            loops_started: 0,
        }
    }

    pub fn handle(&self) -> AlertHandle {
        self.handle.clone()
    }

    pub fn set_target(&self, target: AlertTarget) {
        self.handle.set_target(target);
    }

    /// Number of render loops spawned over the driver's lifetime
    pub fn loops_started(&self) -> usize {
        self.loops_started
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Spawn the render loop. No effect if it is already running.
    pub fn start(&mut self) -> Result<(), AlertError> {
        if self.is_running() {
            debug!("alert_driver_already_running");
            return Ok(());
        }
        // A loop that exited on its own (output failure) must be reaped first
        if self.thread.is_some() {
            self.join()?;
        }

        let output = self.output.take().ok_or(AlertError::OutputLost)?;
        let shared = self.handle.shared.clone();
        {
            let mut state = shared.state.lock();
            state.stop = false;
            state.preempt = false;
        }
        shared.failed.store(false, Ordering::Release);
        shared.running.store(true, Ordering::Release);

        let idle_poll = self.idle_poll;
        let thread = thread::Builder::new()
            .name(RENDER_THREAD_NAME.to_string())
            .spawn(move || render_loop(shared, output, idle_poll))
            .map_err(|e| {
                self.handle.shared.running.store(false, Ordering::Release);
                AlertError::Spawn(e)
            })?;

        self.thread = Some(thread);
        self.loops_started += 1;
        info!(idle_poll_ms = %self.idle_poll.as_millis(), "alert_driver_started");
        Ok(())
    }

    /// Signal the render loop and block until it has exited.
    ///
    /// When this returns Ok, both outputs are low and nothing writes to them until
    /// the next `start()`.
    pub fn stop(&mut self) -> Result<(), AlertError> {
        if self.thread.is_none() {
            return Ok(());
        }
        self.handle.shared.state.lock().stop = true;
        self.handle.shared.wake.notify_all();

        let result = self.join();
        info!("alert_driver_stopped");
        result
    }

    /// Stop and hand back the output driver for release
    pub fn into_output(mut self) -> Result<O, AlertError> {
        self.stop()?;
        self.output.take().ok_or(AlertError::OutputLost)
    }

    fn join(&mut self) -> Result<(), AlertError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        match thread.join() {
            Ok(exit) => {
                self.output = Some(exit.output);
                exit.result.map_err(AlertError::from)
            }
            Err(_) => {
                self.handle.shared.running.store(false, Ordering::Release);
                Err(AlertError::Panicked)
            }
        }
    }
}

impl<O: OutputDriver> Drop for AlertDriver<O> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.stop() {
                error!(error = %e, "alert_driver_stop_on_drop_failed");
            }
        }
    }
}

fn render_loop<O: OutputDriver>(
    shared: Arc<Shared>,
    mut output: O,
    idle_poll: Duration,
) -> RenderExit<O> {
    let rendered = render(&shared, &mut output, idle_poll);
    if let Err(e) = &rendered {
        error!(error = %e, "alert_output_failed");
        shared.failed.store(true, Ordering::Release);
    }

    // Leave both outputs low however the loop ended
    let cleared = output.set_all(false);
    if let Err(e) = &cleared {
        warn!(error = %e, "alert_output_clear_failed");
    }

    shared.running.store(false, Ordering::Release);
    RenderExit { output, result: rendered.and(cleared) }
}

fn render<O: OutputDriver>(
    shared: &Shared,
    output: &mut O,
    idle_poll: Duration,
) -> Result<(), OutputError> {
    let mut last = None;

    while let Some(target) = shared.next_target() {
        if last != Some(target) {
            debug!(target = %target, "alert_target_applied");
            last = Some(target);
        }

        match target {
            AlertTarget::Idle => {
                output.set_all(false)?;
                if shared.pause(idle_poll) {
                    break;
                }
            }
            AlertTarget::Blinking(interval) => {
                output.set_all(true)?;
                if shared.pause(interval) {
                    break;
                }
                output.set_all(false)?;
                if shared.pause(interval) {
                    break;
                }
            }
        }
    }
    Ok(())
}
