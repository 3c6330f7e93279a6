//! Event loop interface (§6) and a `tokio`-backed implementation (§B).
//!
//! The dispatch core treats readiness notification and timers as an
//! external collaborator; this module specifies that interface and
//! supplies a reference implementation so the rest of the crate is
//! independently runnable, not just independently testable.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::leg::Leg;

/// A cancellable timer handle (§6 `add_timer`).
pub struct Timer {
    handle: JoinHandle<()>,
}

impl Timer {
    /// Cancels the timer; a no-op if it already fired.
    pub fn cancel(self) {
        self.handle.abort();
    }
}

/// Readiness + timer primitive the dispatcher relies on (§6). `add_fd` has
/// no native meaning in an async runtime that schedules tasks rather than
/// polling raw descriptors, so the `tokio` implementation below drives leg
/// readiness via each leg's own async `receive` future instead of exposing
/// raw FDs to a reactor — see [`TokioEventLoop::run`].
pub trait EventLoop: Send + Sync {
    /// Schedules `cb` to run after `delay`, repeating every `delay` if
    /// `repeat` is true. Returns a handle that cancels it.
    fn add_timer(
        &self,
        delay: Duration,
        repeat: bool,
        cb: Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>,
    ) -> Timer;

    /// Monotonic seconds since an arbitrary epoch, for logging/metrics
    /// only — the dispatcher's own timing uses `tokio::time::Instant`.
    fn looptime(&self) -> f64;
}

/// Reference [`EventLoop`] built directly on `tokio::time`/`tokio::spawn`,
/// the "native async resolver" option §9 calls out as an acceptable
/// substitute for the reference implementation's blocking DNS.
pub struct TokioEventLoop {
    started: std::time::Instant,
}

impl Default for TokioEventLoop {
    fn default() -> Self {
        Self {
            started: std::time::Instant::now(),
        }
    }
}

impl EventLoop for TokioEventLoop {
    fn add_timer(
        &self,
        delay: Duration,
        repeat: bool,
        cb: Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>,
    ) -> Timer {
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                cb().await;
                if !repeat {
                    break;
                }
            }
        });
        Timer { handle }
    }

    fn looptime(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

impl TokioEventLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs the 1 Hz `queue_expire` sweep (§2 control flow: "a periodic
    /// timer drives `queue_expire` every second") and, for each leg with a
    /// pollable `receive` future, forwards whatever it produces into
    /// `dispatcher.receive` (§4.3: a `None` return from a leg's own read
    /// is silently ignored).
    pub fn run(self: Arc<Self>, dispatcher: Arc<Mutex<Dispatcher>>, legs: Vec<Arc<dyn Leg>>) {
        let sweep_dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let now = tokio::time::Instant::now();
                sweep_dispatcher.lock().await.queue_expire(now).await;
            }
        });

        for leg in legs {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                loop {
                    match leg.receive().await {
                        Ok(Some((packet, from))) => {
                            let now = tokio::time::Instant::now();
                            dispatcher
                                .lock()
                                .await
                                .receive(packet, leg.clone(), from, now)
                                .await;
                        }
                        Ok(None) => continue,
                        Err(e) => {
                            log::warn!("leg receive failed: {e}");
                            break;
                        }
                    }
                }
            });
        }
    }
}
