//! Liveness probing add-on (§4.11): periodically sends a `$/ping` request and fires
//! `on_unresponsive`/`on_responsive` on responsiveness transitions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::dispatcher::Dispatcher;
use crate::peer_options::HeartbeatOptions;

pub const METHOD_PING: &str = "$/ping";

/// Owns the background probing task. Dropping or calling [`Self::stop`] halts it; neither is
/// required if `options.enabled` was false, since no task is ever spawned in that case.
pub struct HeartbeatMonitor {
    handle: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl HeartbeatMonitor {
    /// Spawns the probe loop if `options.enabled`; otherwise returns an inert monitor. Fires
    /// `options.on_unresponsive`/`options.on_responsive` on responsiveness transitions only — a
    /// peer that has already been flagged unresponsive does not fire again on every subsequent
    /// missed probe, and a still-responsive peer never fires `on_responsive` (§4.11).
    pub fn start(dispatcher: Arc<Dispatcher>, options: HeartbeatOptions) -> Self {
        let stopped = Arc::new(AtomicBool::new(false));
        if !options.enabled {
            return HeartbeatMonitor { handle: Mutex::new(None), stopped };
        }

        let stopped_for_loop = stopped.clone();
        let responsive = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(options.interval).await;
                if stopped_for_loop.load(Ordering::SeqCst) {
                    break;
                }
                // A peer that returns an error (e.g. `-32601 MethodNotFound` because it never
                // registered a `$/ping` handler) still completed a round-trip within the timeout
                // and counts as responsive; only `RequestTimedOut` means the probe went unanswered
                // (§4.11).
                match dispatcher.send_request(METHOD_PING, None, Some(options.timeout), None).await {
                    Err(crate::error::LspError::RequestTimedOut(_)) => {
                        if responsive.swap(false, Ordering::SeqCst) {
                            if let Some(hook) = &options.on_unresponsive {
                                hook();
                            }
                        }
                    }
                    _ => {
                        if !responsive.swap(true, Ordering::SeqCst) {
                            if let Some(hook) = &options.on_responsive {
                                hook();
                            }
                        }
                    }
                }
            }
        });

        HeartbeatMonitor { handle: Mutex::new(Some(handle)), stopped }
    }

    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }
}
