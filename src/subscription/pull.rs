// src/subscription/pull.rs

//! Pull-mode control loop.
//!
//! One loop per pull listener cycles through three states:
//!
//! ```text
//!            +-----------+  empty   +---------+
//!   start -> | FETCHING  | -------> | WAITING |
//!            +-----------+          +---------+
//!               ^    | messages        |  interval elapsed or
//!               |    v                 |  new message signal
//!            +-------------+           |
//!            | DISPATCHING | <---------+ (back to FETCHING)
//!            +-------------+
//! ```
//!
//! A batch is handed to the dispatcher in fetch order and the loop fetches
//! again after yielding to the runtime once. A failed fetch is logged and counted, then treated
//! like an empty one. The interval is fixed; there is no backoff.
//!
//! The loop only stops on its stop signal. A batch already being
//! dispatched is finished first so no fetched message is left unsettled.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::dispatch::SinkPtr;
use crate::{log_debug, log_warn, PullHandlePtr};

pub(crate) struct PullLoop {
    // ---
    pub name: Arc<str>,
    pub handle: PullHandlePtr,
    pub sink: SinkPtr,
    pub batch_size: usize,
    pub interval: Duration,
    pub max_wait: Duration,
    pub initial_delay: Duration,
}

impl PullLoop {
    // ---
    pub fn spawn(self, stop: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(stop))
    }

    async fn run(self, mut stop: oneshot::Receiver<()>) {
        // ---
        if !self.initial_delay.is_zero() {
            tokio::select! {
                _ = &mut stop => return,
                _ = tokio::time::sleep(self.initial_delay) => {}
            }
        }
        log_debug!(
            "listener {}: pull loop started (batch {}, interval {:?}, max wait {:?})",
            self.name,
            self.batch_size,
            self.interval,
            self.max_wait
        );

        loop {
            let fetched = tokio::select! {
                biased;
                _ = &mut stop => break,
                fetched = self.handle.fetch(self.batch_size, self.max_wait) => fetched,
            };

            let batch = match fetched {
                Ok(batch) => batch,
                Err(err) => {
                    self.sink.record_fetch_error();
                    log_warn!("listener {}: fetch failed: {err}", self.name);
                    Vec::new()
                }
            };

            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = &mut stop => break,
                    _ = self.handle.wait_for_message(self.interval) => {}
                }
                continue;
            }

            for message in batch {
                self.sink.dispatch(message).await;
            }
            // a redelivered message can be fetched again without waiting
            tokio::task::yield_now().await;
        }

        log_debug!("listener {}: pull loop stopped", self.name);
    }
}
