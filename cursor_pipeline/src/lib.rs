//! Cursor updates are the highest-volume, lowest-stakes traffic in the
//! system: only the latest position matters, so each connection gets a
//! capacity-1 "latest wins" slot (the same `tokio::sync::watch`
//! technique the workspace's one-shot latch uses, generalized here into a
//! repeatedly-overwritable coalescing channel) drained on a fixed
//! cadence instead of forwarded message-by-message.

use std::future::Future;
use std::time::Duration;

use task_executor::Executor;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, PartialEq)]
pub struct CursorUpdate {
    pub connection_id: String,
    pub session_id: String,
    pub user_id: String,
    pub x: f64,
    pub y: f64,
    pub sequence: u64,
}

/// A handle a connection's task holds to publish its latest cursor
/// position. Publishing never blocks and never queues: a new publish
/// simply overwrites whatever the drain loop hasn't picked up yet.
#[derive(Clone)]
pub struct CursorHandle {
    sender: watch::Sender<Option<CursorUpdate>>,
}

impl CursorHandle {
    pub fn publish(&self, update: CursorUpdate) {
        // An error here means the drain loop already exited (the
        // connection is tearing down); there is nothing left to coalesce
        // into, so the update is simply dropped.
        let _ = self.sender.send(Some(update));
    }
}

/// Spawns the per-connection drain loop that reads the coalescing slot
/// every `window` and, if a new update has landed since the last drain,
/// calls `dispatch` with it. `dispatch` is responsible for excluding the
/// originating connection when fanning the update out to the rest of the
/// session.
///
/// The loop exits once the `CursorHandle` is dropped (the connection is
/// gone), draining one final pending update first so a last cursor
/// position before disconnect is not silently lost.
pub fn spawn_drain<F, Fut>(executor: &Executor, window: Duration, dispatch: F) -> CursorHandle
where
    F: FnMut(CursorUpdate) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    let (sender, receiver) = watch::channel(None);
    executor.spawn(run_drain_loop(window, receiver, dispatch));
    CursorHandle { sender }
}

async fn run_drain_loop<F, Fut>(window: Duration, mut receiver: watch::Receiver<Option<CursorUpdate>>, mut dispatch: F)
where
    F: FnMut(CursorUpdate) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = tokio::time::interval(window);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match receiver.has_changed() {
            Ok(true) => {
                if let Some(update) = receiver.borrow_and_update().clone() {
                    dispatch(update).await;
                }
            }
            Ok(false) => {}
            Err(_closed) => {
                if let Some(update) = receiver.borrow().clone() {
                    dispatch(update).await;
                }
                return;
            }
        }
    }
}
