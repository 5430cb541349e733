//! Phase signaling for unirig measurement sessions.
//!
//! A session coordinates several concurrently running units: the target
//! watcher, the resource observer and the benchmark matrix runner. These
//! units never share mutable data; the only things they exchange are
//! one-time phase facts -- the target is running, the target has exited,
//! the benchmark matrix is finished, the session is shutting down. Each
//! such phase gets its own `Broadcaster`/`Watcher` pair.
//!
//! The `Broadcaster` fires the signal exactly once. A `Watcher` waits for
//! it, possibly from inside a `tokio::select!` loop. There is one
//! `Broadcaster` and potentially many `Watcher` instances per phase.

#![deny(clippy::all)]
#![deny(clippy::cargo)]
#![deny(clippy::pedantic)]
#![deny(unused_extern_crates)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]
#![deny(missing_debug_implementations)]

use tokio::sync::broadcast::{self, error};

/// Construct a `Watcher` and `Broadcaster` pair for one phase.
#[must_use]
pub fn signal() -> (Watcher, Broadcaster) {
    // The broadcast channel is used only for its reliable closed-channel
    // semantics: dropping the sender is the signal, and every receiver,
    // present or resubscribed, observes the close.
    let (sender, receiver) = broadcast::channel(1);

    (Watcher { receiver }, Broadcaster { sender })
}

#[derive(Debug)]
/// Mechanism to notify one or more `Watcher` instances that a phase has
/// been reached.
pub struct Broadcaster {
    sender: broadcast::Sender<()>,
}

impl Broadcaster {
    /// Send the signal through to any `Watcher` instances.
    ///
    /// Function will NOT block until peers have observed the signal.
    pub fn signal(self) {
        drop(self.sender);
    }
}

#[derive(Debug)]
/// Mechanism to watch for a phase change, typically consumed in a
/// `tokio::select!` arm.
pub struct Watcher {
    receiver: broadcast::Receiver<()>,
}

impl Watcher {
    /// Receive the phase signal. This function will block if the signal
    /// has not already been sent.
    ///
    /// # Panics
    ///
    /// Panics if the broadcast receiver has lagged, indicating a
    /// programming error in signal coordination.
    pub async fn recv(mut self) {
        match self.receiver.recv().await {
            Ok(()) | Err(error::RecvError::Closed) => {}
            Err(error::RecvError::Lagged(_)) => {
                panic!("Catastrophic programming error: lagged behind");
            }
        }
    }
}

impl Clone for Watcher {
    fn clone(&self) -> Self {
        Self {
            receiver: self.receiver.resubscribe(),
        }
    }
}
