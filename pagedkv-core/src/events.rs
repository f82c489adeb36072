use std::sync::mpsc::{channel, Receiver, Sender};

/// One-shot completion signal for an asynchronous block copy.
///
/// The cache engine hands one `CacheEvent` per layer to the caller when an
/// async swap-in is issued; the attention dispatch for that layer waits on the
/// event before reading the cache. Both halves are consumed by value, so an
/// event is signaled exactly once and waited on exactly once.
pub struct CacheEvent {
    rx: Receiver<()>,
}

pub struct CacheEventSender {
    tx: Sender<()>,
}

impl CacheEvent {
    pub fn channel() -> (CacheEventSender, CacheEvent) {
        let (tx, rx) = channel();
        (CacheEventSender { tx }, CacheEvent { rx })
    }

    /// Block until the copy this event tracks has completed.
    ///
    /// Panics if the sender was dropped without signaling: that means the
    /// copy worker died and reading the cache would observe a partially
    /// copied block.
    pub fn wait(self) {
        self.rx
            .recv()
            .expect("cache event sender dropped without signaling");
    }
}

impl CacheEventSender {
    pub fn signal(self) {
        // The waiter may already be gone (sequence aborted); that is fine.
        let _ = self.tx.send(());
    }
}
