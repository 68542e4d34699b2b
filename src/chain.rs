//! Block-height clock, the sole source of protocol time.
//!
//! The upstream chain adapter publishes heights into a [`tokio::sync::watch`]
//! channel; the clock only ever observes them. Monotonicity is the
//! publisher's contract, the clock does not interpret block content.

use thiserror::Error;
use tokio::sync::watch;

/// The upstream height publisher went away; no further blocks will be
/// observed and every in-flight session must abort.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
#[error("block height source terminated")]
pub struct ChainShutdown;

/// Read handle over the chain's block height. Cheap to clone; every clone
/// observes the same stream.
#[derive(Clone, Debug)]
pub struct BlockClock {
    height: watch::Receiver<u64>,
}

impl BlockClock {
    pub fn new(height: watch::Receiver<u64>) -> Self {
        BlockClock { height }
    }

    /// Creates a height publisher plus a clock observing it, starting at
    /// `initial`. Used by chain adapters and tests.
    pub fn channel(initial: u64) -> (watch::Sender<u64>, BlockClock) {
        let (tx, rx) = watch::channel(initial);
        (tx, BlockClock::new(rx))
    }

    /// Non-blocking snapshot of the latest observed height.
    pub fn current_height(&self) -> u64 {
        *self.height.borrow()
    }

    /// Suspends until the chain reaches `height`, returning the first
    /// observed height that satisfies it. Returns immediately if the chain
    /// is already there.
    pub async fn wait_until(&self, height: u64) -> Result<u64, ChainShutdown> {
        let mut rx = self.height.clone();
        let observed = rx
            .wait_for(|current| *current >= height)
            .await
            .map_err(|_| ChainShutdown)?;
        Ok(*observed)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn snapshot_tracks_published_heights() {
        let (tx, clock) = BlockClock::channel(100);
        assert_eq!(clock.current_height(), 100);
        tx.send(105).unwrap();
        // watch receivers observe the latest value without awaiting
        assert_eq!(clock.wait_until(0).await.unwrap(), 105);
    }

    #[tokio::test]
    async fn wait_until_returns_immediately_when_reached() {
        let (_tx, clock) = BlockClock::channel(42);
        assert_eq!(clock.wait_until(40).await.unwrap(), 42);
        assert_eq!(clock.wait_until(42).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn wait_until_suspends_for_future_heights() {
        let (tx, clock) = BlockClock::channel(1);
        let waiter = tokio::spawn({
            let clock = clock.clone();
            async move { clock.wait_until(3).await }
        });
        tx.send(2).unwrap();
        tx.send(3).unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), 3);
    }

    #[tokio::test]
    async fn dropped_publisher_is_a_shutdown() {
        let (tx, clock) = BlockClock::channel(7);
        drop(tx);
        assert_eq!(clock.wait_until(8).await, Err(ChainShutdown));
        // already-satisfied waits still succeed on the last published value
        assert_eq!(clock.wait_until(7).await, Ok(7));
    }
}
