//! Producer and consumer sides of the block handshake.
//!
//! Each client walks the ring in order, `block_index = (block_index + 1) mod N`,
//! and only advances after the mark call that hands the slot to the other side.
//! A wait that times out is backpressure: the client publishes `blocked` under
//! its status key and tries again until the shutdown signal fires. Any other
//! ring error is returned to the stage, which treats it as fatal.

use super::{BlockRing, FilledBlock, FreeBlock, RingError};
use crate::pipeline::ShutdownSignal;
use crate::status::StatusTable;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace};

/// Outcome of an acquire call.
#[derive(Debug)]
pub enum Acquired<B> {
    /// The slot is now owned by the caller.
    Block(B),
    /// Shutdown was requested while waiting; no slot is owned.
    Cancelled,
}

struct Waiter {
    ring: Arc<BlockRing>,
    status: Arc<StatusTable>,
    status_key: String,
    timeout: Duration,
    shutdown: ShutdownSignal,
    block_index: usize,
}

impl Waiter {
    fn wait<B>(
        &self,
        mut attempt: impl FnMut(&Arc<BlockRing>, usize, Duration) -> Result<B, RingError>,
        mut on_timeout: impl FnMut(),
    ) -> Result<Acquired<B>, RingError> {
        loop {
            match attempt(&self.ring, self.block_index, self.timeout) {
                Ok(block) => return Ok(Acquired::Block(block)),
                Err(RingError::Timeout) => {
                    trace!(
                        key = %self.status_key,
                        index = self.block_index,
                        "Block wait timed out"
                    );
                    self.status.publish(&self.status_key, "blocked");
                    on_timeout();
                    if self.shutdown.is_triggered() {
                        return Ok(Acquired::Cancelled);
                    }
                }
                Err(err) => {
                    error!(
                        key = %self.status_key,
                        index = self.block_index,
                        error = %err,
                        "Ring buffer failure"
                    );
                    return Err(err);
                }
            }
        }
    }

    fn advance(&mut self) {
        self.block_index = (self.block_index + 1) % self.ring.num_blocks();
    }
}

/// Producer side: acquire free blocks, publish them as filled.
pub struct ProducerClient {
    waiter: Waiter,
}

impl ProducerClient {
    /// A client starting at slot 0.
    pub fn new(
        ring: Arc<BlockRing>,
        status: Arc<StatusTable>,
        status_key: impl Into<String>,
        timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            waiter: Waiter {
                ring,
                status,
                status_key: status_key.into(),
                timeout,
                shutdown,
                block_index: 0,
            },
        }
    }

    /// Slot the next acquire will wait on.
    pub fn block_index(&self) -> usize {
        self.waiter.block_index
    }

    /// Wait for the current slot to become free.
    pub fn acquire(&mut self) -> Result<Acquired<FreeBlock>, RingError> {
        self.waiter
            .wait(|ring, index, timeout| ring.wait_free(index, timeout), || {})
    }

    /// Hand a written block to the consumer and move to the next slot.
    pub fn publish(&mut self, block: FreeBlock) {
        debug_assert_eq!(block.index(), self.waiter.block_index);
        block.mark_filled();
        self.waiter.advance();
    }
}

/// Consumer side: acquire filled blocks, release them as free.
pub struct ConsumerClient {
    waiter: Waiter,
}

impl ConsumerClient {
    /// A client starting at slot 0.
    pub fn new(
        ring: Arc<BlockRing>,
        status: Arc<StatusTable>,
        status_key: impl Into<String>,
        timeout: Duration,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            waiter: Waiter {
                ring,
                status,
                status_key: status_key.into(),
                timeout,
                shutdown,
                block_index: 0,
            },
        }
    }

    /// Slot the next acquire will wait on.
    pub fn block_index(&self) -> usize {
        self.waiter.block_index
    }

    /// Wait for the current slot to be filled.
    pub fn acquire(&mut self) -> Result<Acquired<FilledBlock>, RingError> {
        self.acquire_with(|| {})
    }

    /// Like [`ConsumerClient::acquire`], running `on_idle` after every timeout.
    pub fn acquire_with(
        &mut self,
        on_idle: impl FnMut(),
    ) -> Result<Acquired<FilledBlock>, RingError> {
        self.waiter
            .wait(|ring, index, timeout| ring.wait_filled(index, timeout), on_idle)
    }

    /// Return a consumed block to the pool and move to the next slot.
    pub fn release(&mut self, block: FilledBlock) {
        debug_assert_eq!(block.index(), self.waiter.block_index);
        block.mark_free();
        self.waiter.advance();
    }
}
