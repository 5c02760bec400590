//! A consumer that only inspects blocks.
//!
//! Logs every block at debug level, checks that sequence numbers within a scan
//! arrive in increasing order, and frees the slot. Useful for exercising the
//! producer without touching the disk.

use super::{Stage, StageContext, StageRole};
use crate::config::SimConfig;
use crate::error::AppResult;
use crate::ring::{Acquired, Block, ConsumerClient, PAYLOAD_LEN};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Registry name.
pub const NAME: &str = "block_monitor";

/// Loop phase key.
pub const STATUS_KEY: &str = "MONSTAT";

/// Blocks seen so far.
pub const COUNT_KEY: &str = "MONBLKS";

/// Logs and releases blocks.
pub struct BlockMonitor {
    block_timeout: Duration,
    blocks_seen: i64,
    last: Option<(u32, u64)>,
}

impl BlockMonitor {
    /// A monitor using the configured block timeout.
    pub fn new(config: &SimConfig) -> Self {
        Self {
            block_timeout: config.block_timeout(),
            blocks_seen: 0,
            last: None,
        }
    }

    /// Record one block; returns `false` if it arrived out of order.
    fn inspect(&mut self, block: &Block) -> bool {
        let scan = block.header.scan_number;
        let sequence = block.header.sequence_number;
        self.blocks_seen += 1;
        debug!(
            scan,
            sequence,
            first = block.payload[0],
            last = block.payload[PAYLOAD_LEN - 1],
            "Block received"
        );

        let in_order = match self.last {
            Some((last_scan, last_seq)) if last_scan == scan => sequence > last_seq,
            _ => true,
        };
        if !in_order {
            warn!(scan, sequence, previous = ?self.last, "Block out of order");
        }
        self.last = Some((scan, sequence));
        in_order
    }
}

impl Stage for BlockMonitor {
    fn name(&self) -> &'static str {
        NAME
    }

    fn status_key(&self) -> &'static str {
        STATUS_KEY
    }

    fn role(&self) -> StageRole {
        StageRole::Consumer
    }

    fn init(&mut self, ctx: &StageContext) -> AppResult<()> {
        ctx.status.publish(STATUS_KEY, "init");
        ctx.status.publish(COUNT_KEY, 0_i64);
        Ok(())
    }

    fn run(&mut self, ctx: &StageContext) -> AppResult<()> {
        let mut client = ConsumerClient::new(
            Arc::clone(&ctx.ring),
            Arc::clone(&ctx.status),
            STATUS_KEY,
            self.block_timeout,
            ctx.shutdown.clone(),
        );

        loop {
            ctx.status.publish(STATUS_KEY, "waiting");
            let filled = match client.acquire()? {
                Acquired::Block(filled) => filled,
                Acquired::Cancelled => break,
            };
            self.inspect(filled.block());
            client.release(filled);
            ctx.status.publish(COUNT_KEY, self.blocks_seen);

            if ctx.shutdown.is_triggered() {
                break;
            }
        }

        ctx.status.publish(STATUS_KEY, "stopped");
        Ok(())
    }
}
