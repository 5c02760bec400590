//! Memory-mapped ring of fixed-size blocks with a fill/free handshake.
//!
//! The ring is a small, fixed number of block slots (two by default) living in a
//! memory-mapped file so that a producer and a consumer can share it, across
//! threads or across processes. Each slot carries an atomic ownership word:
//!
//! ```text
//!   FREE --wait_free--> WRITING --mark_filled--> FILLED --wait_filled--> READING
//!    ^                                                                      |
//!    +------------------------------- mark_free ----------------------------+
//! ```
//!
//! A slot's block can only be touched through the guard returned by a
//! successful wait ([`FreeBlock`] or [`FilledBlock`]), and the guard is consumed
//! by the matching mark call. That makes it impossible to write a block after
//! publishing it or to read it after releasing it.
//!
//! # Memory Layout
//! ```text
//! [128-byte header] [num_blocks x 64-byte slot words] [num_blocks x Block]
//!
//! Header:
//!   magic: u64          (0xDADA5CA400000001)
//!   num_blocks: u64
//!   block_size: u64     (size_of::<Block>())
//!   slots_offset: u64
//!   blocks_offset: u64
//!   padding: [u8; 88]
//! ```

pub mod handshake;

pub use handshake::{Acquired, ConsumerClient, ProducerClient};

use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of payload elements in every block.
pub const PAYLOAD_LEN: usize = 40;

/// Magic number for ring header validation.
const MAGIC: u64 = 0xDA_DA_5C_A4_00_00_00_01;

/// Size of the ring header in bytes.
const HEADER_SIZE: usize = 128;

/// Each slot word sits on its own cache line.
const SLOT_STRIDE: usize = 64;

const FREE: u32 = 0;
const WRITING: u32 = 1;
const FILLED: u32 = 2;
const READING: u32 = 3;

/// Errors from the ring primitive.
#[derive(Error, Debug)]
pub enum RingError {
    /// The wait expired; the peer is slow. Not a failure.
    #[error("timed out waiting for block")]
    Timeout,

    #[error("block index {index} out of range for a ring of {num_blocks}")]
    SlotOutOfRange { index: usize, num_blocks: usize },

    #[error("slot {index} holds invalid state {state}")]
    Corrupted { index: usize, state: u32 },

    #[error("invalid ring magic: expected 0x{expected:016X}, got 0x{found:016X}")]
    BadMagic { expected: u64, found: u64 },

    #[error("ring layout mismatch: {0}")]
    Layout(String),

    #[error("ring I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-block header.
///
/// Besides its position, every block carries the parameters of the scan that
/// produced it, so a consumer can attribute and bound a scan from the blocks
/// alone.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BlockHeader {
    /// Position of this block in its scan's sequence.
    pub sequence_number: u64,
    /// Scan that produced this block.
    pub scan_number: u32,
    /// Commanded scan length in seconds.
    pub duration_secs: u32,
    /// Blocks the scan will produce in total; 0 when unknown.
    pub blocks_required: u64,
    /// Commanded start time (DMJD).
    pub start_time: f64,
}

impl BlockHeader {
    /// Header for block `sequence_number` of scan `scan_number`.
    pub fn new(sequence_number: u64, scan_number: u32) -> Self {
        Self {
            sequence_number,
            scan_number,
            ..Self::default()
        }
    }

    /// Attach the parameters of the owning scan.
    #[must_use]
    pub fn with_scan(mut self, blocks_required: u64, duration_secs: u32, start_time: f64) -> Self {
        self.blocks_required = blocks_required;
        self.duration_secs = duration_secs;
        self.start_time = start_time;
        self
    }
}

/// One unit of transfer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Block {
    /// Sequencing information.
    pub header: BlockHeader,
    /// Sample payload.
    pub payload: [i32; PAYLOAD_LEN],
}

impl Default for Block {
    fn default() -> Self {
        Self {
            header: BlockHeader::default(),
            payload: [0; PAYLOAD_LEN],
        }
    }
}

/// Ownership of a slot as seen through its state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// In the pool.
    Free,
    /// Owned by the producer.
    Writing,
    /// Published, waiting for the consumer.
    Filled,
    /// Owned by the consumer.
    Reading,
}

impl SlotState {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            FREE => Some(SlotState::Free),
            WRITING => Some(SlotState::Writing),
            FILLED => Some(SlotState::Filled),
            READING => Some(SlotState::Reading),
            _ => None,
        }
    }
}

#[repr(C)]
struct RingHeader {
    magic: u64,
    num_blocks: u64,
    block_size: u64,
    slots_offset: u64,
    blocks_offset: u64,
    _padding: [u8; 88],
}

/// Memory-mapped block ring.
///
/// # Safety
/// This structure holds raw pointers into the mapping. It is sound as long as:
/// - the mapping lives as long as the ring (it is owned by the ring)
/// - a block is only dereferenced by the holder of its slot's ownership word
/// - ownership transfers use Acquire/Release ordering on the slot word
pub struct BlockRing {
    _mmap: MmapMut,
    slots: *const u8,
    blocks: *mut Block,
    num_blocks: usize,
    poll_interval: Duration,
}

// SAFETY: Cross-thread access to block memory is arbitrated by the atomic slot
// words; the raw pointers stay valid for the lifetime of the owned mapping.
#[allow(unsafe_code)]
unsafe impl Send for BlockRing {}

// SAFETY: See above. Shared references only expose atomic operations and
// guard-mediated block access.
#[allow(unsafe_code)]
unsafe impl Sync for BlockRing {}

fn layout(num_blocks: usize) -> (usize, usize, usize) {
    let slots_offset = HEADER_SIZE;
    let blocks_offset = slots_offset + num_blocks * SLOT_STRIDE;
    let total = blocks_offset + num_blocks * std::mem::size_of::<Block>();
    (slots_offset, blocks_offset, total)
}

impl BlockRing {
    /// Default interval between ownership checks while waiting.
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_micros(50);

    /// Create (or truncate) a ring of `num_blocks` slots backed by `path`.
    ///
    /// All slots start free and all blocks zeroed.
    #[allow(unsafe_code)]
    pub fn create(path: &Path, num_blocks: usize) -> Result<Self, RingError> {
        if num_blocks == 0 {
            return Err(RingError::Layout("a ring needs at least one block".into()));
        }
        let (slots_offset, blocks_offset, total) = layout(num_blocks);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(total as u64)?;

        // SAFETY: We just created the file and set its size.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        mmap.fill(0);

        let base = mmap.as_mut_ptr();
        let header = base as *mut RingHeader;
        // SAFETY: The mapping is at least HEADER_SIZE bytes and page aligned.
        unsafe {
            (*header).magic = MAGIC;
            (*header).num_blocks = num_blocks as u64;
            (*header).block_size = std::mem::size_of::<Block>() as u64;
            (*header).slots_offset = slots_offset as u64;
            (*header).blocks_offset = blocks_offset as u64;
        }

        // SAFETY: Offsets were computed from the same layout used for `total`.
        let (slots, blocks) = unsafe {
            (
                base.add(slots_offset) as *const u8,
                base.add(blocks_offset) as *mut Block,
            )
        };

        Ok(Self {
            _mmap: mmap,
            slots,
            blocks,
            num_blocks,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        })
    }

    /// Attach to a ring created by [`BlockRing::create`].
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> Result<Self, RingError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len < HEADER_SIZE {
            return Err(RingError::Layout(format!(
                "file is {file_len} bytes, smaller than the header"
            )));
        }

        // SAFETY: Mapping an existing file of at least HEADER_SIZE bytes.
        let mut mmap = unsafe { MmapOptions::new().map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let header = base as *const RingHeader;
        // SAFETY: Header fits within the mapping (checked above).
        let (magic, num_blocks, block_size) =
            unsafe { ((*header).magic, (*header).num_blocks, (*header).block_size) };

        if magic != MAGIC {
            return Err(RingError::BadMagic {
                expected: MAGIC,
                found: magic,
            });
        }
        if block_size as usize != std::mem::size_of::<Block>() {
            return Err(RingError::Layout(format!(
                "block size {block_size} does not match {}",
                std::mem::size_of::<Block>()
            )));
        }
        let num_blocks = num_blocks as usize;
        let (slots_offset, blocks_offset, total) = layout(num_blocks);
        if num_blocks == 0 || file_len < total {
            return Err(RingError::Layout(format!(
                "file is {file_len} bytes, {num_blocks} blocks need {total}"
            )));
        }

        // SAFETY: Layout validated against the file length.
        let (slots, blocks) = unsafe {
            (
                base.add(slots_offset) as *const u8,
                base.add(blocks_offset) as *mut Block,
            )
        };

        Ok(Self {
            _mmap: mmap,
            slots,
            blocks,
            num_blocks,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
        })
    }

    /// Change how often waits re-check slot ownership.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_micros(1));
        self
    }

    /// Number of slots.
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Return every slot to the pool.
    pub fn clear(&self) {
        for index in 0..self.num_blocks {
            self.slot(index).store(FREE, Ordering::Release);
        }
    }

    /// Current ownership of slot `index`.
    pub fn slot_state(&self, index: usize) -> Result<SlotState, RingError> {
        self.check_index(index)?;
        let raw = self.slot(index).load(Ordering::Acquire);
        SlotState::from_raw(raw).ok_or(RingError::Corrupted { index, state: raw })
    }

    /// Wait up to `timeout` for slot `index` to be free and take it for writing.
    pub fn wait_free(
        self: &Arc<Self>,
        index: usize,
        timeout: Duration,
    ) -> Result<FreeBlock, RingError> {
        self.wait_transition(index, timeout, FREE, WRITING)?;
        Ok(FreeBlock {
            ring: Arc::clone(self),
            index,
            published: false,
        })
    }

    /// Wait up to `timeout` for slot `index` to be filled and take it for reading.
    pub fn wait_filled(
        self: &Arc<Self>,
        index: usize,
        timeout: Duration,
    ) -> Result<FilledBlock, RingError> {
        self.wait_transition(index, timeout, FILLED, READING)?;
        Ok(FilledBlock {
            ring: Arc::clone(self),
            index,
            released: false,
        })
    }

    fn wait_transition(
        &self,
        index: usize,
        timeout: Duration,
        from: u32,
        to: u32,
    ) -> Result<(), RingError> {
        self.check_index(index)?;
        let slot = self.slot(index);
        let deadline = Instant::now() + timeout;
        loop {
            match slot.compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(()),
                Err(state) if SlotState::from_raw(state).is_none() => {
                    return Err(RingError::Corrupted { index, state });
                }
                Err(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RingError::Timeout);
            }
            thread::sleep(self.poll_interval.min(deadline - now));
        }
    }

    fn check_index(&self, index: usize) -> Result<(), RingError> {
        if index < self.num_blocks {
            Ok(())
        } else {
            Err(RingError::SlotOutOfRange {
                index,
                num_blocks: self.num_blocks,
            })
        }
    }

    #[allow(unsafe_code)]
    fn slot(&self, index: usize) -> &AtomicU32 {
        debug_assert!(index < self.num_blocks);
        // SAFETY: index is in range and each slot word is 4-byte aligned at a
        // 64-byte stride inside the mapping.
        unsafe { &*(self.slots.add(index * SLOT_STRIDE) as *const AtomicU32) }
    }

    #[allow(unsafe_code)]
    fn block_ptr(&self, index: usize) -> *mut Block {
        debug_assert!(index < self.num_blocks);
        // SAFETY: index is in range of the blocks region.
        unsafe { self.blocks.add(index) }
    }

    #[cfg(test)]
    pub(crate) fn poison(&self, index: usize) {
        self.slot(index).store(0xBAD, Ordering::Release);
    }
}

/// A slot owned by the producer.
pub struct FreeBlock {
    ring: Arc<BlockRing>,
    index: usize,
    published: bool,
}

impl FreeBlock {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Mutable access to the block.
    #[allow(unsafe_code)]
    pub fn block_mut(&mut self) -> &mut Block {
        // SAFETY: This guard holds the WRITING state for the slot, so no other
        // party may touch the block until mark_filled.
        unsafe { &mut *self.ring.block_ptr(self.index) }
    }

    /// Publish the block to the consumer.
    pub fn mark_filled(mut self) {
        self.ring.slot(self.index).store(FILLED, Ordering::Release);
        self.published = true;
    }
}

impl Drop for FreeBlock {
    fn drop(&mut self) {
        if !self.published {
            // Abandoned before publishing; nothing visible was produced.
            self.ring.slot(self.index).store(FREE, Ordering::Release);
        }
    }
}

/// A slot owned by the consumer.
pub struct FilledBlock {
    ring: Arc<BlockRing>,
    index: usize,
    released: bool,
}

impl FilledBlock {
    /// Slot index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Read access to the block.
    #[allow(unsafe_code)]
    pub fn block(&self) -> &Block {
        // SAFETY: This guard holds the READING state for the slot.
        unsafe { &*self.ring.block_ptr(self.index) }
    }

    /// Return the slot to the pool.
    pub fn mark_free(mut self) {
        self.ring.slot(self.index).store(FREE, Ordering::Release);
        self.released = true;
    }
}

impl Drop for FilledBlock {
    fn drop(&mut self) {
        if !self.released {
            self.ring.slot(self.index).store(FREE, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(dir: &tempfile::TempDir, n: usize) -> Arc<BlockRing> {
        Arc::new(BlockRing::create(&dir.path().join("ring.buf"), n).unwrap())
    }

    #[test]
    fn create_starts_all_free() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        assert_eq!(rb.num_blocks(), 2);
        assert_eq!(rb.slot_state(0).unwrap(), SlotState::Free);
        assert_eq!(rb.slot_state(1).unwrap(), SlotState::Free);
    }

    #[test]
    fn block_cycles_through_ownership() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        let timeout = Duration::from_millis(10);

        let mut free = rb.wait_free(0, timeout).unwrap();
        assert_eq!(rb.slot_state(0).unwrap(), SlotState::Writing);
        free.block_mut().header = BlockHeader::new(7, 1);
        free.block_mut().payload[3] = 42;
        free.mark_filled();
        assert_eq!(rb.slot_state(0).unwrap(), SlotState::Filled);

        // A filled slot is not free.
        assert!(matches!(rb.wait_free(0, timeout), Err(RingError::Timeout)));

        let filled = rb.wait_filled(0, timeout).unwrap();
        assert_eq!(rb.slot_state(0).unwrap(), SlotState::Reading);
        assert_eq!(filled.block().header.sequence_number, 7);
        assert_eq!(filled.block().payload[3], 42);
        filled.mark_free();
        assert_eq!(rb.slot_state(0).unwrap(), SlotState::Free);
    }

    #[test]
    fn wait_filled_times_out_on_empty_ring() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        let start = Instant::now();
        let result = rb.wait_filled(1, Duration::from_millis(20));
        assert!(matches!(result, Err(RingError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn abandoned_write_returns_slot_to_pool() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        drop(rb.wait_free(1, Duration::from_millis(5)).unwrap());
        assert_eq!(rb.slot_state(1).unwrap(), SlotState::Free);
    }

    #[test]
    fn out_of_range_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        assert!(matches!(
            rb.wait_free(2, Duration::from_millis(1)),
            Err(RingError::SlotOutOfRange { index: 2, num_blocks: 2 })
        ));
    }

    #[test]
    fn corrupted_slot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        rb.poison(0);
        assert!(matches!(
            rb.wait_free(0, Duration::from_millis(1)),
            Err(RingError::Corrupted { index: 0, state: 0xBAD })
        ));
    }

    #[test]
    fn open_attaches_to_existing_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ring.buf");
        let writer = Arc::new(BlockRing::create(&path, 3).unwrap());
        let mut free = writer.wait_free(2, Duration::from_millis(5)).unwrap();
        let header = BlockHeader::new(99, 4).with_scan(1250, 5, 57_000.25);
        free.block_mut().header = header;
        free.mark_filled();

        let reader = Arc::new(BlockRing::open(&path).unwrap());
        assert_eq!(reader.num_blocks(), 3);
        let filled = reader.wait_filled(2, Duration::from_millis(5)).unwrap();
        assert_eq!(filled.block().header, header);
        assert_eq!(filled.block().header.blocks_required, 1250);
        filled.mark_free();
        assert_eq!(writer.slot_state(2).unwrap(), SlotState::Free);
    }

    #[test]
    fn open_rejects_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.buf");
        std::fs::write(&path, vec![0xAB; 4096]).unwrap();
        assert!(matches!(BlockRing::open(&path), Err(RingError::BadMagic { .. })));
    }

    #[test]
    fn clear_frees_every_slot() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        rb.wait_free(0, Duration::from_millis(5)).unwrap().mark_filled();
        rb.clear();
        assert_eq!(rb.slot_state(0).unwrap(), SlotState::Free);
    }

    #[test]
    fn concurrent_producer_consumer_preserve_order() {
        let dir = tempfile::tempdir().unwrap();
        let rb = ring(&dir, 2);
        let timeout = Duration::from_millis(200);
        const COUNT: u64 = 500;

        let producer_ring = Arc::clone(&rb);
        let producer = thread::spawn(move || {
            for seq in 0..COUNT {
                let index = (seq % 2) as usize;
                let mut free = producer_ring.wait_free(index, timeout).unwrap();
                free.block_mut().header = BlockHeader::new(seq, 0);
                free.block_mut().payload = [seq as i32; PAYLOAD_LEN];
                free.mark_filled();
            }
        });

        for seq in 0..COUNT {
            let index = (seq % 2) as usize;
            let filled = rb.wait_filled(index, timeout).unwrap();
            assert_eq!(filled.block().header.sequence_number, seq);
            assert!(filled.block().payload.iter().all(|&v| v == seq as i32));
            filled.mark_free();
        }
        producer.join().unwrap();
    }
}
