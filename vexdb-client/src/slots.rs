//! Pipeline slot table.
//!
//! A fixed array of `pipeline_depth` slots multiplexes in-flight requests
//! over one socket. The table doubles as a lock-free map keyed by sequence
//! number: lookup is `seq % depth` followed by an atomic equality check
//! against the slot's published sequence, which makes the late-reply case
//! branch-free and needs no hash map.
//!
//! Admission control is a bounded queue of available sequence numbers,
//! seeded with `0..depth`. Acquisition blocks when the pipeline is
//! saturated; release pushes the slot's next sequence, so each slot walks
//! its own arithmetic progression through the sequence space.

use crate::error::ClientError;
use bytes::Bytes;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{mpsc, Mutex};
use vexdb_protocol::{max_seq, next_seq};

/// A reply routed to a slot: the echoed sequence and the payload bytes.
#[derive(Debug)]
pub(crate) struct ReplyFrame {
    pub seq: u32,
    pub payload: Bytes,
}

/// One pipeline station.
///
/// The reply and timeout channels have capacity 1 and live as long as the
/// slot: a stale signal left behind by a previous occupant is consumed by
/// the next occupant's select loop and discarded there by its sequence
/// check. Senders never block the reader or the ticker indefinitely.
pub(crate) struct Slot {
    seq: AtomicU32,
    deadline: AtomicU32,
    reply_tx: mpsc::Sender<ReplyFrame>,
    pub(crate) reply_rx: Mutex<mpsc::Receiver<ReplyFrame>>,
    timeout_tx: mpsc::Sender<u32>,
    pub(crate) timeout_rx: Mutex<mpsc::Receiver<u32>>,
}

impl Slot {
    fn new(idle: u32) -> Self {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (timeout_tx, timeout_rx) = mpsc::channel(1);
        Self {
            seq: AtomicU32::new(idle),
            deadline: AtomicU32::new(0),
            reply_tx,
            reply_rx: Mutex::new(reply_rx),
            timeout_tx,
            timeout_rx: Mutex::new(timeout_rx),
        }
    }

    /// The sequence currently owning this slot (the idle sentinel if none).
    pub fn seq(&self) -> u32 {
        self.seq.load(Ordering::SeqCst)
    }

    pub fn publish(&self, seq: u32) {
        self.seq.store(seq, Ordering::SeqCst);
    }

    pub fn deadline(&self) -> u32 {
        self.deadline.load(Ordering::SeqCst)
    }

    /// Arms the deadline, in ticker seconds since connect.
    pub fn arm_deadline(&self, at: u32) {
        self.deadline.store(at, Ordering::SeqCst);
    }

    pub fn clear_deadline(&self) {
        self.deadline.store(0, Ordering::SeqCst);
    }

    /// Delivers a reply to the current occupant. Waits for channel space
    /// when a stale frame is still buffered.
    pub async fn deliver(&self, frame: ReplyFrame) {
        // The receiver lives in the slot, so send only fails if the table
        // is being dropped.
        let _ = self.reply_tx.send(frame).await;
    }

    /// Signals a deadline firing. Returns false when the channel is full
    /// (a stale signal is still buffered); the caller retries next tick.
    pub fn fire_timeout(&self, seq: u32) -> bool {
        self.timeout_tx.try_send(seq).is_ok()
    }
}

/// Fixed-size table of pipeline slots plus the available-sequence queue.
pub(crate) struct SlotTable {
    slots: Vec<Slot>,
    free_tx: mpsc::Sender<u32>,
    free_rx: Mutex<mpsc::Receiver<u32>>,
    depth: u32,
    max_seq: u32,
}

impl SlotTable {
    pub fn new(depth: usize) -> Self {
        let depth = depth as u32;
        let max_seq = max_seq(depth);
        let (free_tx, free_rx) = mpsc::channel(depth as usize);
        for seq in 0..depth {
            // The channel is sized to depth, so seeding cannot fail.
            let _ = free_tx.try_send(seq);
        }
        let slots = (0..depth).map(|_| Slot::new(max_seq)).collect();
        Self {
            slots,
            free_tx,
            free_rx: Mutex::new(free_rx),
            depth,
            max_seq,
        }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Upper bound of the sequence space; doubles as the idle sentinel.
    pub fn max_seq(&self) -> u32 {
        self.max_seq
    }

    /// Claims the next available sequence. Blocks while the pipeline is
    /// saturated.
    pub async fn acquire(&self) -> Result<SlotGuard<'_>, ClientError> {
        let seq = self
            .free_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or(ClientError::ConnectionClosed)?;
        Ok(SlotGuard { table: self, seq })
    }

    /// The slot addressed by a sequence number.
    pub fn slot(&self, seq: u32) -> &Slot {
        &self.slots[(seq % self.depth) as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Slot> {
        self.slots.iter()
    }

    fn release(&self, seq: u32) {
        let slot = self.slot(seq);
        slot.publish(self.max_seq);
        slot.clear_deadline();
        // Capacity equals depth and at most depth sequences are out, so the
        // push cannot fail.
        let _ = self.free_tx.try_send(next_seq(seq, self.depth));
    }
}

/// Ownership of one acquired sequence. Dropping the guard resets the slot
/// to idle and returns the successor sequence to the pool, so a canceled
/// caller still reclaims its slot.
pub(crate) struct SlotGuard<'a> {
    table: &'a SlotTable,
    seq: u32,
}

impl SlotGuard<'_> {
    pub fn seq(&self) -> u32 {
        self.seq
    }

    pub fn slot(&self) -> &Slot {
        self.table.slot(self.seq)
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.table.release(self.seq);
    }
}
