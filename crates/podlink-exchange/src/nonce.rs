//! Deterministic nonce generator shared with the pod.
//!
//! Both ends derive the same 32-bit sequence from the pod's lot and TID plus
//! a 16-bit seed. When the pod reports a desync it sends a sync word; both
//! ends then fold it into a new seed and restart the sequence.

use podlink_frame::crc16_table;
use serde::{Deserialize, Serialize};

/// Two mixing words followed by sixteen buffered values.
pub const NONCE_TABLE_LEN: usize = 18;

const FIRST_BUFFERED: usize = 2;

/// Serializable snapshot of a [`Nonce`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceState {
    pub lot: u32,
    pub tid: u32,
    pub seed: u16,
    pub table: Vec<u32>,
    pub pointer: u8,
    pub last: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nonce {
    lot: u32,
    tid: u32,
    seed: u16,
    table: [u32; NONCE_TABLE_LEN],
    pointer: usize,
    last: Option<u32>,
}

impl Nonce {
    pub fn new(lot: u32, tid: u32) -> Self {
        Self::with_seed(lot, tid, 0)
    }

    pub fn with_seed(lot: u32, tid: u32, seed: u16) -> Self {
        let mut nonce = Self {
            lot,
            tid,
            seed,
            table: [0; NONCE_TABLE_LEN],
            pointer: FIRST_BUFFERED,
            last: None,
        };
        nonce.initialize();
        nonce
    }

    fn initialize(&mut self) {
        self.table = [0; NONCE_TABLE_LEN];
        self.table[0] = (self.lot & 0xffff)
            .wrapping_add(0x5554_3dc3)
            .wrapping_add(self.lot >> 16)
            .wrapping_add(u32::from(self.seed & 0xff));
        self.table[1] = (self.tid & 0xffff)
            .wrapping_add(0xaaaa_e44e)
            .wrapping_add(self.tid >> 16)
            .wrapping_add(u32::from(self.seed >> 8));
        for i in FIRST_BUFFERED..NONCE_TABLE_LEN {
            self.table[i] = self.generate();
        }
        self.pointer = (self.table[0].wrapping_add(self.table[1]) & 0xf) as usize + FIRST_BUFFERED;
        self.last = None;
    }

    fn generate(&mut self) -> u32 {
        self.table[0] = (self.table[0] >> 16).wrapping_add((self.table[0] & 0xffff).wrapping_mul(0x5d7f));
        self.table[1] = (self.table[1] >> 16).wrapping_add((self.table[1] & 0xffff).wrapping_mul(0x8ca0));
        self.table[1].wrapping_add(self.table[0] << 16)
    }

    /// Next nonce in the sequence.
    pub fn next(&mut self) -> u32 {
        let nonce = self.table[self.pointer];
        self.table[self.pointer] = self.generate();
        self.pointer = (nonce & 0xf) as usize + FIRST_BUFFERED;
        self.last = Some(nonce);
        nonce
    }

    /// Reseed from the sync word the pod sent in reply to the request with
    /// message sequence `message_sequence`.
    ///
    /// The new seed mixes the last issued nonce, so this must be called before
    /// any further [`next`](Self::next).
    pub fn sync(&mut self, sync_word: u16, message_sequence: u8) {
        let word = (self.last.unwrap_or(0) & 0xffff)
            .wrapping_add(u32::from(crc16_table()[usize::from(message_sequence)]))
            .wrapping_add(self.lot & 0xffff)
            .wrapping_add(self.tid & 0xffff);
        self.seed = (word & 0xffff) as u16 ^ sync_word;
        tracing::debug!(
            target: "podlink::exchange",
            seed = format_args!("{:04x}", self.seed),
            message_sequence,
            "nonce resynchronized"
        );
        self.initialize();
    }

    pub fn lot(&self) -> u32 {
        self.lot
    }

    pub fn tid(&self) -> u32 {
        self.tid
    }

    pub fn seed(&self) -> u16 {
        self.seed
    }

    /// Most recently issued nonce since the last (re)seed.
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    pub fn state(&self) -> NonceState {
        NonceState {
            lot: self.lot,
            tid: self.tid,
            seed: self.seed,
            table: self.table.to_vec(),
            pointer: self.pointer as u8,
            last: self.last,
        }
    }

    /// Rebuild a generator from a snapshot. Returns `None` when the snapshot
    /// is malformed.
    pub fn restore(state: &NonceState) -> Option<Self> {
        let table: [u32; NONCE_TABLE_LEN] = state.table.as_slice().try_into().ok()?;
        let pointer = usize::from(state.pointer);
        if !(FIRST_BUFFERED..NONCE_TABLE_LEN).contains(&pointer) {
            return None;
        }
        Some(Self {
            lot: state.lot,
            tid: state.tid,
            seed: state.seed,
            table,
            pointer,
            last: state.last,
        })
    }
}
