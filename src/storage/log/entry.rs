use std::collections::VecDeque;

/// Where an entry lives: the start index of its segment and its data-file offset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryPosition {
    pub segment_start: u64,
    pub offset: u64,
}

/// In-memory window of entry positions, contiguous in index.
#[derive(Debug, Default)]
pub struct OffsetIndex {
    pub(crate) first_index: u64,
    pub(crate) positions: VecDeque<EntryPosition>,
}

impl OffsetIndex {
    pub fn new(first_index: u64) -> Self {
        Self {
            first_index,
            positions: VecDeque::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn next_index(&self) -> u64 {
        self.first_index + self.positions.len() as u64
    }

    pub fn push(&mut self, index: u64, position: EntryPosition) {
        if index != self.next_index() {
            // not contiguous with what we hold, restart the window
            self.positions.clear();
            self.first_index = index;
        }
        self.positions.push_back(position);
    }

    pub fn get(&self, index: u64) -> Option<EntryPosition> {
        if index < self.first_index {
            return None;
        }
        self.positions
            .get((index - self.first_index) as usize)
            .copied()
    }

    /// Drops positions after `index`.
    pub fn truncate_suffix(&mut self, index: u64) {
        if index < self.first_index {
            self.reset(index + 1);
            return;
        }
        let keep = (index - self.first_index + 1) as usize;
        self.positions.truncate(keep);
    }

    /// Drops positions before `index`.
    pub fn truncate_prefix(&mut self, index: u64) {
        while self.first_index < index && !self.positions.is_empty() {
            self.positions.pop_front();
            self.first_index += 1;
        }
        if self.positions.is_empty() && self.first_index < index {
            self.first_index = index;
        }
    }

    /// Keeps at most `window` of the newest positions.
    pub fn trim_to(&mut self, window: usize) {
        while self.positions.len() > window {
            self.positions.pop_front();
            self.first_index += 1;
        }
    }

    pub fn reset(&mut self, first_index: u64) {
        self.positions.clear();
        self.first_index = first_index;
    }
}

/// One half of the double write buffer: records and offsets of consecutive entries that all
/// belong to the segment starting at `segment_start`.
#[derive(Debug, Default)]
pub struct LogBuffer {
    pub(crate) segment_start: u64,
    pub(crate) first_index: u64,
    pub(crate) entries: u64,
    pub(crate) last_term: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) offsets: Vec<u8>,
    /// Seal the segment once this buffer is on disk.
    pub(crate) seal: bool,
}

impl LogBuffer {
    pub fn new(segment_start: u64, first_index: u64) -> Self {
        Self {
            segment_start,
            first_index,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    pub fn last_index(&self) -> Option<u64> {
        (self.entries > 0).then(|| self.first_index + self.entries - 1)
    }

    pub fn next_index(&self) -> u64 {
        self.first_index + self.entries
    }

    pub fn push(&mut self, offset: u64, payload: &[u8], term: u64) {
        self.data
            .extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.data.extend_from_slice(payload);
        self.offsets.extend_from_slice(&offset.to_le_bytes());
        self.entries += 1;
        self.last_term = term;
    }

    /// Empties the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.data.clear();
        self.offsets.clear();
        self.entries = 0;
        self.seal = false;
    }

    pub fn reset(&mut self, segment_start: u64, first_index: u64) {
        self.clear();
        self.segment_start = segment_start;
        self.first_index = first_index;
    }
}
