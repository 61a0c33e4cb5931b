use std::collections::VecDeque;

/// Per-tab scrollback, kept as raw bytes so a replay reproduces exactly what
/// the process emitted. Bounded by bytes and by newline count; the oldest
/// bytes go first.
#[derive(Debug)]
pub struct HistoryBuffer {
    data: VecDeque<u8>,
    max_bytes: usize,
    max_lines: usize,
    line_count: usize,
    dropped_bytes: u64,
}

impl HistoryBuffer {
    pub fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            data: VecDeque::new(),
            max_bytes: max_bytes.max(1),
            max_lines: max_lines.max(1),
            line_count: 0,
            dropped_bytes: 0,
        }
    }

    /// Append `bytes`; returns how many old bytes were evicted to make room.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        self.line_count += count_newlines(bytes.iter());
        self.data.extend(bytes);
        let evicted = self.evict_bytes() + self.evict_lines();
        self.dropped_bytes += evicted as u64;
        evicted as u64
    }

    pub fn snapshot(&self) -> Vec<u8> {
        let (front, back) = self.data.as_slices();
        let mut bytes = Vec::with_capacity(self.data.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);
        bytes
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Total bytes evicted over the buffer's lifetime.
    pub fn dropped_bytes(&self) -> u64 {
        self.dropped_bytes
    }

    fn evict_bytes(&mut self) -> usize {
        let excess = self.data.len().saturating_sub(self.max_bytes);
        if excess == 0 {
            return 0;
        }
        self.line_count -= count_newlines(self.data.range(..excess));
        self.data.drain(..excess);
        excess
    }

    /// Drops whole leading lines until at most `max_lines` newlines remain.
    fn evict_lines(&mut self) -> usize {
        if self.line_count <= self.max_lines {
            return 0;
        }
        let mut surplus = self.line_count - self.max_lines;
        let mut cut = 0;
        for (index, &byte) in self.data.iter().enumerate() {
            if byte == b'\n' {
                surplus -= 1;
                if surplus == 0 {
                    cut = index + 1;
                    break;
                }
            }
        }
        self.line_count = self.max_lines;
        self.data.drain(..cut);
        cut
    }
}

fn count_newlines<'a>(bytes: impl Iterator<Item = &'a u8>) -> usize {
    bytes.filter(|&&byte| byte == b'\n').count()
}
