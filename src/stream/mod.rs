use std::collections::VecDeque;

use tokio::time::Instant;

use crate::config::StreamConfig;

/// Emitted when the overflow policy has discarded output since the last warning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverflowWarning {
    /// Bytes dropped since the previous warning
    pub dropped_bytes: usize,
    /// Bytes dropped over the buffer's lifetime
    pub total_dropped_bytes: u64,
}

/// Per-session bounded FIFO of output fragments awaiting the rendering sink.
///
/// Ingest splits chunks to at most `max_chunk_size`; eviction keeps the queue
/// within `max_chunks` fragments and `max_total_bytes` bytes by discarding the
/// oldest data. A flush takes at most `write_batch_size` bytes.
#[derive(Debug)]
pub struct StreamBuffer {
    limits: StreamConfig,
    chunks: VecDeque<Vec<u8>>,
    total_queued_bytes: usize,
    /// Reset every time a warning is emitted
    dropped_bytes: usize,
    total_dropped_bytes: u64,
    flush_scheduled: bool,
    last_warning: Option<Instant>,
}

impl StreamBuffer {
    pub fn new(limits: StreamConfig) -> Self {
        Self {
            limits,
            chunks: VecDeque::new(),
            total_queued_bytes: 0,
            dropped_bytes: 0,
            total_dropped_bytes: 0,
            flush_scheduled: false,
            last_warning: None,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[cfg(test)]
    pub fn total_queued_bytes(&self) -> usize {
        self.total_queued_bytes
    }

    #[cfg(test)]
    pub fn dropped_bytes(&self) -> usize {
        self.dropped_bytes
    }

    pub fn total_dropped_bytes(&self) -> u64 {
        self.total_dropped_bytes
    }

    #[cfg(test)]
    pub fn flush_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    /// Append `data`, evicting oldest fragments past the limits.
    ///
    /// Returns a warning at most once per `overflow_warn_interval` while bytes
    /// have been dropped.
    pub fn enqueue(&mut self, data: &[u8], now: Instant) -> Option<OverflowWarning> {
        for piece in data.chunks(self.limits.max_chunk_size) {
            self.total_queued_bytes += piece.len();
            self.chunks.push_back(piece.to_vec());
        }

        while self.chunks.len() > self.limits.max_chunks
            || self.total_queued_bytes > self.limits.max_total_bytes
        {
            let Some(evicted) = self.chunks.pop_front() else {
                break;
            };
            self.total_queued_bytes -= evicted.len();
            self.dropped_bytes += evicted.len();
            self.total_dropped_bytes += evicted.len() as u64;
        }

        self.take_warning(now)
    }

    fn take_warning(&mut self, now: Instant) -> Option<OverflowWarning> {
        if self.dropped_bytes == 0 {
            return None;
        }
        if let Some(last) = self.last_warning {
            if now.duration_since(last) < self.limits.overflow_warn_interval() {
                return None;
            }
        }

        let warning = OverflowWarning {
            dropped_bytes: self.dropped_bytes,
            total_dropped_bytes: self.total_dropped_bytes,
        };
        self.dropped_bytes = 0;
        self.last_warning = Some(now);
        Some(warning)
    }

    /// Arm a flush for the next tick. Returns false when one is already
    /// pending or there is nothing to deliver.
    pub fn schedule_flush(&mut self) -> bool {
        if self.flush_scheduled || self.chunks.is_empty() {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    /// Run one flush: take up to `write_batch_size` bytes from the front.
    ///
    /// Whole fragments are taken while they fit; the last one is split if only
    /// part of it fits. The flush stays armed while data remains.
    pub fn take_batch(&mut self) -> Option<Vec<u8>> {
        if !self.flush_scheduled {
            return None;
        }

        let limit = self.limits.write_batch_size;
        let mut batch = Vec::with_capacity(limit.min(self.total_queued_bytes));
        while let Some(front) = self.chunks.front_mut() {
            let room = limit - batch.len();
            if room == 0 {
                break;
            }
            if front.len() <= room {
                if let Some(fragment) = self.chunks.pop_front() {
                    batch.extend_from_slice(&fragment);
                }
            } else {
                batch.extend(front.drain(..room));
                break;
            }
        }

        self.total_queued_bytes -= batch.len();
        self.flush_scheduled = !self.chunks.is_empty();

        if batch.is_empty() {
            None
        } else {
            Some(batch)
        }
    }

    #[cfg(test)]
    fn fragment_lengths(&self) -> Vec<usize> {
        self.chunks.iter().map(Vec::len).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn buffer() -> StreamBuffer {
        StreamBuffer::new(StreamConfig::default())
    }

    fn assert_invariants(buf: &StreamBuffer) {
        assert!(buf.len() <= 100);
        assert!(buf.total_queued_bytes() <= 1_048_576);
        assert_eq!(
            buf.total_queued_bytes(),
            buf.fragment_lengths().iter().sum::<usize>()
        );
    }

    #[test]
    fn test_large_chunk_is_split_on_ingest() {
        let mut buf = buffer();
        buf.enqueue(&vec![b'x'; 20 * 1024], Instant::now());
        assert_eq!(buf.fragment_lengths(), vec![16 * 1024, 4 * 1024]);
        assert_invariants(&buf);
    }

    #[test]
    fn test_limits_hold_for_mixed_sizes() {
        let mut buf = buffer();
        let now = Instant::now();
        let mut size = 1usize;
        for i in 0..2_000 {
            // deterministic spread from 1 byte to ~40 KiB
            size = (size * 7919 + i) % (40 * 1024) + 1;
            buf.enqueue(&vec![b'a'; size], now);
            assert_invariants(&buf);
        }
        assert!(buf.total_dropped_bytes() > 0);
    }

    #[test]
    fn test_chunk_count_cap_evicts_oldest() {
        let mut buf = buffer();
        let now = Instant::now();
        for i in 0..150u8 {
            buf.enqueue(&[i], now);
        }
        assert_eq!(buf.len(), 100);
        assert_eq!(buf.total_dropped_bytes(), 50);

        assert!(buf.schedule_flush());
        let batch = buf.take_batch().unwrap();
        assert_eq!(batch[0], 50);
        assert_eq!(*batch.last().unwrap(), 149);
    }

    #[test]
    fn test_flush_is_fifo_and_lossless_without_eviction() {
        let mut buf = buffer();
        let now = Instant::now();
        let mut expected = Vec::new();
        for i in 0..40u32 {
            let chunk: Vec<u8> = (0..(i * 997 % 12_000 + 1)).map(|b| (b % 251) as u8).collect();
            expected.extend_from_slice(&chunk);
            buf.enqueue(&chunk, now);
        }
        assert_eq!(buf.total_dropped_bytes(), 0);

        let mut delivered = Vec::new();
        buf.schedule_flush();
        while let Some(batch) = buf.take_batch() {
            assert!(batch.len() <= 8 * 1024);
            delivered.extend_from_slice(&batch);
        }
        assert_eq!(delivered, expected);
        assert!(buf.is_empty());
        assert!(!buf.flush_scheduled());
        assert_eq!(buf.total_queued_bytes(), 0);
    }

    #[test]
    fn test_batch_splits_final_fragment() {
        let mut buf = buffer();
        let now = Instant::now();
        buf.enqueue(&vec![1u8; 5000], now);
        buf.enqueue(&vec![2u8; 5000], now);
        buf.schedule_flush();

        let first = buf.take_batch().unwrap();
        assert_eq!(first.len(), 8192);
        assert_eq!(buf.fragment_lengths(), vec![1808]);
        assert!(buf.flush_scheduled());

        let second = buf.take_batch().unwrap();
        assert_eq!(second.len(), 1808);
        assert!(!buf.flush_scheduled());
    }

    #[test]
    fn test_schedule_flush_is_noop_when_empty_or_pending() {
        let mut buf = buffer();
        assert!(!buf.schedule_flush());
        buf.enqueue(b"hello", Instant::now());
        assert!(buf.schedule_flush());
        assert!(!buf.schedule_flush());
        assert_eq!(buf.take_batch().unwrap(), b"hello");
        assert!(buf.take_batch().is_none());
    }

    #[test]
    fn test_overflow_warning_is_throttled() {
        let mut buf = buffer();
        let start = Instant::now();
        let burst = vec![b'z'; 4 * 1024];

        let mut warnings = Vec::new();
        for i in 0..512u64 {
            // 512 bursts of 4 KiB spread over 500 ms
            let now = start + Duration::from_millis(i);
            if let Some(w) = buf.enqueue(&burst, now) {
                warnings.push(w);
            }
        }
        assert_eq!(warnings.len(), 1);
        assert!(buf.dropped_bytes() > 0);

        let later = start + Duration::from_millis(1600);
        let second = buf.enqueue(&burst, later).unwrap();
        assert!(second.dropped_bytes > 0);
        assert_eq!(buf.dropped_bytes(), 0);
        assert_eq!(
            second.total_dropped_bytes,
            warnings[0].dropped_bytes as u64 + second.dropped_bytes as u64
        );
    }
}
