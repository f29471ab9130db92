//! Per-worker append-only scan result store. Grounded on
//! `src/vertex/scanner/memoryscanner_store.cc`.
//!
//! A record is `{ address: u64, previousValue: [u8; dataSize],
//! firstValue: [u8; firstValueSize] }`; record *i* begins at byte offset
//! `i * recordSize`. The real implementation backs this with a sparse
//! memory-mapped file; this one uses a growing in-memory buffer, which
//! satisfies the same contract (stable base pointer after `finalize`, no
//! reallocation after that point) without requiring filesystem access in
//! tests. `vertex-runtime` may substitute a `memmap2`-backed store behind
//! the same API when persistence across process restarts matters.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone)]
pub struct ScanResultRecord {
    pub address: u64,
    pub previous_value: Vec<u8>,
    pub first_value: Vec<u8>,
}

pub struct WorkerStore {
    data_size: usize,
    first_value_size: usize,
    buffer: RwLock<Vec<u8>>,
    result_count: AtomicUsize,
    finalized: AtomicBool,
}

impl WorkerStore {
    pub fn new(data_size: usize, first_value_size: usize) -> Self {
        Self {
            data_size,
            first_value_size,
            buffer: RwLock::new(Vec::new()),
            result_count: AtomicUsize::new(0),
            finalized: AtomicBool::new(false),
        }
    }

    pub fn record_size(&self) -> usize {
        8 + self.data_size + self.first_value_size
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn first_value_size(&self) -> usize {
        self.first_value_size
    }

    /// Appends one record. Only the owning worker may call this, and only
    /// before `finalize()`.
    pub fn append(&self, address: u64, previous_value: &[u8], first_value: &[u8]) {
        debug_assert_eq!(previous_value.len(), self.data_size);
        debug_assert_eq!(first_value.len(), self.first_value_size);

        let mut buffer = self.buffer.write().unwrap();
        buffer.extend_from_slice(&address.to_le_bytes());
        buffer.extend_from_slice(previous_value);
        buffer.extend_from_slice(first_value);
        self.result_count.fetch_add(1, Ordering::AcqRel);
    }

    /// After this call, the store is readable concurrently by any number
    /// of readers and never reallocates again.
    pub fn finalize(&self) {
        self.finalized.store(true, Ordering::Release);
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    pub fn result_count(&self) -> usize {
        self.result_count.load(Ordering::Acquire)
    }

    pub fn record(&self, index: usize) -> Option<ScanResultRecord> {
        if index >= self.result_count() {
            return None;
        }
        let record_size = self.record_size();
        let buffer = self.buffer.read().unwrap();
        let start = index * record_size;
        let bytes = &buffer[start..start + record_size];

        let address = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let previous_value = bytes[8..8 + self.data_size].to_vec();
        let first_value = bytes[8 + self.data_size..record_size].to_vec();

        Some(ScanResultRecord {
            address,
            previous_value,
            first_value,
        })
    }

    pub fn iter(&self) -> Vec<ScanResultRecord> {
        (0..self.result_count())
            .map(|i| self.record(i).unwrap())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let store = WorkerStore::new(4, 4);
        store.append(0x1004, &0x22000000u32.to_le_bytes(), &0x22000000u32.to_le_bytes());
        store.finalize();

        assert_eq!(store.result_count(), 1);
        let record = store.record(0).unwrap();
        assert_eq!(record.address, 0x1004);
        assert_eq!(record.previous_value, 0x22000000u32.to_le_bytes());
        assert_eq!(record.first_value, 0x22000000u32.to_le_bytes());
    }

    #[test]
    fn record_addressing_matches_record_size_formula() {
        let store = WorkerStore::new(4, 4);
        assert_eq!(store.record_size(), 8 + 4 + 4);
        for i in 0..3u64 {
            store.append(i, &0u32.to_le_bytes(), &0u32.to_le_bytes());
        }
        store.finalize();
        assert_eq!(store.iter().len(), 3);
    }

    #[test]
    fn out_of_range_index_returns_none() {
        let store = WorkerStore::new(4, 4);
        assert!(store.record(0).is_none());
    }
}
