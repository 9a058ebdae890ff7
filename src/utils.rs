// src/utils.rs
// Small helpers shared by the listeners and the backfill engine

use crate::registry::FilterState;
use ethers::types::Address;

/// Above this many filter addresses only the count is logged.
pub const MAX_LOGGED_ADDRESSES: usize = 30;

/// Lazily splits `[from_block, to_block]` into inclusive `(start, end)` ranges
/// of at most `chunk_size` blocks. A zero chunk size is treated as one.
pub fn block_chunks(from_block: u64, to_block: u64, chunk_size: u64) -> BlockChunks {
    BlockChunks {
        next: (from_block <= to_block).then_some(from_block),
        to_block,
        chunk_size: chunk_size.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct BlockChunks {
    next: Option<u64>,
    to_block: u64,
    chunk_size: u64,
}

impl BlockChunks {
    /// Number of chunks not yet yielded.
    pub fn remaining(&self) -> u64 {
        match self.next {
            Some(from) => ((self.to_block - from) / self.chunk_size).saturating_add(1),
            None => 0,
        }
    }
}

impl Iterator for BlockChunks {
    type Item = (u64, u64);

    fn next(&mut self) -> Option<Self::Item> {
        let from = self.next?;
        let to = from.saturating_add(self.chunk_size - 1).min(self.to_block);
        self.next = if to < self.to_block { Some(to + 1) } else { None };
        Some((from, to))
    }
}

pub fn format_addresses(addresses: &[Address]) -> String {
    if addresses.len() > MAX_LOGGED_ADDRESSES {
        return format!("{} addresses", addresses.len());
    }
    let list: Vec<String> = addresses.iter().map(|a| format!("{:?}", a)).collect();
    format!("[{}]", list.join(", "))
}

/// One-line description of a filter for startup logs.
pub fn describe_filter(filter: &FilterState) -> String {
    let slots: Vec<String> = filter
        .topics()
        .iter()
        .map(|slot| {
            let hashes: Vec<String> = slot.iter().map(|h| format!("{:?}", h)).collect();
            format!("[{}]", hashes.join(", "))
        })
        .collect();
    format!(
        "addresses: {}, topic slots ({}): [{}]",
        format_addresses(filter.addresses()),
        slots.len(),
        slots.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_cover_range_without_gaps() {
        let chunks: Vec<_> = block_chunks(100, 250, 100).collect();
        assert_eq!(chunks, vec![(100, 199), (200, 250)]);
        assert_eq!(block_chunks(5, 5, 10).collect::<Vec<_>>(), vec![(5, 5)]);
        assert_eq!(block_chunks(10, 5, 10).next(), None);
    }

    #[test]
    fn test_chunks_are_produced_lazily() {
        let mut chunks = block_chunks(0, u64::MAX, 1);
        assert_eq!(chunks.remaining(), u64::MAX);
        assert_eq!(chunks.next(), Some((0, 0)));
        assert_eq!(chunks.next(), Some((1, 1)));
        assert_eq!(chunks.remaining(), u64::MAX - 1);

        let mut chunks = block_chunks(100, 250, 100);
        assert_eq!(chunks.remaining(), 2);
        chunks.next();
        chunks.next();
        assert_eq!(chunks.remaining(), 0);
        assert_eq!(block_chunks(10, 5, 10).remaining(), 0);
    }

    #[test]
    fn test_zero_chunk_size_is_one_block() {
        assert_eq!(
            block_chunks(1, 3, 0).collect::<Vec<_>>(),
            vec![(1, 1), (2, 2), (3, 3)]
        );
    }

    #[test]
    fn test_chunks_stop_at_u64_max() {
        assert_eq!(
            block_chunks(u64::MAX - 1, u64::MAX, 10).collect::<Vec<_>>(),
            vec![(u64::MAX - 1, u64::MAX)]
        );
    }

    #[test]
    fn test_large_address_lists_are_summarised() {
        let few: Vec<Address> = (0..2).map(Address::from_low_u64_be).collect();
        assert!(format_addresses(&few).starts_with("[0x"));

        let many: Vec<Address> = (0..31).map(Address::from_low_u64_be).collect();
        assert_eq!(format_addresses(&many), "31 addresses");
    }
}
