// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use streaming_config::{SequenceData, SequenceNumber, Timestamp, INITIAL_SEQUENCE_NUMBER};

/// Tracks sequence numbers that have been split into multiple chunks and
/// reports a sequence exactly once when all of its chunks have been seen,
/// together with the maximum watermark observed across them.
///
/// Chunk arrival order is arbitrary and multi-threaded. Per sequence the
/// counter is decremented for every non-last chunk and incremented by
/// `chunk_number - 1` for the last chunk, so it reaches zero exactly when
/// all chunks arrived, regardless of interleaving.
///
/// Storage is a list of nodes, each covering `node_size` consecutive
/// sequence numbers. Completed nodes are unlinked once every sequence they
/// cover has been reported; the `Arc` keeps slot addresses valid for updates
/// that still hold a reference.
pub struct ChunkCollector {
    node_size: usize,
    nodes: Mutex<Vec<Arc<Node>>>,
}

struct Node {
    start: u64,
    missing: AtomicUsize,
    slots: Box<[ChunkSlot]>,
}

struct ChunkSlot {
    counter: AtomicI64,
    watermark: AtomicU64,
    seen_last_chunk: AtomicBool,
}

impl Node {
    fn new(start: u64, node_size: usize) -> Self {
        let slots = (0..node_size)
            .map(|_| ChunkSlot {
                counter: AtomicI64::new(0),
                watermark: AtomicU64::new(Timestamp::MIN),
                seen_last_chunk: AtomicBool::new(false),
            })
            .collect();
        Self {
            start,
            missing: AtomicUsize::new(node_size),
            slots,
        }
    }
}

impl ChunkCollector {
    pub fn new(node_size: usize) -> Self {
        assert!(node_size > 0, "node size must be greater than 0");
        Self {
            node_size,
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Collects one chunk. Returns the sequence number and its final
    /// watermark when this chunk completed the sequence.
    pub fn collect(
        &self,
        sequence_data: SequenceData,
        watermark: Timestamp,
    ) -> Option<(SequenceNumber, Timestamp)> {
        debug_assert!(
            sequence_data.sequence_number >= INITIAL_SEQUENCE_NUMBER,
            "invalid sequence number"
        );
        debug_assert!(sequence_data.chunk_number >= 1, "invalid chunk number");
        let sequence = sequence_data.sequence_number - INITIAL_SEQUENCE_NUMBER;

        let node = self.find_or_insert_node(sequence);
        let slot = &node.slots[(sequence % self.node_size as u64) as usize];

        slot.watermark.fetch_max(watermark, Ordering::AcqRel);

        // The last chunk must be observed at most once per sequence.
        if sequence_data.last_chunk {
            debug_assert!(
                !slot.seen_last_chunk.swap(true, Ordering::AcqRel),
                "last chunk seen twice for sequence {}",
                sequence_data.sequence_number
            );
        }

        let chunk_index = (sequence_data.chunk_number - 1) as i64;
        let updated = if sequence_data.last_chunk {
            slot.counter.fetch_add(chunk_index, Ordering::AcqRel) + chunk_index
        } else {
            slot.counter.fetch_sub(1, Ordering::AcqRel) - 1
        };

        if updated == 0 {
            let final_watermark = slot.watermark.load(Ordering::Acquire);
            if node.missing.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.nodes.lock().retain(|n| n.start != node.start);
            }
            return Some((sequence_data.sequence_number, final_watermark));
        }
        None
    }

    fn find_or_insert_node(&self, sequence: u64) -> Arc<Node> {
        let node_size = self.node_size as u64;
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes
            .iter()
            .find(|n| n.start <= sequence && sequence < n.start + node_size)
        {
            return node.clone();
        }
        let node = Arc::new(Node::new((sequence / node_size) * node_size, self.node_size));
        nodes.push(node.clone());
        node
    }

    #[cfg(test)]
    fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }
}
