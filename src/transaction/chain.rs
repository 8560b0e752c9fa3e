//! FAT chain splice
//!
//! A transaction that replaces part of a cluster chain records the splice
//! in the log's chain section before touching the FAT. The FAT writes that
//! follow, up to [`TransactionLog::end_undo_phase`], go straight to the FAT.
//! Whichever side loses is then freed by [`TransactionLog::cleanup_fat_chain`]:
//!
//! ```text
//!                  insertion_front      insertion_back
//!                        │                    ▲
//!   before:  ... ──▶ [front] ──▶ original ──▶ ... ──▶ [back] ──▶ ...
//!   after:   ... ──▶ [front] ──▶ new ──────▶ ... ──────┘
//! ```
//!
//! Cleanup runs in sessions. Each session caches up to
//! `cleanup_cache_size / 4` clusters, stores where the next session starts
//! in `next_deletion`, writes log sector 0, and only then frees the cached
//! clusters tail first. An interrupted session leaves its head linked, so
//! the next attempt walks the same clusters again. A walk never frees the
//! log file's own clusters.

use tracing::{debug, warn};

use crate::error::{FatWalError, Result};
use crate::log::{CHAIN_BITMAP_USED, CHAIN_VALID};
use crate::volume::{Volume, FREE_CLUSTER};

use super::file::WriteScope;
use super::{TransactionLog, TransactionState};

/// Which side of the splice to free
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupMode {
    /// Undo: free the new chain from `head_new`
    Recover,
    /// Commit: free the displaced chain from `head_original`
    Cleanup,
}

impl TransactionLog {
    /// Record the pending splice, put it on media and enter the undo phase
    pub fn set_fat_chain<V: Volume>(
        &mut self,
        volume: &mut V,
        use_bitmap: bool,
        insertion_front: u32,
        new_head: u32,
        original_head: u32,
        insertion_back: u32,
    ) -> Result<()> {
        self.require_open()?;

        let chain = self.buffer.chain_mut();
        chain.insertion_front = insertion_front;
        chain.head_new = new_head;
        chain.head_original = original_head;
        chain.insertion_back = insertion_back;
        chain.next_deletion = FREE_CLUSTER;
        chain.flags = CHAIN_VALID;
        if use_bitmap {
            chain.flags |= CHAIN_BITMAP_USED;
        }
        self.buffer.seal_chain()?;
        self.state = TransactionState::SetFatChain;

        debug!(
            insertion_front,
            new_head, original_head, insertion_back, use_bitmap, "FAT chain recorded"
        );

        self.write_log_file(volume, WriteScope::Sector0)
    }

    /// Undo the pending splice, if any
    ///
    /// Frees the new chain, then links `insertion_front` back to the
    /// original head. A free front means the new chain was the file's
    /// first allocation and there is nothing to relink.
    pub fn recover<V: Volume>(&mut self, volume: &mut V) -> Result<()> {
        if !self.buffer.chain().is_valid() {
            return Ok(());
        }

        self.cleanup_fat_chain(volume, CleanupMode::Recover)?;

        let chain = *self.buffer.chain();
        if volume.geometry().is_chain_cluster(chain.insertion_front) {
            self.fat_cache.write(volume, chain.insertion_front, chain.head_original)?;
        }

        self.fat_cache.flush(volume)?;
        if volume.geometry().fat_type.is_exfat() {
            volume.bitmap_flush()?;
        }

        debug!(
            insertion_front = chain.insertion_front,
            head_original = chain.head_original,
            "Pending splice undone"
        );
        Ok(())
    }

    /// Free one side of the splice, from its head up to `insertion_back`
    ///
    /// Safe to call again after an interruption at any point.
    pub fn cleanup_fat_chain<V: Volume>(&mut self, volume: &mut V, mode: CleanupMode) -> Result<()> {
        let geometry = volume.geometry().clone();
        let chain = *self.buffer.chain();

        let mut head = match mode {
            CleanupMode::Recover => chain.head_new,
            CleanupMode::Cleanup => chain.head_original,
        };
        let tail = chain.insertion_back;

        if !geometry.is_chain_cluster(head) || head == tail {
            return Ok(());
        }

        if chain.bitmap_used() {
            return self.release_bitmap_range(volume, head, tail);
        }

        let capacity = self.config.cleanup_session_clusters();
        let mut cache: Vec<u32> = Vec::with_capacity(capacity);
        let mut walked: u64 = 0;
        let mut sessions = 0u32;

        loop {
            cache.clear();
            let next_session = self.collect_session(volume, head, tail, &mut cache)?;

            walked += cache.len() as u64;
            if walked > geometry.total_clusters as u64 {
                return Err(FatWalError::FileCorrupt(format!(
                    "chain from {} loops or exceeds the volume",
                    head
                )));
            }

            // Persist the resume point before freeing anything
            {
                let chain = self.buffer.chain_mut();
                chain.next_deletion = next_session;
                match mode {
                    CleanupMode::Recover => chain.head_new = head,
                    CleanupMode::Cleanup => chain.head_original = head,
                }
            }
            self.buffer.seal_chain()?;
            self.write_log_file(volume, WriteScope::Sector0)?;

            if geometry.fat_type.is_exfat() && !cache.is_empty() {
                for &cluster in &cache {
                    volume.cluster_state_set(cluster, false)?;
                }
                volume.bitmap_flush()?;
            }

            for &cluster in cache.iter().rev() {
                self.fat_cache.write(volume, cluster, FREE_CLUSTER)?;
            }
            self.fat_cache.flush(volume)?;

            sessions += 1;
            debug!(
                ?mode,
                session = sessions,
                head,
                freed = cache.len(),
                next_session,
                "Cleanup session done"
            );

            if !geometry.is_chain_cluster(next_session) || next_session == tail || next_session == head {
                break;
            }
            head = next_session;
        }

        Ok(())
    }

    /// Walk one session's worth of clusters from `head` into `cache`
    ///
    /// Returns the first cluster of the next session, `tail` when the chain
    /// ends or runs into the log file, or free when the walk ran into an
    /// unlinked entry.
    fn collect_session<V: Volume>(&self, volume: &mut V, head: u32, tail: u32, cache: &mut Vec<u32>) -> Result<u32> {
        let geometry = volume.geometry().clone();
        let capacity = self.config.cleanup_session_clusters();

        // A stored cursor means this session was cut short before; stop where it stopped
        let known_end = self.buffer.chain().next_deletion;
        let resuming = known_end != head
            && (geometry.is_chain_cluster(known_end) || (known_end == tail && known_end != FREE_CLUSTER));

        let mut current = head;
        loop {
            if self.is_log_cluster(current) {
                warn!(cluster = current, head, "Chain runs into the log file, stopping there");
                return Ok(tail);
            }

            let next = volume.read_fat_entry(current)?;
            if next == FREE_CLUSTER {
                return Ok(if resuming { known_end } else { FREE_CLUSTER });
            }

            cache.push(current);
            let splits = geometry.fat_entry_splits(current);

            // A split entry may be torn on media; never follow it past a stored cursor
            if resuming && (next == known_end || splits) {
                return Ok(known_end);
            }

            if next == tail || !geometry.is_chain_cluster(next) {
                return Ok(tail);
            }

            if splits || cache.len() >= capacity {
                return Ok(next);
            }

            current = next;
        }
    }

    /// Clear the bitmap bits of a contiguous range `[head, back)`
    fn release_bitmap_range<V: Volume>(&mut self, volume: &mut V, head: u32, back: u32) -> Result<()> {
        if back <= head || back > volume.geometry().cluster_limit() {
            return Err(FatWalError::FileCorrupt(format!(
                "bitmap range [{}, {}) outside the volume",
                head, back
            )));
        }

        for cluster in (head..back).filter(|&cluster| !self.is_log_cluster(cluster)) {
            volume.cluster_state_set(cluster, false)?;
        }
        volume.bitmap_flush()?;

        debug!(head, back, "Bitmap range released");
        Ok(())
    }
}
