//! Execution profiling.
//!
//! The engine reports [`ProfileEvent`]s to a caller-supplied sink as it
//! compiles and runs blocks. Use [`Counters`] to aggregate them or
//! [`NullSink`] to discard them.

use serde::Serialize;

/// One observable event in the translate/execute pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileEvent {
    /// A basic block was compiled to native code.
    BlockCompiled {
        /// Guest entry address of the block.
        pc: u64,
        /// Number of guest instructions in the block.
        instructions: u32,
    },
    /// A compiled block was executed.
    BlockExecuted {
        /// Guest entry address of the block.
        pc: u64,
    },
    /// A cache lookup found a usable block.
    CacheHit,
    /// A cache lookup found nothing (or a colliding entry).
    CacheMiss,
    /// A guest load was performed by compiled code.
    MemoryRead,
    /// A guest store was performed by compiled code.
    MemoryWrite,
    /// A conditional branch left its block at the taken target.
    BranchTaken,
    /// A conditional branch fell through.
    BranchNotTaken,
}

/// Receives profile events during compilation and execution.
pub trait ProfileSink {
    /// Record one event.
    fn record(&mut self, event: ProfileEvent);
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProfileSink for NullSink {
    fn record(&mut self, _event: ProfileEvent) {}
}

/// Aggregated event counts.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Counters {
    /// Blocks compiled.
    pub blocks_compiled: u64,
    /// Total guest instructions across compiled blocks.
    pub instructions_compiled: u64,
    /// Blocks executed.
    pub blocks_executed: u64,
    /// Cache hits.
    pub cache_hits: u64,
    /// Cache misses.
    pub cache_misses: u64,
    /// Guest loads.
    pub memory_reads: u64,
    /// Guest stores.
    pub memory_writes: u64,
    /// Conditional branches taken.
    pub branches_taken: u64,
    /// Conditional branches not taken.
    pub branches_not_taken: u64,
}

impl ProfileSink for Counters {
    fn record(&mut self, event: ProfileEvent) {
        match event {
            ProfileEvent::BlockCompiled { instructions, .. } => {
                self.blocks_compiled += 1;
                self.instructions_compiled += u64::from(instructions);
            }
            ProfileEvent::BlockExecuted { .. } => self.blocks_executed += 1,
            ProfileEvent::CacheHit => self.cache_hits += 1,
            ProfileEvent::CacheMiss => self.cache_misses += 1,
            ProfileEvent::MemoryRead => self.memory_reads += 1,
            ProfileEvent::MemoryWrite => self.memory_writes += 1,
            ProfileEvent::BranchTaken => self.branches_taken += 1,
            ProfileEvent::BranchNotTaken => self.branches_not_taken += 1,
        }
    }
}

impl Counters {
    /// Cache hit rate in `[0, 1]`, or 0 with no lookups recorded.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.cache_hits as f64 / total as f64
        }
    }
}
