// scan.rs — Recursive multi-level block scan (inclusive prefix sum).
//
// REDUCTION (fine → coarse)
// ─────────────────────────
// Level 0 scans the padded input block by block into `combined`, writing
// each block's total into a smaller `aux` buffer. `aux` is itself padded to
// a whole number of blocks and becomes the next level, scanned in place.
// The loop ends after the level that fits in a single block:
//
//   level 0   [■■■■|■■■■|■■■■|■■■■|■■■■]  size 20 → aux 5 (padded to 8)
//   level 1   [■■■■|■■··]                 size 8  → aux 2 (padded to 4)
//   level 2   [■■··]                      size 4  → single block, stop
//
// Every level pushes a BlockSumTask {combined, aux, size} on a LIFO stack.
//
// PROPAGATION (coarse → fine)
// ───────────────────────────
// Tasks are popped coarsest first. When a task is popped, its `aux` holds
// the inclusive scan of its block totals (it is the `combined` buffer of
// the task popped just before it). Adding aux[g - 1] to every element of
// block g > 0 turns the block-local scan into the global one. The coarsest
// task spans a single block and is already complete.
//
// BUFFER LIFETIME
// ───────────────
// A level's `aux` buffer is shared between its own task and the next
// level's task (as `combined`). Both hold an `Rc`; the buffer is released
// once the last task referencing it is consumed. After the pass only the
// level-0 result is alive.

use std::rc::Rc;

use tracing::debug;

use crate::config::EngineConfig;
use crate::device::{Access, Device, Extent, KernelArgs, Launch};
use crate::error::{ConfigError, Result};
use crate::host::Host;
use crate::layout::{align, next_level_size, pad_to_block, scan_depth};

/// One recursion level whose block totals still need to be added back.
pub struct BlockSumTask<B> {
    /// Block-local scan of this level, finished in place by the add-back.
    pub combined: Rc<B>,
    /// Inclusive scan of this level's block totals (once coarser levels are done).
    pub aux: Rc<B>,
    /// Element count of this level, a multiple of the block size.
    pub size: usize,
}

/// Pending propagation tasks. The top of the stack is the coarsest level.
pub struct PropagationStack<B> {
    tasks: Vec<BlockSumTask<B>>,
}

impl<B> Default for PropagationStack<B> {
    fn default() -> Self {
        PropagationStack { tasks: Vec::new() }
    }
}

impl<B> PropagationStack<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: BlockSumTask<B>) {
        self.tasks.push(task);
    }

    pub fn pop(&mut self) -> Option<BlockSumTask<B>> {
        self.tasks.pop()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// State after the reduction pass: every level scanned block-locally.
pub struct Reduction<B> {
    pub stack: PropagationStack<B>,
    /// Level-0 output; holds the full scan once the stack is drained.
    pub result: Rc<B>,
    /// Logical element count.
    pub len: usize,
    /// Level-0 element count, `len` rounded up to a whole block.
    pub aligned_len: usize,
}

/// Result of a complete scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// Inclusive prefix sums, truncated to the logical length.
    pub values: Vec<f32>,
    /// Recursion levels, equal to the propagation stack depth.
    pub levels: usize,
    pub aligned_len: usize,
}

/// Scan engine with a fixed block size.
#[derive(Debug, Clone, Copy)]
pub struct ScanEngine {
    block: usize,
}

impl ScanEngine {
    /// # Errors
    /// `ConfigError::InvalidBlockSize` if `block < 2`, which would never
    /// shrink a level.
    pub fn new(block: usize) -> std::result::Result<Self, ConfigError> {
        if block < 2 {
            return Err(ConfigError::InvalidBlockSize(block));
        }
        Ok(ScanEngine { block })
    }

    pub fn from_config(config: &EngineConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(config.scan_block_size)
    }

    pub fn block_size(&self) -> usize {
        self.block
    }

    /// Inclusive prefix sum of `values` on the host's device.
    pub fn run<D: Device>(&self, host: &mut Host<'_, D>, values: &[f32]) -> Result<ScanOutcome> {
        let Some(mut reduction) = self.reduce(host, values)? else {
            return Ok(ScanOutcome { values: Vec::new(), levels: 0, aligned_len: 0 });
        };
        let levels = reduction.stack.len();
        self.propagate(host, &mut reduction.stack)?;
        debug_assert!(reduction.stack.is_empty());

        let mut scanned = host.download(&reduction.result)?;
        scanned.truncate(reduction.len);
        Ok(ScanOutcome {
            values: scanned,
            levels,
            aligned_len: reduction.aligned_len,
        })
    }

    /// Upload `values` and run the block-local scan at every level.
    ///
    /// Returns `None` for an empty input; nothing is allocated or dispatched.
    pub fn reduce<D: Device>(
        &self,
        host: &mut Host<'_, D>,
        values: &[f32],
    ) -> Result<Option<Reduction<D::Buffer>>> {
        if values.is_empty() {
            return Ok(None);
        }
        let bs = self.block;
        let aligned_len = align(values.len(), bs);
        let depth = scan_depth(aligned_len, bs);

        let input = host.upload(&pad_to_block(values, bs), Access::ReadOnly)?;
        let result = Rc::new(host.allocate(aligned_len, Access::ReadWrite)?);

        let mut stack = PropagationStack::new();
        let mut level = Rc::clone(&result);
        let mut size = aligned_len;
        loop {
            assert!(size > 0 && size % bs == 0, "level size {size} is not a whole number of blocks");
            assert!(stack.len() < depth, "scan recursion did not shrink below {size} elements");

            let aux = Rc::new(host.allocate(next_level_size(size, bs), Access::ReadWrite)?);
            let args = if stack.is_empty() {
                KernelArgs::BlockScan { input: &input, output: &*level, aux: &*aux }
            } else {
                KernelArgs::BlockScanInPlace { data: &*level, aux: &*aux }
            };
            host.run(Launch {
                args,
                global: Extent::linear(size),
                group: Extent::linear(bs),
                scratch: vec![bs],
            })?;
            debug!(level = stack.len(), size, "block-local scan");

            stack.push(BlockSumTask { combined: level, aux: Rc::clone(&aux), size });
            if size <= bs {
                break;
            }
            size = next_level_size(size, bs);
            level = aux;
        }
        assert_eq!(stack.len(), depth, "recursion depth disagrees with scan_depth");

        Ok(Some(Reduction { stack, result, len: values.len(), aligned_len }))
    }

    /// Drain `stack`, adding each level's scanned block totals back into it.
    pub fn propagate<D: Device>(
        &self,
        host: &mut Host<'_, D>,
        stack: &mut PropagationStack<D::Buffer>,
    ) -> Result<()> {
        while let Some(task) = stack.pop() {
            if task.size <= self.block {
                continue;
            }
            host.run(Launch {
                args: KernelArgs::AddBlockSums { aux: &*task.aux, output: &*task.combined },
                global: Extent::linear(task.size),
                group: Extent::linear(self.block),
                scratch: Vec::new(),
            })?;
            debug!(remaining = stack.len(), size = task.size, "block sums added");
        }
        Ok(())
    }
}
