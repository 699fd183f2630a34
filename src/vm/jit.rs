//! Dynamic translation engine.
//!
//! Guest code is compiled one basic block at a time into a [`JITModule`]
//! and cached by entry address. Execution runs the compiled block against
//! the register file and address space, then continues at the PC the block
//! returns.

pub mod blocks;
pub mod codegen;

use std::sync::OnceLock;

use cranelift_codegen::isa::OwnedTargetIsa;
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};

use crate::error::{EmuError, EmuResult};
use crate::isa::Opcode;
use crate::profile::{ProfileEvent, ProfileSink};
use crate::vm::memory::AddressSpace;
use crate::vm::registers::RegisterFile;

pub use blocks::{BasicBlock, MAX_BLOCK_SIZE, collect_block};
pub use codegen::BlockCompiler;

/// Number of buckets in the block cache.
pub const CACHE_CAPACITY: usize = 1024;

/// Signature of a compiled block.
type BlockFn = extern "C" fn(*mut u64, *mut AddressSpace) -> u64;

static BACKEND: OnceLock<OwnedTargetIsa> = OnceLock::new();

/// Perform the process-wide, one-time backend setup.
///
/// Builds the native target with speed optimizations and the IR verifier
/// enabled. Calling it again after a successful initialization is a no-op.
/// [`JitEngine::new`] calls this itself, so explicit calls are only needed
/// to surface backend failures early.
///
/// # Errors
///
/// Returns [`EmuError::Backend`] if the host machine is unsupported or the
/// backend rejects its configuration.
pub fn init_backend() -> EmuResult<()> {
    if BACKEND.get().is_some() {
        return Ok(());
    }

    let mut flag_builder = settings::builder();
    flag_builder
        .set("opt_level", "speed")
        .map_err(|e| EmuError::Backend(format!("bad backend flag: {e}")))?;
    flag_builder
        .set("enable_verifier", "true")
        .map_err(|e| EmuError::Backend(format!("bad backend flag: {e}")))?;

    let isa_builder = cranelift_native::builder()
        .map_err(|msg| EmuError::Backend(format!("host machine not supported: {msg}")))?;
    let isa = isa_builder
        .finish(settings::Flags::new(flag_builder))
        .map_err(|e| EmuError::Backend(format!("failed to build target: {e}")))?;

    // A concurrent initializer may have won the race; either value works.
    let _ = BACKEND.set(isa);
    Ok(())
}

/// Host helper called by compiled code for guest loads. Faulting reads
/// yield zero; compiled code has no error path.
unsafe extern "C" fn mem_read64(space: *mut AddressSpace, addr: u64) -> u64 {
    // Safety: compiled blocks only run under `JitEngine::step`, which
    // passes a live, exclusive address space pointer.
    let space = unsafe { &*space };
    space.read_u64(addr).unwrap_or(0)
}

/// Host helper called by compiled code for guest stores. Faulting writes
/// are dropped.
unsafe extern "C" fn mem_write64(space: *mut AddressSpace, addr: u64, value: u64) {
    // Safety: see `mem_read64`.
    let space = unsafe { &mut *space };
    let _ = space.write_u64(addr, value);
}

/// A cached, compiled basic block.
#[derive(Clone, Copy)]
pub struct CompiledBlock {
    entry: u64,
    func: *const u8,
    instruction_count: u32,
    loads: u32,
    stores: u32,
    /// PC of the not-taken successor, for conditional terminators only.
    fallthrough: Option<u64>,
}

impl std::fmt::Debug for CompiledBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledBlock")
            .field("entry", &self.entry)
            .field("instruction_count", &self.instruction_count)
            .field("fallthrough", &self.fallthrough)
            .finish_non_exhaustive()
    }
}

impl CompiledBlock {
    /// Guest entry address.
    #[must_use]
    pub fn entry(&self) -> u64 {
        self.entry
    }

    /// Number of guest instructions covered by the block.
    #[must_use]
    pub fn instruction_count(&self) -> u32 {
        self.instruction_count
    }
}

/// Direct-mapped cache of compiled blocks, indexed by `(pc / 4) % capacity`.
///
/// Insertion overwrites whatever occupies the bucket; lookup verifies the
/// stored entry address so a colliding block reads as a miss rather than as
/// the wrong code.
pub struct BlockCache {
    buckets: Vec<Option<CompiledBlock>>,
}

impl std::fmt::Debug for BlockCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCache")
            .field("capacity", &self.buckets.len())
            .field("occupied", &self.occupied())
            .finish()
    }
}

impl BlockCache {
    /// Create a cache with `capacity` buckets.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        BlockCache {
            buckets: vec![None; capacity.max(1)],
        }
    }

    fn bucket(&self, pc: u64) -> usize {
        #[allow(clippy::cast_possible_truncation)]
        let bucket = ((pc / 4) % self.buckets.len() as u64) as usize;
        bucket
    }

    /// Find the compiled block whose entry is exactly `pc`.
    #[must_use]
    pub fn lookup(&self, pc: u64) -> Option<&CompiledBlock> {
        self.buckets[self.bucket(pc)]
            .as_ref()
            .filter(|block| block.entry == pc)
    }

    /// Insert `block`, evicting any bucket occupant.
    pub fn insert(&mut self, block: CompiledBlock) {
        let bucket = self.bucket(block.entry);
        self.buckets[bucket] = Some(block);
    }

    /// Drop whatever occupies the bucket `pc` maps to.
    pub fn invalidate(&mut self, pc: u64) {
        let bucket = self.bucket(pc);
        self.buckets[bucket] = None;
    }

    /// Drop every cached block.
    pub fn clear(&mut self) {
        self.buckets.fill(None);
    }

    /// Number of occupied buckets.
    #[must_use]
    pub fn occupied(&self) -> usize {
        self.buckets.iter().flatten().count()
    }
}

/// The translation engine: compiler, module, and block cache.
pub struct JitEngine {
    module: JITModule,
    compiler: BlockCompiler,
    cache: BlockCache,
}

impl std::fmt::Debug for JitEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JitEngine")
            .field("compiler", &self.compiler)
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

impl JitEngine {
    /// Create an engine, initializing the backend if needed.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::Backend`] when [`init_backend`] fails.
    pub fn new() -> EmuResult<Self> {
        init_backend()?;
        let isa = BACKEND
            .get()
            .ok_or_else(|| EmuError::Backend("backend not initialized".into()))?
            .clone();

        let mut builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        builder.symbol(codegen::MEM_READ_SYMBOL, mem_read64 as *const u8);
        builder.symbol(codegen::MEM_WRITE_SYMBOL, mem_write64 as *const u8);

        Ok(JitEngine {
            module: JITModule::new(builder),
            compiler: BlockCompiler::new(),
            cache: BlockCache::new(CACHE_CAPACITY),
        })
    }

    /// The block cache.
    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Drop the cached block covering `pc`, forcing recompilation.
    pub fn invalidate(&mut self, pc: u64) {
        self.cache.invalidate(pc);
    }

    /// Return the compiled block at `pc`, compiling it on a cache miss.
    ///
    /// # Errors
    ///
    /// Propagates block collection failures (nothing decodable at `pc`)
    /// and compilation failures.
    pub fn get_or_compile<S: ProfileSink>(
        &mut self,
        pc: u64,
        space: &AddressSpace,
        sink: &mut S,
    ) -> EmuResult<&CompiledBlock> {
        if self.cache.lookup(pc).is_some() {
            sink.record(ProfileEvent::CacheHit);
        } else {
            sink.record(ProfileEvent::CacheMiss);
            let block = collect_block(space, pc)?;
            let func = self.compiler.compile(&block, &mut self.module)?;

            let loads = count_ops(&block, Opcode::Ldr);
            let stores = count_ops(&block, Opcode::Str);
            let terminator_is_branch =
                block.terminator().is_some_and(crate::isa::Instruction::is_branch);
            let fallthrough = (terminator_is_branch && block.can_fall_through())
                .then(|| block.end_pc());

            #[allow(clippy::cast_possible_truncation)]
            let instruction_count = block.len() as u32;
            sink.record(ProfileEvent::BlockCompiled {
                pc,
                instructions: instruction_count,
            });

            self.cache.insert(CompiledBlock {
                entry: pc,
                func,
                instruction_count,
                loads,
                stores,
                fallthrough,
            });
        }

        self.cache
            .lookup(pc)
            .ok_or_else(|| EmuError::Backend("freshly inserted block missing from cache".into()))
    }

    /// Execute the block at the guest PC once and advance the PC.
    ///
    /// Returns the PC the block handed back.
    ///
    /// # Errors
    ///
    /// Propagates [`Self::get_or_compile`] failures.
    pub fn step<S: ProfileSink>(
        &mut self,
        regs: &mut RegisterFile,
        space: &mut AddressSpace,
        sink: &mut S,
    ) -> EmuResult<u64> {
        let pc = regs.pc();
        let block = *self.get_or_compile(pc, space, sink)?;

        // Safety: `func` was produced by `BlockCompiler::compile` with
        // exactly the `BlockFn` signature, and the module holding the code
        // outlives this call.
        let next = unsafe {
            let func = std::mem::transmute::<*const u8, BlockFn>(block.func);
            func(regs.x_mut_ptr(), std::ptr::from_mut(space))
        };
        regs.set_pc(next);

        sink.record(ProfileEvent::BlockExecuted { pc });
        for _ in 0..block.loads {
            sink.record(ProfileEvent::MemoryRead);
        }
        for _ in 0..block.stores {
            sink.record(ProfileEvent::MemoryWrite);
        }
        // Branch events are for conditional terminators only; unconditional
        // branches have no not-taken outcome to compare against.
        if let Some(fallthrough) = block.fallthrough {
            if next == fallthrough {
                sink.record(ProfileEvent::BranchNotTaken);
            } else {
                sink.record(ProfileEvent::BranchTaken);
            }
        }

        Ok(next)
    }

    /// Run block after block until the guest PC reaches zero.
    ///
    /// A zero PC is the halt convention for flat images, whose final
    /// branch jumps to the unmapped null address.
    ///
    /// # Errors
    ///
    /// Propagates the first failure from [`Self::step`].
    pub fn run<S: ProfileSink>(
        &mut self,
        regs: &mut RegisterFile,
        space: &mut AddressSpace,
        sink: &mut S,
    ) -> EmuResult<()> {
        while regs.pc() != 0 {
            self.step(regs, space, sink)?;
        }
        Ok(())
    }
}

fn count_ops(block: &BasicBlock, op: Opcode) -> u32 {
    #[allow(clippy::cast_possible_truncation)]
    let count = block
        .instructions()
        .iter()
        .filter(|inst| inst.op == op)
        .count() as u32;
    count
}
