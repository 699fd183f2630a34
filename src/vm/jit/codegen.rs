//! Cranelift code generation for guest basic blocks.
//!
//! Each block compiles to a native function with the signature
//! `fn(regs: *mut u64, space: *mut AddressSpace) -> u64`, returning the
//! guest PC to continue at. Guest registers live in the flat `u64` array
//! behind `regs`; the compiled body keeps touched registers in SSA
//! variables and flushes the dirty ones back before returning. Loads and
//! stores go through host helper functions resolved by name at link time.

#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_possible_truncation)]

use cranelift_codegen::Context;
use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{
    AbiParam, FuncRef, Function, InstBuilder, MemFlags, Signature, UserFuncName, Value, types,
};
use cranelift_codegen::isa::CallConv;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext, Variable};
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module};

use super::blocks::BasicBlock;
use crate::error::{EmuError, EmuResult};
use crate::isa::{Cond, InstrKind, Instruction, Opcode, Operand};
use crate::vm::registers::{NUM_REGS, REG_NZCV};

/// Import name of the host load helper.
pub const MEM_READ_SYMBOL: &str = "lyra_mem_read64";
/// Import name of the host store helper.
pub const MEM_WRITE_SYMBOL: &str = "lyra_mem_write64";

/// Link register index written by branch-with-link.
const REG_LINK: u8 = 30;

/// Compiles basic blocks to native code, reusing Cranelift contexts
/// across compilations.
pub struct BlockCompiler {
    builder_ctx: FunctionBuilderContext,
    ctx: Context,
    func_counter: u64,
}

impl std::fmt::Debug for BlockCompiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCompiler")
            .field("func_counter", &self.func_counter)
            .finish()
    }
}

impl BlockCompiler {
    /// Create a new compiler.
    #[must_use]
    pub fn new() -> Self {
        BlockCompiler {
            builder_ctx: FunctionBuilderContext::new(),
            ctx: Context::new(),
            func_counter: 0,
        }
    }

    /// Compile `block` into `module`, returning the finalized function
    /// pointer.
    ///
    /// # Errors
    ///
    /// Returns [`EmuError::CompileFailed`] when the block contains an
    /// instruction outside the supported subset, and [`EmuError::Backend`]
    /// for declaration or definition failures inside Cranelift.
    pub fn compile(
        &mut self,
        block: &BasicBlock,
        module: &mut JITModule,
    ) -> EmuResult<*const u8> {
        let ptr_type = module.target_config().pointer_type();

        let mut sig = Signature::new(CallConv::SystemV);
        sig.params.push(AbiParam::new(ptr_type)); // register array
        sig.params.push(AbiParam::new(ptr_type)); // address space
        sig.returns.push(AbiParam::new(types::I64)); // next guest PC

        let func_name = format!("block_{:012x}_{}", block.entry(), self.func_counter);
        self.func_counter += 1;

        let func_id = module
            .declare_function(&func_name, Linkage::Local, &sig)
            .map_err(|e| EmuError::Backend(format!("failed to declare function: {e}")))?;

        let mut read_sig = Signature::new(CallConv::SystemV);
        read_sig.params.push(AbiParam::new(ptr_type));
        read_sig.params.push(AbiParam::new(types::I64));
        read_sig.returns.push(AbiParam::new(types::I64));
        let read_id = module
            .declare_function(MEM_READ_SYMBOL, Linkage::Import, &read_sig)
            .map_err(|e| EmuError::Backend(format!("failed to declare import: {e}")))?;

        let mut write_sig = Signature::new(CallConv::SystemV);
        write_sig.params.push(AbiParam::new(ptr_type));
        write_sig.params.push(AbiParam::new(types::I64));
        write_sig.params.push(AbiParam::new(types::I64));
        let write_id = module
            .declare_function(MEM_WRITE_SYMBOL, Linkage::Import, &write_sig)
            .map_err(|e| EmuError::Backend(format!("failed to declare import: {e}")))?;

        self.ctx.func = Function::with_name_signature(UserFuncName::user(0, func_id.as_u32()), sig);

        {
            let read_fn = module.declare_func_in_func(read_id, &mut self.ctx.func);
            let write_fn = module.declare_func_in_func(write_id, &mut self.ctx.func);
            let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
            emit_block_body(&mut builder, block, read_fn, write_fn)?;
            builder.finalize();
        }

        module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| EmuError::Backend(format!("failed to define function: {e}")))?;
        module.clear_context(&mut self.ctx);
        module
            .finalize_definitions()
            .map_err(|e| EmuError::Backend(format!("failed to finalize: {e}")))?;

        Ok(module.get_finalized_function(func_id))
    }
}

impl Default for BlockCompiler {
    fn default() -> Self {
        Self::new()
    }
}

fn emit_block_body(
    builder: &mut FunctionBuilder,
    block: &BasicBlock,
    read_fn: FuncRef,
    write_fn: FuncRef,
) -> EmuResult<()> {
    let entry_block = builder.create_block();
    builder.append_block_params_for_function_params(entry_block);
    builder.switch_to_block(entry_block);
    builder.seal_block(entry_block);

    let regs_ptr = builder.block_params(entry_block)[0];
    let mem_ptr = builder.block_params(entry_block)[1];

    let mut emitter = BlockEmitter {
        builder,
        regs_ptr,
        mem_ptr,
        read_fn,
        write_fn,
        reg_vars: [None; NUM_REGS],
        reg_dirty: [false; NUM_REGS],
        flags: None,
        flags_dirty: false,
        next_var: 0,
    };

    let mut exit = None;
    for (i, inst) in block.instructions().iter().enumerate() {
        let pc = block.entry().wrapping_add(4 * i as u64);
        if inst.is_branch() {
            exit = Some(emitter.emit_branch_exit(inst, pc)?);
            break;
        }
        emitter.emit_instruction(inst, pc)?;
    }

    let exit = match exit {
        Some(value) => value,
        None => {
            // Straight-line block: continue at the next sequential PC.
            emitter.flush();
            let end = block.end_pc();
            emitter.builder.ins().iconst(types::I64, end as i64)
        }
    };
    emitter.builder.ins().return_(&[exit]);
    Ok(())
}

/// Lazily materialized condition flags, one 0/1 value per flag.
#[derive(Clone, Copy)]
struct FlagVars {
    n: Variable,
    z: Variable,
    c: Variable,
    v: Variable,
}

/// Per-block emission state.
///
/// Registers are promoted to Cranelift variables on first touch: reads
/// load the slot once, writes only define the variable and mark it dirty.
/// `flush` stores every dirty register and the repacked flag word back to
/// the register array.
struct BlockEmitter<'a, 'b> {
    builder: &'a mut FunctionBuilder<'b>,
    regs_ptr: Value,
    mem_ptr: Value,
    read_fn: FuncRef,
    write_fn: FuncRef,
    reg_vars: [Option<Variable>; NUM_REGS],
    reg_dirty: [bool; NUM_REGS],
    flags: Option<FlagVars>,
    flags_dirty: bool,
    next_var: u32,
}

fn fail(pc: u64, reason: impl Into<String>) -> EmuError {
    EmuError::CompileFailed {
        pc,
        reason: reason.into(),
    }
}

impl BlockEmitter<'_, '_> {
    fn alloc_var(&mut self, ty: types::Type) -> Variable {
        let var = Variable::from_u32(self.next_var);
        self.next_var += 1;
        self.builder.declare_var(var, ty);
        var
    }

    fn reg_var(&mut self, index: u8) -> Variable {
        let slot = index as usize;
        if let Some(var) = self.reg_vars[slot] {
            return var;
        }
        let var = self.alloc_var(types::I64);
        let offset = slot as i32 * 8;
        let value =
            self.builder
                .ins()
                .load(types::I64, MemFlags::trusted(), self.regs_ptr, offset);
        self.builder.def_var(var, value);
        self.reg_vars[slot] = Some(var);
        var
    }

    fn read_reg(&mut self, index: u8) -> Value {
        let var = self.reg_var(index);
        self.builder.use_var(var)
    }

    fn write_reg(&mut self, index: u8, value: Value) {
        let var = self.reg_var(index);
        self.builder.def_var(var, value);
        self.reg_dirty[index as usize] = true;
    }

    /// Unpack NZCV from its register slot on first touch.
    fn flag_vars(&mut self) -> FlagVars {
        if let Some(flags) = self.flags {
            return flags;
        }
        let word = {
            let offset = REG_NZCV as i32 * 8;
            self.builder
                .ins()
                .load(types::I64, MemFlags::trusted(), self.regs_ptr, offset)
        };
        let flags = FlagVars {
            n: self.alloc_var(types::I64),
            z: self.alloc_var(types::I64),
            c: self.alloc_var(types::I64),
            v: self.alloc_var(types::I64),
        };
        for (var, bit) in [(flags.n, 31), (flags.z, 30), (flags.c, 29), (flags.v, 28)] {
            let shifted = self.builder.ins().ushr_imm(word, bit);
            let value = self.builder.ins().band_imm(shifted, 1);
            self.builder.def_var(var, value);
        }
        self.flags = Some(flags);
        flags
    }

    fn flag_value(&mut self, var: Variable) -> Value {
        self.builder.use_var(var)
    }

    fn flag_complement(&mut self, var: Variable) -> Value {
        let value = self.builder.use_var(var);
        self.builder.ins().bxor_imm(value, 1)
    }

    /// Recompute N and Z from `result`. `clear_cv` additionally forces
    /// carry and overflow to zero, as the simplified arithmetic flag
    /// model defines.
    fn set_result_flags(&mut self, result: Value, clear_cv: bool) {
        let flags = self.flag_vars();

        let negative = self
            .builder
            .ins()
            .icmp_imm(IntCC::SignedLessThan, result, 0);
        let negative = self.builder.ins().uextend(types::I64, negative);
        self.builder.def_var(flags.n, negative);

        let zero = self.builder.ins().icmp_imm(IntCC::Equal, result, 0);
        let zero = self.builder.ins().uextend(types::I64, zero);
        self.builder.def_var(flags.z, zero);

        if clear_cv {
            let clear = self.builder.ins().iconst(types::I64, 0);
            self.builder.def_var(flags.c, clear);
            self.builder.def_var(flags.v, clear);
        }
        self.flags_dirty = true;
    }

    /// Lower a condition code to a 0/1 value. Codes without a flag
    /// mapping in this subset evaluate as always true.
    fn cond_value(&mut self, cond: Cond) -> Value {
        let flags = self.flag_vars();
        match cond {
            Cond::Eq => self.flag_value(flags.z),
            Cond::Ne => self.flag_complement(flags.z),
            Cond::Cs => self.flag_value(flags.c),
            Cond::Cc => self.flag_complement(flags.c),
            Cond::Mi => self.flag_value(flags.n),
            Cond::Pl => self.flag_complement(flags.n),
            Cond::Vs => self.flag_value(flags.v),
            Cond::Vc => self.flag_complement(flags.v),
            _ => self.builder.ins().iconst(types::I64, 1),
        }
    }

    fn operand_value(&mut self, inst: &Instruction, index: usize, pc: u64) -> EmuResult<Value> {
        match inst.operands().get(index) {
            Some(Operand::Register(reg)) => Ok(self.read_reg(*reg)),
            Some(Operand::Immediate(imm)) => {
                Ok(self.builder.ins().iconst(types::I64, *imm as i64))
            }
            other => Err(fail(pc, format!("unsupported operand {other:?}"))),
        }
    }

    fn emit_instruction(&mut self, inst: &Instruction, pc: u64) -> EmuResult<()> {
        match inst.kind {
            InstrKind::Arithmetic | InstrKind::Logical => self.emit_alu(inst, pc),
            InstrKind::LoadStore => self.emit_load_store(inst, pc),
            _ => Err(fail(pc, format!("unsupported instruction kind {:?}", inst.kind))),
        }
    }

    fn emit_alu(&mut self, inst: &Instruction, pc: u64) -> EmuResult<()> {
        let lhs = self.operand_value(inst, 0, pc)?;
        let rhs = self.operand_value(inst, 1, pc)?;
        let result = match inst.op {
            Opcode::Add => self.builder.ins().iadd(lhs, rhs),
            Opcode::Sub => self.builder.ins().isub(lhs, rhs),
            Opcode::And => self.builder.ins().band(lhs, rhs),
            Opcode::Orr => self.builder.ins().bor(lhs, rhs),
            Opcode::Eor => self.builder.ins().bxor(lhs, rhs),
            op => return Err(fail(pc, format!("unsupported ALU opcode {op:?}"))),
        };
        self.write_reg(inst.dest, result);
        if inst.sets_flags {
            // Arithmetic defines carry and overflow as clear; logical ops
            // leave them untouched.
            self.set_result_flags(result, inst.kind == InstrKind::Arithmetic);
        }
        Ok(())
    }

    fn emit_load_store(&mut self, inst: &Instruction, pc: u64) -> EmuResult<()> {
        let Some(&Operand::Memory { base, offset, .. }) = inst.operands().first() else {
            return Err(fail(pc, "load/store without a memory operand"));
        };
        let base_value = self.read_reg(base);
        let addr = self.builder.ins().iadd_imm(base_value, i64::from(offset));

        match inst.op {
            Opcode::Ldr => {
                let call = self.builder.ins().call(self.read_fn, &[self.mem_ptr, addr]);
                let value = self.builder.inst_results(call)[0];
                self.write_reg(inst.dest, value);
                Ok(())
            }
            Opcode::Str => {
                let value = self.read_reg(inst.dest);
                self.builder
                    .ins()
                    .call(self.write_fn, &[self.mem_ptr, addr, value]);
                Ok(())
            }
            op => Err(fail(pc, format!("unsupported memory opcode {op:?}"))),
        }
    }

    /// Lower the terminating branch and produce the exit PC value.
    fn emit_branch_exit(&mut self, inst: &Instruction, pc: u64) -> EmuResult<Value> {
        // Resolved directly from the immediate: a target of address zero is
        // a real destination here (the halt convention), not the decoder's
        // unresolved sentinel.
        let taken = inst.branch_target(pc);

        match inst.op {
            Opcode::B => {
                self.flush();
                Ok(self.builder.ins().iconst(types::I64, taken as i64))
            }
            Opcode::Bl => {
                let Some(&Operand::Immediate(offset)) = inst.operands().first() else {
                    return Err(fail(pc, "link branch without an immediate target"));
                };
                let link = self
                    .builder
                    .ins()
                    .iconst(types::I64, offset.wrapping_add(4) as i64);
                self.write_reg(REG_LINK, link);
                self.flush();
                Ok(self.builder.ins().iconst(types::I64, taken as i64))
            }
            Opcode::BCond => {
                let cond = inst
                    .condition
                    .ok_or_else(|| fail(pc, "conditional branch without a condition"))?;
                let cond_value = self.cond_value(cond);
                self.flush();
                let taken_pc = self.builder.ins().iconst(types::I64, taken as i64);
                let fall_pc = self
                    .builder
                    .ins()
                    .iconst(types::I64, pc.wrapping_add(4) as i64);
                Ok(self.builder.ins().select(cond_value, taken_pc, fall_pc))
            }
            op => Err(fail(pc, format!("unsupported branch opcode {op:?}"))),
        }
    }

    /// Store every dirty register and the repacked flag word.
    fn flush(&mut self) {
        for slot in 0..NUM_REGS {
            if !self.reg_dirty[slot] {
                continue;
            }
            if let Some(var) = self.reg_vars[slot] {
                let value = self.builder.use_var(var);
                let offset = slot as i32 * 8;
                self.builder
                    .ins()
                    .store(MemFlags::trusted(), value, self.regs_ptr, offset);
            }
        }
        if !self.flags_dirty {
            return;
        }
        if let Some(flags) = self.flags {
            let mut word = self.builder.ins().iconst(types::I64, 0);
            for (var, bit) in [(flags.n, 31), (flags.z, 30), (flags.c, 29), (flags.v, 28)] {
                let value = self.builder.use_var(var);
                let shifted = self.builder.ins().ishl_imm(value, bit);
                word = self.builder.ins().bor(word, shifted);
            }
            let offset = REG_NZCV as i32 * 8;
            self.builder
                .ins()
                .store(MemFlags::trusted(), word, self.regs_ptr, offset);
        }
    }
}
