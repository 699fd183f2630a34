//! End-to-end tests driving the full decode, translate, cache, execute
//! pipeline through the public API.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_truncation)]

use std::io::Write;

use lyra::vm::jit::CACHE_CAPACITY;
use lyra::{Counters, Emulator, NullSink, Perms};

const ENTRY: u64 = 0x40_0000;

// Instruction encoding helpers.

fn add_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    0x9100_0000 | ((imm & 0xFFF) << 10) | (rn << 5) | rd
}

fn subs_imm(rd: u32, rn: u32, imm: u32) -> u32 {
    0xD100_0000 | ((imm & 0xFFF) << 10) | (rn << 5) | rd
}

fn b(imm26: i64) -> u32 {
    0x1400_0000 | ((imm26 as u32) & 0x03FF_FFFF)
}

fn b_to(from: u64, to: u64) -> u32 {
    b(((to as i64) - (from as i64)) / 4)
}

fn b_cond(cond: u32, imm19: i32) -> u32 {
    0x5400_0000 | (((imm19 as u32) & 0x7_FFFF) << 5) | cond
}

fn ldr(rt: u32, rn: u32, imm9: u32) -> u32 {
    0xF940_0000 | ((imm9 & 0x1FF) << 12) | (rn << 5) | rt
}

fn str_(rt: u32, rn: u32, imm9: u32) -> u32 {
    0xF900_0000 | ((imm9 & 0x1FF) << 12) | (rn << 5) | rt
}

/// Boot a session with `words` mapped RWX at [`ENTRY`] and the PC there.
fn session(words: &[u32]) -> Emulator {
    let mut emu = Emulator::new().unwrap();
    emu.space_mut()
        .map(
            ENTRY,
            words.len() * 4 + 64,
            Perms::READ | Perms::WRITE | Perms::EXEC,
        )
        .unwrap();
    for (i, &word) in words.iter().enumerate() {
        emu.space_mut()
            .write_u32(ENTRY + 4 * i as u64, word)
            .unwrap();
    }
    emu.regs_mut().set_pc(ENTRY);
    emu
}

#[test]
fn test_add_immediate_end_to_end() {
    // x0 = x1 + 7, branch to zero.
    let mut emu = session(&[add_imm(0, 1, 7), b_to(ENTRY + 4, 0)]);
    emu.regs_mut().set_x(1, 5).unwrap();

    emu.run(&mut NullSink).unwrap();

    assert_eq!(emu.regs().x(0).unwrap(), 12);
    assert_eq!(emu.regs().x(1).unwrap(), 5);
    assert_eq!(emu.regs().pc(), 0);
}

#[test]
fn test_countdown_loop_and_flags() {
    // x2 counts down from 100; b.ne loops until the zero flag sets.
    let mut emu = session(&[subs_imm(2, 2, 1), b_cond(0x1, -1), b_to(ENTRY + 8, 0)]);
    emu.regs_mut().set_x(2, 100).unwrap();

    let mut counters = Counters::default();
    emu.run(&mut counters).unwrap();

    assert_eq!(emu.regs().x(2).unwrap(), 0);
    assert!(emu.regs().flag_z());
    assert!(!emu.regs().flag_n());
    assert_eq!(counters.branches_taken, 99);
    assert_eq!(counters.branches_not_taken, 1);
    assert_eq!(counters.blocks_executed, 101);
    // One loop block, one exit block; everything after is cache hits.
    assert_eq!(counters.blocks_compiled, 2);
    assert_eq!(counters.cache_misses, 2);
    assert_eq!(counters.cache_hits, 99);
}

#[test]
fn test_memory_traffic_through_generated_code() {
    let data = 0x50_0000_u64;
    // x1 = [x0]; x2 = x1 + 1; [x0 + 8] = x2; halt.
    let mut emu = session(&[
        ldr(1, 0, 0),
        add_imm(2, 1, 1),
        str_(2, 0, 1),
        b_to(ENTRY + 12, 0),
    ]);
    emu.space_mut()
        .map(data, 0x100, Perms::READ | Perms::WRITE)
        .unwrap();
    emu.space_mut().write_u64(data, 41).unwrap();
    emu.regs_mut().set_x(0, data).unwrap();

    let mut counters = Counters::default();
    emu.run(&mut counters).unwrap();

    assert_eq!(emu.regs().x(2).unwrap(), 42);
    assert_eq!(emu.space().read_u64(data + 8).unwrap(), 42);
    assert_eq!(counters.memory_reads, 1);
    assert_eq!(counters.memory_writes, 1);
}

#[test]
fn test_cache_collision_recompiles_instead_of_misexecuting() {
    // Two one-branch blocks whose entries share a cache bucket: A jumps to
    // B, B jumps back past A to the halt block, which collides with
    // nothing. A second visit to A's bucket must miss, not run B.
    let far = ENTRY + (CACHE_CAPACITY as u64) * 4;
    let mut emu = Emulator::new().unwrap();
    emu.space_mut()
        .map(ENTRY, (CACHE_CAPACITY + 16) * 4, Perms::READ | Perms::WRITE | Perms::EXEC)
        .unwrap();

    // A at ENTRY: x0 += 1, jump to B.
    emu.space_mut().write_u32(ENTRY, add_imm(0, 0, 1)).unwrap();
    emu.space_mut()
        .write_u32(ENTRY + 4, b_to(ENTRY + 4, far))
        .unwrap();
    // B at far (same bucket as A): x0 += 2, revisit A's bucket at ENTRY + 8.
    emu.space_mut().write_u32(far, add_imm(0, 0, 2)).unwrap();
    emu.space_mut()
        .write_u32(far + 4, b_to(far + 4, ENTRY + 8))
        .unwrap();
    // Final block at ENTRY + 8: x0 += 4, halt.
    emu.space_mut()
        .write_u32(ENTRY + 8, add_imm(0, 0, 4))
        .unwrap();
    emu.space_mut()
        .write_u32(ENTRY + 12, b_to(ENTRY + 12, 0))
        .unwrap();

    emu.regs_mut().set_pc(ENTRY);
    let mut counters = Counters::default();
    emu.run(&mut counters).unwrap();

    // Every block ran exactly once with the right code.
    assert_eq!(emu.regs().x(0).unwrap(), 7);
    assert_eq!(counters.blocks_compiled, 3);
    assert_eq!(counters.cache_hits, 0);
}

#[test]
fn test_truncated_block_falls_through_past_last_instruction() {
    // Two adds followed by an undecodable word: the block compiles
    // without it and exits at the next sequential PC.
    let mut emu = session(&[add_imm(0, 0, 1), add_imm(0, 0, 2), 0]);

    let next = emu.step(&mut NullSink).unwrap();
    assert_eq!(next, ENTRY + 8);
    assert_eq!(emu.regs().x(0).unwrap(), 3);

    // Stepping again lands on the bad word itself.
    assert!(emu.step(&mut NullSink).is_err());
}

#[test]
fn test_subs_to_zero_takes_following_beq() {
    // subs x1, x1, #5 with x1 == 5 sets Z; b.eq jumps over the +100 add.
    let mut emu = session(&[
        subs_imm(1, 1, 5),
        b_cond(0x0, 2),
        add_imm(0, 0, 100),
        b_to(ENTRY + 12, 0),
    ]);
    emu.regs_mut().set_x(1, 5).unwrap();

    emu.run(&mut NullSink).unwrap();
    assert_eq!(emu.regs().x(1).unwrap(), 0);
    assert_eq!(emu.regs().x(0).unwrap(), 0);
    assert!(emu.regs().flag_z());
    assert!(!emu.regs().flag_c());
    assert!(!emu.regs().flag_v());
}

#[test]
fn test_link_branch_sets_link_register() {
    // bl #+8: the link register receives the branch immediate plus 4.
    let mut emu = session(&[0x9400_0002]);
    let next = emu.step(&mut NullSink).unwrap();

    assert_eq!(next, ENTRY + 8);
    assert_eq!(emu.regs().x(30).unwrap(), 12);
}

#[test]
fn test_flat_image_file_runs() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let base = 0x40_0000_u64;
    let words = [add_imm(0, 1, 7), b_to(base + 4, 0)];
    for word in words {
        file.write_all(&word.to_le_bytes()).unwrap();
    }

    let mut emu = Emulator::new().unwrap();
    let image = emu.load(file.path()).unwrap();
    assert_eq!(image.entry, base);

    emu.regs_mut().set_x(1, 35).unwrap();
    emu.run(&mut NullSink).unwrap();
    assert_eq!(emu.regs().x(0).unwrap(), 42);
}

#[test]
fn test_elf_image_loads_segments_and_entry() {
    let entry = 0x21_0000_u64;
    let code: Vec<u32> = vec![add_imm(0, 0, 9), b_to(entry + 4, 0)];
    let mut body = Vec::new();
    for word in &code {
        body.extend_from_slice(&word.to_le_bytes());
    }

    let elf = build_elf64(entry, &body);
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&elf).unwrap();

    let mut emu = Emulator::new().unwrap();
    let image = emu.load(file.path()).unwrap();
    assert_eq!(image.entry, entry);
    assert_eq!(emu.regs().pc(), entry);

    emu.run(&mut NullSink).unwrap();
    assert_eq!(emu.regs().x(0).unwrap(), 9);
}

#[test]
fn test_invalidate_picks_up_patched_code() {
    let mut emu = session(&[add_imm(0, 1, 7), b_to(ENTRY + 4, 0)]);
    emu.regs_mut().set_x(1, 0).unwrap();
    emu.run(&mut NullSink).unwrap();
    assert_eq!(emu.regs().x(0).unwrap(), 7);

    // Patch the immediate and invalidate; the next run sees the new code.
    emu.space_mut().write_u32(ENTRY, add_imm(0, 1, 9)).unwrap();
    emu.invalidate(ENTRY);
    emu.regs_mut().set_pc(ENTRY);
    emu.run(&mut NullSink).unwrap();
    assert_eq!(emu.regs().x(0).unwrap(), 9);
}

/// Build a minimal ELF64 executable for `AArch64` with one RX `PT_LOAD`
/// segment holding `body` at `vaddr`, which is also the entry point.
fn build_elf64(vaddr: u64, body: &[u8]) -> Vec<u8> {
    const EHDR_LEN: usize = 64;
    const PHDR_LEN: usize = 56;
    let body_off = (EHDR_LEN + PHDR_LEN) as u64;

    let mut out = Vec::new();
    out.extend_from_slice(b"\x7fELF\x02\x01\x01\x00"); // magic, 64-bit, LE
    out.extend_from_slice(&[0; 8]); // padding
    out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
    out.extend_from_slice(&183u16.to_le_bytes()); // EM_AARCH64
    out.extend_from_slice(&1u32.to_le_bytes()); // version
    out.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
    out.extend_from_slice(&(EHDR_LEN as u64).to_le_bytes()); // e_phoff
    out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    out.extend_from_slice(&(EHDR_LEN as u16).to_le_bytes()); // e_ehsize
    out.extend_from_slice(&(PHDR_LEN as u16).to_le_bytes()); // e_phentsize
    out.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    out.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx

    out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
    out.extend_from_slice(&5u32.to_le_bytes()); // PF_R | PF_X
    out.extend_from_slice(&body_off.to_le_bytes()); // p_offset
    out.extend_from_slice(&vaddr.to_le_bytes()); // p_vaddr
    out.extend_from_slice(&vaddr.to_le_bytes()); // p_paddr
    out.extend_from_slice(&(body.len() as u64).to_le_bytes()); // p_filesz
    out.extend_from_slice(&(body.len() as u64).to_le_bytes()); // p_memsz
    out.extend_from_slice(&4u64.to_le_bytes()); // p_align

    out.extend_from_slice(body);
    out
}
