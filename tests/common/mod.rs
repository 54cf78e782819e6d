#![allow(dead_code)]

use r_mips::core::config::{ByteOrder, MachineConfig};
use r_mips::core::machine::Machine;

pub const CODE_VADDR: u64 = 0xffff_ffff_8000_1000;
pub const CODE_PADDR: u64 = 0x1000;

pub fn config(cpu: &str, dyntrans: bool) -> MachineConfig {
    let mut c = MachineConfig::default();
    c.cpu = cpu.to_string();
    c.byte_order = ByteOrder::Little;
    c.memory_mib = 512;
    c.dyntrans.enabled = dyntrans;
    c.initial_pc = CODE_VADDR;
    c.log = String::from("warn");
    c
}

pub fn machine_with_code(cpu: &str, dyntrans: bool, code: &[u32]) -> Machine {
    let mut m = Machine::new(&config(cpu, dyntrans)).unwrap();
    load_words(&mut m, CODE_PADDR, code);
    m
}

pub fn load_words(m: &mut Machine, paddr: u64, code: &[u32]) {
    let bytes: Vec<u8> = code.iter().flat_map(|w| w.to_le_bytes()).collect();
    m.load_raw_image(paddr, &bytes);
}

// ======================= a tiny assembler =======================

pub const NOP: u32 = 0;
pub const SYSCALL: u32 = 0x0000_000c;
pub const WAIT: u32 = 0x4200_0020;
pub const ERET: u32 = 0x4200_0018;

pub fn addiu(rt: u32, rs: u32, imm: i16) -> u32 {
    (0x09 << 26) | (rs << 21) | (rt << 16) | (imm as u16 as u32)
}

pub fn addu(rd: u32, rs: u32, rt: u32) -> u32 {
    (rs << 21) | (rt << 16) | (rd << 11) | 0x21
}

pub fn lui(rt: u32, imm: u16) -> u32 {
    (0x0f << 26) | (rt << 16) | imm as u32
}

pub fn ori(rt: u32, rs: u32, imm: u16) -> u32 {
    (0x0d << 26) | (rs << 21) | (rt << 16) | imm as u32
}

pub fn sll(rd: u32, rt: u32, sa: u32) -> u32 {
    (rt << 16) | (rd << 11) | (sa << 6)
}

pub fn lw(rt: u32, offset: i16, base: u32) -> u32 {
    (0x23 << 26) | (base << 21) | (rt << 16) | (offset as u16 as u32)
}

pub fn sw(rt: u32, offset: i16, base: u32) -> u32 {
    (0x2b << 26) | (base << 21) | (rt << 16) | (offset as u16 as u32)
}

pub fn sb(rt: u32, offset: i16, base: u32) -> u32 {
    (0x28 << 26) | (base << 21) | (rt << 16) | (offset as u16 as u32)
}

pub fn beq(rs: u32, rt: u32, offset: i16) -> u32 {
    (0x04 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
}

pub fn bne(rs: u32, rt: u32, offset: i16) -> u32 {
    (0x05 << 26) | (rs << 21) | (rt << 16) | (offset as u16 as u32)
}

pub fn j(target: u64) -> u32 {
    (0x02 << 26) | ((target as u32 & 0x0fff_ffff) >> 2)
}

pub fn jal(target: u64) -> u32 {
    (0x03 << 26) | ((target as u32 & 0x0fff_ffff) >> 2)
}

pub fn jr(rs: u32) -> u32 {
    (rs << 21) | 0x08
}
