//! Sparse little-endian memory for the simulator.
//!
//! Memory is allocated lazily in 4KB blocks; untouched bytes read as zero.

use std::collections::HashMap;

use crate::asm::MemType;

const BLOCK_BITS: u32 = 12;
const BLOCK_SIZE: usize = 1 << BLOCK_BITS;
const BLOCK_MASK: u64 = (BLOCK_SIZE as u64) - 1;

#[derive(Debug, Default, Clone)]
pub struct Memory {
    blocks: HashMap<u64, Box<[u8; BLOCK_SIZE]>>,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks touched by writes.
    pub fn resident_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub fn read_u8(&self, addr: u64) -> u8 {
        self.blocks
            .get(&(addr >> BLOCK_BITS))
            .map(|block| block[(addr & BLOCK_MASK) as usize])
            .unwrap_or(0)
    }

    pub fn write_u8(&mut self, addr: u64, value: u8) {
        let block = self
            .blocks
            .entry(addr >> BLOCK_BITS)
            .or_insert_with(|| Box::new([0; BLOCK_SIZE]));
        block[(addr & BLOCK_MASK) as usize] = value;
    }

    /// Read `size` bytes (at most 8) as an unsigned little-endian value.
    pub fn read(&self, addr: u64, size: usize) -> u64 {
        (0..size).fold(0u64, |acc, i| acc | (self.read_u8(addr.wrapping_add(i as u64)) as u64) << (8 * i))
    }

    /// Write the low `size` bytes of `value`.
    pub fn write(&mut self, addr: u64, size: usize, value: u64) {
        for i in 0..size {
            self.write_u8(addr.wrapping_add(i as u64), (value >> (8 * i)) as u8);
        }
    }

    /// Load with the extension rule of `ty`.
    pub fn load(&self, addr: u64, ty: MemType) -> u64 {
        let raw = self.read(addr, ty.size());
        match ty {
            MemType::I8 => raw as u8 as i8 as i64 as u64,
            MemType::I16 => raw as u16 as i16 as i64 as u64,
            MemType::I32 => raw as u32 as i32 as i64 as u64,
            MemType::U8 | MemType::U16 | MemType::U32 | MemType::U64 => raw,
        }
    }

    pub fn store(&mut self, addr: u64, ty: MemType, value: u64) {
        self.write(addr, ty.size(), value);
    }

    pub fn read_u32(&self, addr: u64) -> u32 {
        self.read(addr, 4) as u32
    }

    pub fn write_u32(&mut self, addr: u64, value: u32) {
        self.write(addr, 4, value as u64);
    }

    pub fn read_u64(&self, addr: u64) -> u64 {
        self.read(addr, 8)
    }

    pub fn write_u64(&mut self, addr: u64, value: u64) {
        self.write(addr, 8, value);
    }

    pub fn read_f64(&self, addr: u64) -> f64 {
        f64::from_bits(self.read_u64(addr))
    }

    pub fn write_f64(&mut self, addr: u64, value: f64) {
        self.write_u64(addr, value.to_bits());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untouched_memory_is_zero() {
        let mem = Memory::new();
        assert_eq!(mem.read_u64(0x1234_5678), 0);
        assert_eq!(mem.resident_blocks(), 0);
    }

    #[test]
    fn test_little_endian_across_blocks() {
        let mut mem = Memory::new();
        let addr = 0x1000 - 3;
        mem.write_u64(addr, 0x0102_0304_0506_0708);
        assert_eq!(mem.read_u8(addr), 0x08);
        assert_eq!(mem.read_u8(addr + 7), 0x01);
        assert_eq!(mem.read_u64(addr), 0x0102_0304_0506_0708);
        assert_eq!(mem.resident_blocks(), 2);
    }

    #[test]
    fn test_sign_extending_loads() {
        let mut mem = Memory::new();
        mem.write_u32(0x100, 0xFFFF_FFFE);
        assert_eq!(mem.load(0x100, MemType::I32) as i64, -2);
        assert_eq!(mem.load(0x100, MemType::U32), 0xFFFF_FFFE);
        assert_eq!(mem.load(0x100, MemType::I8) as i64, -2);
        assert_eq!(mem.load(0x100, MemType::U16), 0xFFFE);
    }
}
