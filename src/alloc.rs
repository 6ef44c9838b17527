// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A coalescing free-list allocator over a window of guest RAM.
//!
//! The allocator never owns all of RAM: it is handed a sub-range
//! `[begin, end)` strictly inside the memory facade's usable space, the way
//! `Vamos.py`'s `MemoryAlloc(mem, 0, ram_size*1024, mem_begin, label_mgr)`
//! hands the allocator a window below which the host wires up bootstrap
//! structures (the initial stack) by hand. Every allocation is also recorded
//! in the [`LabelRegistry`](crate::label::LabelRegistry) under the name the
//! caller supplies; freeing an allocation removes the label.

use thiserror::Error;

use crate::label::{Label, LabelRegistry};
use crate::memory::MemoryImage;

/// The allocator's window is full, or no free block is large enough.
#[derive(Debug, Error)]
#[error("allocator exhausted: no free block of at least {requested} bytes in [{begin:#x}, {end:#x})")]
pub struct AllocError {
    pub requested: u32,
    pub begin: u32,
    pub end: u32,
}

/// A single field of a struct layout passed to [`Allocator::alloc_struct`].
#[derive(Clone, Copy, Debug)]
pub struct Field {
    pub name: &'static str,
    pub offset: u32,
    pub width: u8,
}

impl Field {
    pub const fn new(name: &'static str, offset: u32, width: u8) -> Self {
        Self { name, offset, width }
    }
}

/// A typed view over one allocation, keyed by field name.
#[derive(Clone, Debug)]
pub struct StructHandle {
    pub addr: u32,
    fields: Vec<Field>,
}

impl StructHandle {
    fn field(&self, name: &str) -> &Field {
        self.fields.iter().find(|f| f.name == name).unwrap_or_else(|| panic!("no field '{name}' in struct layout"))
    }

    pub fn r_field(&self, memory: &mut MemoryImage, name: &str) -> Option<u32> {
        let field = self.field(name);
        let addr = self.addr + field.offset;
        match field.width {
            1 => memory.r8(addr).ok().map(|v| v as u32),
            2 => memory.r16(addr).ok().map(|v| v as u32),
            4 => memory.r32(addr).ok(),
            w => panic!("unsupported field width {w}"),
        }
    }

    pub fn w_field(&self, memory: &mut MemoryImage, name: &str, value: u32) -> Result<(), crate::error::MachineError> {
        let field = self.field(name);
        let addr = self.addr + field.offset;
        match field.width {
            1 => memory.w8(addr, value as u8),
            2 => memory.w16(addr, value as u16),
            4 => memory.w32(addr, value),
            w => panic!("unsupported field width {w}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeBlock {
    addr: u32,
    size: u32,
}

/// A coalescing first-fit allocator over `[begin, end)`.
#[derive(Clone, Debug)]
pub struct Allocator {
    begin: u32,
    end: u32,
    /// Kept in address order so coalescing only ever checks neighbors.
    free: Vec<FreeBlock>,
    /// Base address -> size, for allocations currently outstanding.
    live: std::collections::BTreeMap<u32, u32>,
}

fn align4(n: u32) -> u32 {
    (n + 3) & !3
}

impl Allocator {
    pub fn new(begin: u32, end: u32) -> Self {
        assert!(begin <= end);
        Self { begin, end, free: vec![FreeBlock { addr: begin, size: end - begin }], live: Default::default() }
    }

    /// Allocates a raw, 4-byte-aligned block and labels it `label_name`.
    pub fn alloc_memory(&mut self, labels: &mut LabelRegistry, label_name: impl Into<String>, size: u32) -> Result<u32, AllocError> {
        let size = align4(size.max(1));
        let index = self
            .free
            .iter()
            .position(|b| b.size >= size)
            .ok_or(AllocError { requested: size, begin: self.begin, end: self.end })?;

        let block = self.free[index];
        let addr = block.addr;
        if block.size == size {
            self.free.remove(index);
        } else {
            self.free[index] = FreeBlock { addr: addr + size, size: block.size - size };
        }

        self.live.insert(addr, size);
        let name = label_name.into();
        log::trace!(target: "machine::alloc", "alloc '{name}' {size} bytes at {addr:#x}");
        // Best-effort: if the label overlaps a reserved range this is a host
        // bug, not a guest fault, so we don't convert it into an AllocError.
        let _ = labels.add(Label::new(name, addr, size));
        Ok(addr)
    }

    /// Allocates `layout`'s total size and returns a typed accessor over it.
    pub fn alloc_struct(
        &mut self,
        labels: &mut LabelRegistry,
        label_name: impl Into<String>,
        layout: &[Field],
    ) -> Result<StructHandle, AllocError> {
        let size = layout.iter().map(|f| f.offset + f.width as u32).max().unwrap_or(0);
        let addr = self.alloc_memory(labels, label_name, size)?;
        Ok(StructHandle { addr, fields: layout.to_vec() })
    }

    /// Allocates `bytes.len() + 1` for a NUL-terminated string and writes it.
    pub fn alloc_cstr(
        &mut self,
        labels: &mut LabelRegistry,
        memory: &mut MemoryImage,
        label_name: impl Into<String>,
        bytes: &[u8],
    ) -> Result<u32, AllocError> {
        let addr = self.alloc_memory(labels, label_name, bytes.len() as u32 + 1)?;
        memory.w_cstr(addr, bytes).expect("freshly allocated block must be writable");
        Ok(addr)
    }

    /// Allocates `bytes.len() + 1` for a BCPL length-prefixed string and writes it.
    pub fn alloc_bstr(
        &mut self,
        labels: &mut LabelRegistry,
        memory: &mut MemoryImage,
        label_name: impl Into<String>,
        bytes: &[u8],
    ) -> Result<u32, AllocError> {
        let addr = self.alloc_memory(labels, label_name, bytes.len() as u32 + 1)?;
        memory.w_bstr(addr, bytes).expect("freshly allocated block must be writable");
        Ok(addr)
    }

    /// Returns the block at `addr` to the free list, coalescing with
    /// neighbors, and removes its label.
    pub fn free(&mut self, labels: &mut LabelRegistry, addr: u32) -> Result<(), crate::label::NotFoundError> {
        let size = self.live.remove(&addr).ok_or(crate::label::NotFoundError(addr))?;
        labels.remove(addr).ok();

        let insert_at = self.free.partition_point(|b| b.addr < addr);
        let mut block = FreeBlock { addr, size };

        if insert_at < self.free.len() && self.free[insert_at].addr == block.addr + block.size {
            block.size += self.free[insert_at].size;
            self.free.remove(insert_at);
        }
        if insert_at > 0 {
            let prev = self.free[insert_at - 1];
            if prev.addr + prev.size == block.addr {
                block = FreeBlock { addr: prev.addr, size: prev.size + block.size };
                self.free.remove(insert_at - 1);
            }
        }

        let pos = self.free.partition_point(|b| b.addr < block.addr);
        self.free.insert(pos, block);
        log::trace!(target: "machine::alloc", "free {size} bytes at {addr:#x}");
        Ok(())
    }

    /// True if the allocator holds exactly one free block spanning its whole window.
    pub fn is_pristine(&self) -> bool {
        self.live.is_empty() && self.free.len() == 1 && self.free[0] == FreeBlock { addr: self.begin, size: self.end - self.begin }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_alloc_free() {
        let mut labels = LabelRegistry::new();
        let mut alloc = Allocator::new(0x2000, 0x3000);

        let a = alloc.alloc_memory(&mut labels, "x", 128).unwrap();
        let b = alloc.alloc_memory(&mut labels, "y", 64).unwrap();
        assert_ne!(a, b);
        assert_eq!(labels.len(), 2);

        alloc.free(&mut labels, b).unwrap();
        alloc.free(&mut labels, a).unwrap();

        assert!(alloc.is_pristine());
        assert_eq!(labels.len(), 0);
    }

    #[test]
    fn exhaustion_reports_alloc_error() {
        let mut labels = LabelRegistry::new();
        let mut alloc = Allocator::new(0x2000, 0x2040);
        assert!(alloc.alloc_memory(&mut labels, "big", 0x1000).is_err());
    }

    #[test]
    fn coalesces_adjacent_frees() {
        let mut labels = LabelRegistry::new();
        let mut alloc = Allocator::new(0x2000, 0x2100);
        let a = alloc.alloc_memory(&mut labels, "a", 32).unwrap();
        let b = alloc.alloc_memory(&mut labels, "b", 32).unwrap();
        let c = alloc.alloc_memory(&mut labels, "c", 32).unwrap();
        alloc.free(&mut labels, b).unwrap();
        // Freeing the middle block alone leaves three fragments.
        assert!(!alloc.is_pristine());
        alloc.free(&mut labels, a).unwrap();
        alloc.free(&mut labels, c).unwrap();
        assert!(alloc.is_pristine());
    }
}
