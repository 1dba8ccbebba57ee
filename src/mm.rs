//! File and VMA space allocation.
//!
//! When an edit needs more room than the input provides, the memory
//! manager reserves a fresh region past the end of the mapped file image
//! and realizes it as loadable space: either by claiming an unused
//! (PT_NULL) program-header slot as a new PT_LOAD, or by growing the
//! trailing PT_LOAD in place. All trailing file content moves up by
//! `extend_size`, which is why allocation requests are collected first and
//! placed in a single `finalize` pass.

use goblin::elf::program_header::{ProgramHeader, PF_R, PF_W, PT_LOAD, PT_NULL};

use crate::error::{Error, Result};
use crate::image::ElfImage;

pub(crate) const PAGE_SIZE: u64 = 0x1000;

/// Index of a pending allocation, resolved to `(offset, vaddr)` after
/// [`MemoryManager::finalize`].
pub(crate) type AllocIdx = usize;

pub(crate) struct MemoryManager {
    threshold: Option<u64>,
    requests: Vec<u64>,
    placements: Vec<(u64, u64)>,
    extend_size: u64,
    extended_offset_base: u64,
    extended_vaddr_base: u64,
}

impl MemoryManager {
    pub fn new(image: &ElfImage) -> Self {
        MemoryManager {
            threshold: threshold_of(&image.phdrs),
            requests: Vec::new(),
            placements: Vec::new(),
            extend_size: 0,
            extended_offset_base: 0,
            extended_vaddr_base: 0,
        }
    }

    /// Reserve `size` bytes in the extension region. The placement is
    /// known only after `finalize`.
    pub fn alloc(&mut self, size: u64) -> AllocIdx {
        debug_assert!(size > 0);
        self.requests.push(size);
        self.requests.len() - 1
    }

    pub fn extended(&self) -> bool {
        self.extend_size > 0
    }

    pub fn extend_size(&self) -> u64 {
        self.extend_size
    }

    /// The point after which trailing file bytes shift when the image is
    /// extended. Meaningful only once `finalize` has run with requests.
    pub fn shift_point(&self) -> u64 {
        self.extended_offset_base
    }

    /// Translate a pre-extension file offset to its post-extension
    /// position.
    pub fn extended_offset(&self, offset: u64) -> u64 {
        match self.threshold {
            Some(threshold) if self.extended() && offset >= threshold => {
                offset + self.extend_size
            }
            _ => offset,
        }
    }

    pub fn placement(&self, idx: AllocIdx) -> (u64, u64) {
        self.placements[idx]
    }

    /// Lay out every pending request past `threshold`, realize the region
    /// as loadable space, and shift every header field that referred to a
    /// file offset past the insertion point.
    pub fn finalize(&mut self, image: &mut ElfImage) -> Result<()> {
        if self.requests.is_empty() {
            return Ok(());
        }
        let threshold = self.threshold.ok_or_else(|| {
            Error::Structural("cannot allocate space: input has no PT_LOAD segment".into())
        })?;

        // Bump placement inside the region, keeping each allocation
        // 8-aligned so dynamic entries land on their natural boundary.
        let mut relative = Vec::with_capacity(self.requests.len());
        let mut cursor = 0u64;
        for &size in &self.requests {
            cursor = align_up(cursor, 8);
            relative.push(cursor);
            cursor += size;
        }
        let total = cursor;
        self.extend_size = align_up(total, PAGE_SIZE);

        // Shift header fields pointing past the insertion point. The new
        // region itself is installed afterwards so it is never shifted.
        if image.header.e_shoff >= threshold {
            image.header.e_shoff += self.extend_size;
        }
        if image.header.e_phoff >= threshold {
            image.header.e_phoff += self.extend_size;
        }
        image.sync_header()?;
        for i in 0..image.phdrs.len() {
            let p = &mut image.phdrs[i];
            if p.p_type != PT_NULL && p.p_offset >= threshold {
                p.p_offset += self.extend_size;
                image.sync_phdr(i)?;
            }
        }
        for i in 0..image.shdrs.len() {
            if image.shdrs[i].sh_offset >= threshold {
                image.shdrs[i].sh_offset += self.extend_size;
                image.sync_shdr(i)?;
            }
        }

        let vaddr_base = self.install_load(image, threshold, total)?;
        self.extended_offset_base = threshold;
        self.extended_vaddr_base = vaddr_base;
        self.placements = relative
            .iter()
            .map(|&r| (self.extended_offset_base + r, self.extended_vaddr_base + r))
            .collect();
        Ok(())
    }

    /// Realize `[threshold, threshold + total)` as loadable space and
    /// return the virtual address of the region start.
    fn install_load(&self, image: &mut ElfImage, threshold: u64, total: u64) -> Result<u64> {
        // First choice: claim an unused program-header slot, leaving the
        // existing loads untouched.
        if let Some(slot) = image.phdrs.iter().position(|p| p.p_type == PT_NULL) {
            let highest = image
                .phdrs
                .iter()
                .filter(|p| p.p_type == PT_LOAD)
                .map(|p| p.p_vaddr + p.p_memsz)
                .max()
                .unwrap_or(0);
            // The loader requires p_vaddr and p_offset to agree modulo the
            // page size.
            let vaddr = align_up(highest, PAGE_SIZE) + threshold % PAGE_SIZE;
            image.phdrs[slot] = ProgramHeader {
                p_type: PT_LOAD,
                p_flags: PF_R | PF_W,
                p_offset: threshold,
                p_vaddr: vaddr,
                p_paddr: vaddr,
                p_filesz: total,
                p_memsz: total,
                p_align: PAGE_SIZE,
            };
            image.sync_phdr(slot)?;
            return Ok(vaddr);
        }

        // Second choice: grow the trailing PT_LOAD. Only sound when its
        // file image ends exactly at the insertion point and it has no bss
        // tail that the new bytes would shadow.
        let grow = image.phdrs.iter().position(|p| {
            p.p_type == PT_LOAD
                && p.p_offset + p.p_filesz == threshold
                && p.p_filesz == p.p_memsz
        });
        if let Some(idx) = grow {
            let p = &mut image.phdrs[idx];
            let vaddr = p.p_vaddr + (threshold - p.p_offset);
            p.p_filesz += total;
            p.p_memsz += total;
            image.sync_phdr(idx)?;
            return Ok(vaddr);
        }

        Err(Error::Structural(
            "cannot place a new PT_LOAD: no spare program header slot and the \
             trailing PT_LOAD cannot be grown in place"
                .into(),
        ))
    }
}

pub(crate) fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// End-of-file offset of the second PT_LOAD for the conventional two-load
/// layout, falling back to the last PT_LOAD otherwise. `None` when the
/// image has no loads at all.
pub(crate) fn threshold_of(phdrs: &[ProgramHeader]) -> Option<u64> {
    let loads: Vec<&ProgramHeader> = phdrs.iter().filter(|p| p.p_type == PT_LOAD).collect();
    let pick = match loads.len() {
        0 => return None,
        2 => loads[1],
        _ => loads[loads.len() - 1],
    };
    Some(pick.p_offset + pick.p_filesz)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load(offset: u64, filesz: u64) -> ProgramHeader {
        ProgramHeader {
            p_type: PT_LOAD,
            p_flags: PF_R,
            p_offset: offset,
            p_vaddr: offset,
            p_paddr: offset,
            p_filesz: filesz,
            p_memsz: filesz,
            p_align: PAGE_SIZE,
        }
    }

    #[test]
    fn align_up_rounds_to_boundary() {
        assert_eq!(align_up(0, PAGE_SIZE), 0);
        assert_eq!(align_up(1, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(PAGE_SIZE, PAGE_SIZE), PAGE_SIZE);
        assert_eq!(align_up(0x17, 8), 0x18);
    }

    #[test]
    fn threshold_is_end_of_second_load() {
        let phdrs = vec![load(0, 0x400), load(0x1000, 0x234)];
        assert_eq!(threshold_of(&phdrs), Some(0x1234));
    }

    #[test]
    fn threshold_falls_back_to_last_load() {
        let phdrs = vec![
            load(0, 0x400),
            load(0x1000, 0x100),
            load(0x2000, 0x80),
            load(0x3000, 0x40),
        ];
        assert_eq!(threshold_of(&phdrs), Some(0x3040));
        assert_eq!(threshold_of(&[load(0, 0x500)]), Some(0x500));
    }

    #[test]
    fn threshold_requires_a_load() {
        let gnu_stack = ProgramHeader {
            p_type: goblin::elf::program_header::PT_GNU_STACK,
            p_flags: PF_R | PF_W,
            p_offset: 0,
            p_vaddr: 0,
            p_paddr: 0,
            p_filesz: 0,
            p_memsz: 0,
            p_align: 0x10,
        };
        assert_eq!(threshold_of(&[gnu_stack]), None);
    }
}
