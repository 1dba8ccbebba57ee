//! The per-save pipeline: collects edits as inline patches and allocation
//! plans, drives the memory manager, and materializes the output file.
//!
//! A `Saver` is built over a freshly parsed [`ElfImage`] for every save,
//! so repeated saves from one patcher are independent. Edits register in
//! two phases: first every component records what it needs (in-place
//! patches immediately, growth as allocation requests), then `dispatch`
//! fixes the layout and executes the plans in allocation order. The
//! string-table plan always precedes the dynamic-segment plan, so by the
//! time the dynamic tags are serialized every `d_val` already carries its
//! final string index.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use goblin::elf::dynamic::{Dyn, DT_NULL, DT_RPATH, DT_RUNPATH, DT_SONAME, DT_STRSZ, DT_STRTAB};
use goblin::elf::program_header::{PT_DYNAMIC, PT_INTERP};
use goblin::elf::section_header::{SHT_DYNAMIC, SHT_PROGBITS, SHT_STRTAB};
use log::warn;
use scroll::ctx::{SizeWith, TryIntoCtx};

use crate::error::{Error, Result};
use crate::image::ElfImage;
use crate::mm::MemoryManager;
use crate::strtab::{StrDest, StringTable};

/// Deferred work bound to a memory-manager allocation, executed once the
/// allocation's final `(offset, vaddr)` is known. One plan per allocation,
/// in allocation order.
enum Plan {
    Interp {
        phdr: usize,
        old_offset: u64,
        bytes: Vec<u8>,
    },
    Strtab,
    Dynamic {
        count: usize,
    },
}

pub(crate) struct Saver {
    image: ElfImage,
    mm: MemoryManager,
    strtab: StringTable,
    appended: Vec<Dyn>,
    plans: Vec<Plan>,
    inline: BTreeMap<u64, Vec<u8>>,
    dirty_tags: Vec<usize>,
    relocate_dynamic: bool,
}

impl Saver {
    pub fn new(image: ElfImage) -> Self {
        let mm = MemoryManager::new(&image);
        let strtab = StringTable::from_image(&image);
        Saver {
            image,
            mm,
            strtab,
            appended: Vec::new(),
            plans: Vec::new(),
            inline: BTreeMap::new(),
            dirty_tags: Vec::new(),
            relocate_dynamic: false,
        }
    }

    /// Replace the PT_INTERP contents. Fits rewrite in place; longer
    /// interpreters move to freshly allocated space.
    pub fn patch_interpreter(&mut self, interp: &str) -> Result<()> {
        let Some(idx) = self.image.phdr_index(PT_INTERP) else {
            warn!("no PT_INTERP segment found, interpreter left unchanged");
            return Ok(());
        };
        let ph = &self.image.phdrs[idx];
        let (old_offset, old_vaddr, old_size) = (ph.p_offset, ph.p_vaddr, ph.p_filesz);
        let old = self
            .image
            .data
            .get(old_offset as usize..(old_offset + old_size) as usize)
            .ok_or_else(|| Error::Structural("PT_INTERP range exceeds the file".into()))?;

        let mut bytes = interp.as_bytes().to_vec();
        bytes.push(0);
        if bytes.as_slice() == old {
            return Ok(());
        }
        if bytes.len() as u64 <= old_size {
            self.place_interp(idx, old_offset, old_offset, old_vaddr, bytes)
        } else {
            let alloc = self.mm.alloc(bytes.len() as u64);
            debug_assert_eq!(alloc, self.plans.len());
            self.plans.push(Plan::Interp {
                phdr: idx,
                old_offset,
                bytes,
            });
            Ok(())
        }
    }

    /// Register the SONAME and runpath edits against the dynamic segment.
    pub fn patch_dynamic(
        &mut self,
        soname: Option<&str>,
        runpath: Option<&str>,
        force_rpath: bool,
    ) -> Result<()> {
        if soname.is_none() && runpath.is_none() {
            return Ok(());
        }
        if self.image.dyns.is_empty() {
            warn!("no PT_DYNAMIC segment found, dynamic entries left unchanged");
            return Ok(());
        }

        if let Some(name) = soname {
            match self.image.dyn_index(DT_SONAME) {
                Some(idx) => self.request_string(name, StrDest::Tag(idx)),
                None => warn!("Entry DT_SONAME not found, not a shared library?"),
            }
        }
        if let Some(path) = runpath {
            let tag = if force_rpath { DT_RPATH } else { DT_RUNPATH };
            match self.image.dyn_index(tag) {
                Some(idx) => self.request_string(path, StrDest::Tag(idx)),
                None => {
                    let appended = self.appended.len();
                    self.appended.push(Dyn { d_tag: tag, d_val: 0 });
                    self.request_string(path, StrDest::Appended(appended));
                }
            }
        }
        Ok(())
    }

    /// Turn the queued string requests into a single table extension.
    pub fn finalize_strtab(&mut self) -> Result<()> {
        if !self.strtab.pending() {
            return Ok(());
        }
        let need = self.strtab.need().ok_or_else(|| {
            Error::Structural("cannot locate DT_STRTAB, string edits cannot be stored".into())
        })?;
        let alloc = self.mm.alloc(need);
        debug_assert_eq!(alloc, self.plans.len());
        self.plans.push(Plan::Strtab);
        Ok(())
    }

    /// Plan the PT_DYNAMIC relocation when new tags must be spliced in.
    pub fn expand_dynamic(&mut self) {
        if self.appended.is_empty() {
            return;
        }
        self.relocate_dynamic = true;
        let live = self.live_dyn_count();
        let count = live + self.appended.len() + 1;
        let bytes = count * Dyn::size_with(&self.image.ctx);
        let alloc = self.mm.alloc(bytes as u64);
        debug_assert_eq!(alloc, self.plans.len());
        self.plans.push(Plan::Dynamic { count });
    }

    /// Fix the layout and execute every plan in allocation order, then
    /// flush in-place tag mutations for a dynamic segment that stayed put.
    pub fn dispatch(&mut self) -> Result<()> {
        self.mm.finalize(&mut self.image)?;
        let plans = std::mem::take(&mut self.plans);
        for (idx, plan) in plans.into_iter().enumerate() {
            let (offset, vaddr) = self.mm.placement(idx);
            match plan {
                Plan::Interp {
                    phdr,
                    old_offset,
                    bytes,
                } => self.place_interp(phdr, old_offset, offset, vaddr, bytes)?,
                Plan::Strtab => self.place_strtab(offset, vaddr)?,
                Plan::Dynamic { count } => self.place_dynamic(offset, vaddr, count)?,
            }
        }
        if !self.relocate_dynamic {
            let dirty = std::mem::take(&mut self.dirty_tags);
            for idx in dirty {
                self.image.sync_dyn(idx)?;
            }
        }
        Ok(())
    }

    /// Materialize the output: shift the tail past the insertion point,
    /// zero the fresh region, then lay header patches (at translated
    /// offsets) and inline patches (verbatim) over the bytes.
    pub fn write(&self, out_path: &Path) -> Result<()> {
        let mut out = self.image.data.clone();
        if self.mm.extended() {
            let shift_point = self.mm.shift_point() as usize;
            let extend = self.mm.extend_size() as usize;
            let orig_len = out.len();
            out.resize(orig_len + extend, 0);
            out.copy_within(shift_point..orig_len, shift_point + extend);
            out[shift_point..shift_point + extend].fill(0);
        }
        for (&pos, bytes) in self.image.patches() {
            let pos = self.mm.extended_offset(pos) as usize;
            copy_patch(&mut out, pos, bytes)?;
        }
        for (&pos, bytes) in &self.inline {
            copy_patch(&mut out, pos as usize, bytes)?;
        }
        fs::write(out_path, &out)?;
        fs::set_permissions(out_path, self.image.permissions.clone())?;
        Ok(())
    }

    fn request_string(&mut self, s: &str, dest: StrDest) {
        if let Some(index) = self.strtab.request(s, dest) {
            self.apply_index(dest, index);
        }
    }

    fn apply_index(&mut self, dest: StrDest, index: u64) {
        match dest {
            StrDest::Tag(idx) => {
                self.image.dyns[idx].d_val = index;
                self.dirty_tags.push(idx);
            }
            StrDest::Appended(idx) => self.appended[idx].d_val = index,
        }
    }

    /// Tags before the DT_NULL terminator.
    fn live_dyn_count(&self) -> usize {
        self.image
            .dyns
            .iter()
            .position(|d| d.d_tag == DT_NULL)
            .unwrap_or(self.image.dyns.len())
    }

    fn place_interp(
        &mut self,
        phdr: usize,
        old_offset: u64,
        offset: u64,
        vaddr: u64,
        bytes: Vec<u8>,
    ) -> Result<()> {
        let size = bytes.len() as u64;
        self.inline.insert(offset, bytes);
        let ph = &mut self.image.phdrs[phdr];
        ph.p_offset = offset;
        ph.p_vaddr = vaddr;
        ph.p_paddr = vaddr;
        ph.p_filesz = size;
        ph.p_memsz = size;
        self.image.sync_phdr(phdr)?;

        let interp_shdr = self
            .image
            .shdrs
            .iter()
            .position(|s| s.sh_type == SHT_PROGBITS && s.sh_offset == old_offset);
        if let Some(idx) = interp_shdr {
            self.image.shdrs[idx].sh_offset = offset;
            self.image.shdrs[idx].sh_size = size;
            self.image.sync_shdr(idx)?;
        }
        Ok(())
    }

    fn place_strtab(&mut self, offset: u64, vaddr: u64) -> Result<()> {
        let old_offset = self.strtab.old_offset();
        let (table, resolved) = self.strtab.build();
        let size = table.len() as u64;
        for (dest, index) in resolved {
            self.apply_index(dest, index);
        }
        if let Some(idx) = self.image.dyn_index(DT_STRTAB) {
            self.image.dyns[idx].d_val = vaddr;
            self.dirty_tags.push(idx);
        }
        if let Some(idx) = self.image.dyn_index(DT_STRSZ) {
            self.image.dyns[idx].d_val = size;
            self.dirty_tags.push(idx);
        }
        let dynstr_shdr = self
            .image
            .shdrs
            .iter()
            .position(|s| s.sh_type == SHT_STRTAB && Some(s.sh_offset) == old_offset);
        if let Some(idx) = dynstr_shdr {
            self.image.shdrs[idx].sh_offset = offset;
            self.image.shdrs[idx].sh_addr = vaddr;
            self.image.shdrs[idx].sh_size = size;
            self.image.sync_shdr(idx)?;
        }
        self.inline.insert(offset, table);
        Ok(())
    }

    fn place_dynamic(&mut self, offset: u64, vaddr: u64, count: usize) -> Result<()> {
        let ctx = self.image.ctx;
        let entry_size = Dyn::size_with(&ctx);
        let live = self.live_dyn_count();

        let mut tags: Vec<Dyn> = Vec::with_capacity(count);
        tags.extend(self.image.dyns[..live].iter().cloned());
        tags.append(&mut self.appended);
        tags.push(Dyn {
            d_tag: DT_NULL,
            d_val: 0,
        });
        debug_assert_eq!(tags.len(), count);

        let mut buf = vec![0u8; count * entry_size];
        for (i, tag) in tags.iter().enumerate() {
            tag.clone().try_into_ctx(&mut buf[i * entry_size..], ctx)?;
        }
        self.inline.insert(offset, buf);

        let size = (count * entry_size) as u64;
        if let Some(idx) = self.image.phdr_index(PT_DYNAMIC) {
            let ph = &mut self.image.phdrs[idx];
            ph.p_offset = offset;
            ph.p_vaddr = vaddr;
            ph.p_paddr = vaddr;
            ph.p_filesz = size;
            ph.p_memsz = size;
            self.image.sync_phdr(idx)?;
        }
        let dynamic_shdr = self
            .image
            .shdrs
            .iter()
            .position(|s| s.sh_type == SHT_DYNAMIC);
        if let Some(idx) = dynamic_shdr {
            self.image.shdrs[idx].sh_offset = offset;
            self.image.shdrs[idx].sh_addr = vaddr;
            self.image.shdrs[idx].sh_size = size;
            self.image.sync_shdr(idx)?;
        }
        Ok(())
    }
}

fn copy_patch(out: &mut [u8], pos: usize, bytes: &[u8]) -> Result<()> {
    let end = pos + bytes.len();
    if end > out.len() {
        return Err(Error::Structural(format!(
            "patch at {pos:#x}..{end:#x} exceeds the output image ({:#x} bytes)",
            out.len()
        )));
    }
    out[pos..end].copy_from_slice(bytes);
    Ok(())
}
