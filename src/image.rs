//! Parsed view of the input ELF plus the pending header-patch map.
//!
//! `ElfImage` clones the headers out of a [`goblin::elf::Elf`] so they can
//! be mutated without holding a borrow on the file bytes. Mutations are
//! made visible to the output writer through `sync_*` methods, which
//! re-serialize the mutated header at its original file offset into a
//! patch map. Those offsets are pre-extension: if the file is later grown,
//! the writer translates them through the memory manager.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use goblin::container::{Container, Ctx};
use goblin::elf::dynamic::{Dyn, DT_STRTAB};
use goblin::elf::header::Header;
use goblin::elf::program_header::{ProgramHeader, PT_DYNAMIC, PT_INTERP, PT_LOAD};
use goblin::elf::section_header::SectionHeader;
use goblin::elf::Elf;
use scroll::ctx::{SizeWith, TryIntoCtx};

use crate::error::{Error, Result};

pub(crate) struct ElfImage {
    pub data: Vec<u8>,
    pub header: Header,
    pub phdrs: Vec<ProgramHeader>,
    pub shdrs: Vec<SectionHeader>,
    pub dyns: Vec<Dyn>,
    pub ctx: Ctx,
    pub permissions: fs::Permissions,
    /// Header table offsets as parsed, before any extension shift.
    orig_phoff: u64,
    orig_shoff: u64,
    orig_dynamic_offset: Option<u64>,
    patches: BTreeMap<u64, Vec<u8>>,
}

impl ElfImage {
    pub fn open(path: &Path) -> Result<Self> {
        let data = fs::read(path)?;
        let permissions = fs::metadata(path)?.permissions();
        Self::parse(data, permissions)
    }

    fn parse(data: Vec<u8>, permissions: fs::Permissions) -> Result<Self> {
        let (header, phdrs, shdrs, dyns, ctx) = {
            let elf = Elf::parse(&data)?;
            let container = if elf.is_64 {
                Container::Big
            } else {
                Container::Little
            };
            let le = if elf.little_endian {
                scroll::Endian::Little
            } else {
                scroll::Endian::Big
            };
            let dyns = elf
                .dynamic
                .as_ref()
                .map(|d| d.dyns.clone())
                .unwrap_or_default();
            (
                elf.header,
                elf.program_headers.clone(),
                elf.section_headers.clone(),
                dyns,
                Ctx::new(container, le),
            )
        };
        let orig_dynamic_offset = phdrs
            .iter()
            .find(|p| p.p_type == PT_DYNAMIC)
            .map(|p| p.p_offset);

        Ok(ElfImage {
            orig_phoff: header.e_phoff,
            orig_shoff: header.e_shoff,
            orig_dynamic_offset,
            data,
            header,
            phdrs,
            shdrs,
            dyns,
            ctx,
            permissions,
            patches: BTreeMap::new(),
        })
    }

    /// Translate a virtual address to a file offset through the PT_LOAD
    /// table. Only file-backed bytes translate; addresses inside a bss
    /// tail have no offset.
    pub fn offset_from_vma(&self, vaddr: u64) -> Option<u64> {
        self.phdrs
            .iter()
            .filter(|p| p.p_type == PT_LOAD)
            .find(|p| vaddr >= p.p_vaddr && vaddr < p.p_vaddr + p.p_filesz)
            .map(|p| p.p_offset + (vaddr - p.p_vaddr))
    }

    pub fn phdr_index(&self, p_type: u32) -> Option<usize> {
        self.phdrs.iter().position(|p| p.p_type == p_type)
    }

    pub fn dyn_index(&self, tag: u64) -> Option<usize> {
        self.dyns.iter().position(|d| d.d_tag == tag)
    }

    /// Read the NUL-terminated string at `index` into the dynamic string
    /// table, if both the table and the string exist.
    pub fn dyn_string(&self, index: u64) -> Option<String> {
        let strtab = self.dyns.iter().find(|d| d.d_tag == DT_STRTAB)?;
        let start = self.offset_from_vma(strtab.d_val)? as usize + index as usize;
        if start >= self.data.len() {
            return None;
        }
        let end = self.data[start..].iter().position(|&b| b == 0)? + start;
        Some(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }

    /// The current interpreter, read from PT_INTERP contents.
    pub fn interpreter(&self) -> Option<String> {
        let ph = &self.phdrs[self.phdr_index(PT_INTERP)?];
        let start = ph.p_offset as usize;
        let bytes = self.data.get(start..start + ph.p_filesz as usize)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }

    pub fn patches(&self) -> &BTreeMap<u64, Vec<u8>> {
        &self.patches
    }

    pub fn sync_header(&mut self) -> Result<()> {
        let size = if self.ctx.container.is_big() {
            goblin::elf64::header::SIZEOF_EHDR
        } else {
            goblin::elf32::header::SIZEOF_EHDR
        };
        let mut buf = vec![0u8; size];
        self.header.try_into_ctx(&mut buf[..], self.ctx.le)?;
        self.patches.insert(0, buf);
        Ok(())
    }

    pub fn sync_phdr(&mut self, idx: usize) -> Result<()> {
        let size = ProgramHeader::size_with(&self.ctx);
        let mut buf = vec![0u8; size];
        self.phdrs[idx].clone().try_into_ctx(&mut buf[..], self.ctx)?;
        self.patches.insert(self.orig_phoff + (idx * size) as u64, buf);
        Ok(())
    }

    pub fn sync_shdr(&mut self, idx: usize) -> Result<()> {
        let size = SectionHeader::size_with(&self.ctx);
        let mut buf = vec![0u8; size];
        self.shdrs[idx].clone().try_into_ctx(&mut buf[..], self.ctx)?;
        self.patches.insert(self.orig_shoff + (idx * size) as u64, buf);
        Ok(())
    }

    /// Re-serialize dynamic tag `idx` at its original position inside
    /// PT_DYNAMIC. Only valid while the dynamic segment has not been
    /// relocated; a relocated segment is rewritten wholesale instead.
    pub fn sync_dyn(&mut self, idx: usize) -> Result<()> {
        let base = self.orig_dynamic_offset.ok_or_else(|| {
            Error::Structural("dynamic tag patched without a PT_DYNAMIC segment".into())
        })?;
        let size = Dyn::size_with(&self.ctx);
        let mut buf = vec![0u8; size];
        self.dyns[idx].clone().try_into_ctx(&mut buf[..], self.ctx)?;
        self.patches.insert(base + (idx * size) as u64, buf);
        Ok(())
    }
}
