//! The user-facing patching facade.

use std::path::{Path, PathBuf};

use goblin::elf::dynamic::{DT_NEEDED, DT_RPATH, DT_RUNPATH, DT_SONAME};
use goblin::elf::program_header::PT_INTERP;
use log::warn;

use crate::error::{Error, Result};
use crate::image::ElfImage;
use crate::saver::Saver;

/// Rewrites the interpreter, SONAME and runpath of an ELF binary.
///
/// Edits accumulate in a pending set and are applied together by
/// [`save`](Patcher::save), which re-reads the input so that repeated
/// saves are deterministic. Requests that cannot apply to the input (no
/// PT_INTERP to rewrite, no DT_SONAME to rename) are dropped with a
/// warning instead of failing.
pub struct Patcher {
    input: PathBuf,
    image: ElfImage,
    interpreter: Option<String>,
    soname: Option<String>,
    runpath: Option<String>,
    force_rpath: bool,
}

impl Patcher {
    /// Parse `path` and prepare an empty pending-edit set.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let input = path.as_ref().to_path_buf();
        let image = ElfImage::open(&input)?;
        Ok(Patcher {
            input,
            image,
            interpreter: None,
            soname: None,
            runpath: None,
            force_rpath: false,
        })
    }

    /// Record a new program interpreter. Ignored (with a warning) when the
    /// input has no PT_INTERP segment.
    pub fn set_interpreter(&mut self, interp: &str) -> Result<()> {
        if interp.is_empty() {
            return Err(Error::InvalidArgument("interpreter must not be empty"));
        }
        if self.image.phdr_index(PT_INTERP).is_none() {
            warn!("no PT_INTERP segment found, interpreter request ignored");
            return Ok(());
        }
        self.interpreter = Some(interp.to_string());
        Ok(())
    }

    /// Record a new SONAME. Ignored (with a warning) when the input has no
    /// DT_SONAME entry to rename.
    pub fn set_soname(&mut self, soname: &str) -> Result<()> {
        if soname.is_empty() {
            return Err(Error::InvalidArgument("soname must not be empty"));
        }
        if self.image.dyn_index(DT_SONAME).is_none() {
            warn!("Entry DT_SONAME not found, not a shared library?");
            return Ok(());
        }
        self.soname = Some(soname.to_string());
        Ok(())
    }

    /// Record a new runpath. Always accepted: a missing tag is created on
    /// save. The empty string is a valid runpath.
    pub fn set_runpath(&mut self, runpath: &str) -> Result<()> {
        self.runpath = Some(runpath.to_string());
        Ok(())
    }

    /// Switch every later runpath read and write from DT_RUNPATH to the
    /// older DT_RPATH tag. Sticky.
    pub fn use_rpath(&mut self) {
        self.force_rpath = true;
    }

    /// The pending interpreter if one was set, else the PT_INTERP contents.
    pub fn interpreter(&self) -> Option<String> {
        if let Some(interp) = &self.interpreter {
            return Some(interp.clone());
        }
        let current = self.image.interpreter();
        if current.is_none() {
            warn!("no PT_INTERP segment found");
        }
        current
    }

    /// The pending SONAME if one was set, else the DT_SONAME string.
    pub fn soname(&self) -> Option<String> {
        if let Some(soname) = &self.soname {
            return Some(soname.clone());
        }
        let current = self
            .image
            .dyn_index(DT_SONAME)
            .and_then(|idx| self.image.dyn_string(self.image.dyns[idx].d_val));
        if current.is_none() {
            warn!("Entry DT_SONAME not found, not a shared library?");
        }
        current
    }

    /// The pending runpath if one was set, else the DT_RUNPATH (or
    /// DT_RPATH under [`use_rpath`](Patcher::use_rpath)) string.
    pub fn runpath(&self) -> Option<String> {
        if let Some(runpath) = &self.runpath {
            return Some(runpath.clone());
        }
        let tag = if self.force_rpath { DT_RPATH } else { DT_RUNPATH };
        let current = self
            .image
            .dyn_index(tag)
            .and_then(|idx| self.image.dyn_string(self.image.dyns[idx].d_val));
        if current.is_none() {
            if self.force_rpath {
                warn!("Entry DT_RPATH not found");
            } else {
                warn!("Entry DT_RUNPATH not found");
            }
        }
        current
    }

    /// The DT_NEEDED names, in tag order. Never affected by edits.
    pub fn needed(&self) -> Vec<String> {
        self.image
            .dyns
            .iter()
            .filter(|d| d.d_tag == DT_NEEDED)
            .filter_map(|d| self.image.dyn_string(d.d_val))
            .collect()
    }

    /// Apply the pending edits and write the result to `out`, or over the
    /// input when `out` is `None`. With nothing pending and no explicit
    /// output path this is a no-op; with an explicit path the input is
    /// reproduced there. Permission bits are copied from the input after
    /// the content write.
    pub fn save(&self, out: Option<&Path>) -> Result<()> {
        let pending =
            self.interpreter.is_some() || self.soname.is_some() || self.runpath.is_some();
        if out.is_none() && !pending {
            return Ok(());
        }
        let out_path = out.unwrap_or(&self.input);

        let image = ElfImage::open(&self.input)?;
        let mut saver = Saver::new(image);
        if let Some(interp) = &self.interpreter {
            saver.patch_interpreter(interp)?;
        }
        saver.patch_dynamic(
            self.soname.as_deref(),
            self.runpath.as_deref(),
            self.force_rpath,
        )?;
        saver.finalize_strtab()?;
        saver.expand_dynamic();
        saver.dispatch()?;
        saver.write(out_path)
    }
}
