//! # elfpatch
//!
//! Rewrite the installed loader fields of an ELF binary: the program
//! interpreter (PT_INTERP), the shared-object name (DT_SONAME), and the
//! runtime library search path (DT_RUNPATH or DT_RPATH).
//!
//! The patcher edits the file image directly, without linking against the
//! target. Strings that fit in their existing slots are rewritten in
//! place; anything larger is stored in a fresh page-aligned region that
//! becomes loadable either through a spare program-header slot or by
//! growing the trailing PT_LOAD, so the output stays acceptable to the
//! kernel loader. The dynamic string table only ever grows: existing
//! entries keep their indices because other tags may alias them.
//!
//! ## Example
//!
//! ```no_run
//! use elfpatch::Patcher;
//!
//! let mut patcher = Patcher::open("target/release/libfoo.so")?;
//! patcher.set_soname("libfoo.so.1")?;
//! patcher.set_runpath("$ORIGIN/../lib")?;
//! patcher.save(None)?;
//! # Ok::<(), elfpatch::Error>(())
//! ```
//!
//! Reads work the same way, reflecting pending edits:
//!
//! ```no_run
//! use elfpatch::Patcher;
//!
//! let patcher = Patcher::open("/bin/ls")?;
//! println!("{:?}", patcher.interpreter());
//! println!("{:?}", patcher.needed());
//! # Ok::<(), elfpatch::Error>(())
//! ```

mod error;
mod image;
mod mm;
mod patcher;
mod saver;
mod strtab;

pub use error::{Error, Result};
pub use patcher::Patcher;
