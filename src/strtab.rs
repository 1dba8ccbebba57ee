//! Append-only dynamic string table editing.
//!
//! Many dynamic tags (DT_NEEDED, DT_SONAME, DT_RUNPATH, ...) hold indices
//! into DT_STRTAB and may alias one another's bytes, so existing strings
//! are never rewritten in place. New strings are deduplicated against the
//! current table and otherwise batched into a single appended extension,
//! with each requester told its final index once the layout is fixed.

use goblin::elf::dynamic::DT_STRTAB;

use crate::image::ElfImage;

/// Where a resolved string index is delivered: an existing dynamic tag,
/// or a tag waiting in the appended list.
#[derive(Clone, Copy, Debug)]
pub(crate) enum StrDest {
    Tag(usize),
    Appended(usize),
}

struct StrRequest {
    bytes: Vec<u8>,
    dest: StrDest,
}

struct Origin {
    offset: u64,
    image: Vec<u8>,
}

pub(crate) struct StringTable {
    origin: Option<Origin>,
    requests: Vec<StrRequest>,
}

impl StringTable {
    /// Reconstruct the DT_STRTAB image from the input bytes.
    ///
    /// The dynamic tag records only the table's start address, not its
    /// length, so the end is found by scanning forward while bytes are
    /// NUL or printable ASCII. This misreads a table that happens to be
    /// followed directly by printable data; the usual layout puts binary
    /// version or hash data right after `.dynstr`, which terminates the
    /// scan at the true boundary.
    pub fn from_image(image: &ElfImage) -> Self {
        let origin = image
            .dyns
            .iter()
            .find(|d| d.d_tag == DT_STRTAB)
            .and_then(|d| {
                let offset = image.offset_from_vma(d.d_val)?;
                let start = offset as usize;
                let mut end = start;
                while end < image.data.len() {
                    let b = image.data[end];
                    if b != 0 && !(0x20..=0x7e).contains(&b) {
                        break;
                    }
                    end += 1;
                }
                Some(Origin {
                    offset,
                    image: image.data[start..end].to_vec(),
                })
            });
        StringTable {
            origin,
            requests: Vec::new(),
        }
    }

    /// Ask for `s` to be available in the table. Returns the index right
    /// away when `s` (with its terminating NUL) already exists; otherwise
    /// the request is queued and `dest` receives the index during
    /// [`build`](Self::build).
    pub fn request(&mut self, s: &str, dest: StrDest) -> Option<u64> {
        let mut bytes = s.as_bytes().to_vec();
        bytes.push(0);
        if let Some(origin) = &self.origin {
            if let Some(idx) = find_substring(&origin.image, &bytes) {
                return Some(idx as u64);
            }
        }
        self.requests.push(StrRequest { bytes, dest });
        None
    }

    pub fn pending(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Total size of the extended table, or `None` when DT_STRTAB could
    /// not be located.
    pub fn need(&self) -> Option<u64> {
        let origin = self.origin.as_ref()?;
        let appended: usize = self.requests.iter().map(|r| r.bytes.len()).sum();
        Some((origin.image.len() + appended) as u64)
    }

    /// Pre-extension location of the table, for section-header matching.
    pub fn old_offset(&self) -> Option<u64> {
        self.origin.as_ref().map(|o| o.offset)
    }

    /// Lay out the extended table: the original image followed by every
    /// queued string. Returns the new table bytes and the resolved index
    /// for each request's destination.
    pub fn build(&mut self) -> (Vec<u8>, Vec<(StrDest, u64)>) {
        let mut table = self
            .origin
            .as_ref()
            .map(|o| o.image.clone())
            .unwrap_or_default();
        let mut resolved = Vec::with_capacity(self.requests.len());
        for request in self.requests.drain(..) {
            resolved.push((request.dest, table.len() as u64));
            table.extend_from_slice(&request.bytes);
        }
        (table, resolved)
    }
}

fn find_substring(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(image: &[u8]) -> StringTable {
        StringTable {
            origin: Some(Origin {
                offset: 0x300,
                image: image.to_vec(),
            }),
            requests: Vec::new(),
        }
    }

    #[test]
    fn request_hits_existing_string() {
        let mut table = table_with(b"\0libm.so.6\0libc.so.6\0");
        let idx = table.request("libc.so.6", StrDest::Tag(0));
        assert_eq!(idx, Some(11));
        assert!(!table.pending());
    }

    #[test]
    fn request_hits_aliased_suffix() {
        let mut table = table_with(b"\0libverylong.so\0");
        assert_eq!(table.request("long.so", StrDest::Tag(0)), Some(8));
    }

    #[test]
    fn empty_string_resolves_to_leading_nul() {
        let mut table = table_with(b"\0libc.so.6\0");
        assert_eq!(table.request("", StrDest::Tag(0)), Some(0));
    }

    #[test]
    fn misses_are_queued_and_appended_in_order() {
        let mut table = table_with(b"\0libc.so.6\0");
        assert_eq!(table.request("libfoo.so.1", StrDest::Tag(3)), None);
        assert_eq!(table.request("/opt/lib", StrDest::Appended(0)), None);
        assert!(table.pending());
        assert_eq!(table.need(), Some(11 + 12 + 9));

        let (bytes, resolved) = table.build();
        assert_eq!(&bytes[..11], b"\0libc.so.6\0");
        assert_eq!(&bytes[11..], b"libfoo.so.1\0/opt/lib\0");
        assert_eq!(resolved.len(), 2);
        assert_eq!(resolved[0].1, 11);
        assert_eq!(resolved[1].1, 23);
        assert!(!table.pending());
    }

    #[test]
    fn missing_strtab_cannot_size_the_extension() {
        let mut table = StringTable {
            origin: None,
            requests: Vec::new(),
        };
        assert_eq!(table.request("libx.so", StrDest::Tag(0)), None);
        assert_eq!(table.need(), None);
    }
}
