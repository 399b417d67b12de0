//! The address sorted segment index of a [`Dwfl`][crate::Dwfl]
//! context.
//!
//! The table is a sorted list of boundaries. Each boundary starts a
//! span that extends to the next one and records the segment index
//! reported for it (or -1 for gaps) as well as the owning module, once
//! the table got reified from the module registry.

use std::ops::Range;

use crate::elf::types::Phdr;
use crate::log::trace;
use crate::module::ModuleId;
use crate::util::align_down_u64;
use crate::util::align_up_u64;
use crate::util::find_match_or_lower_bound;
use crate::Addr;


/// State of the last reported segment, used for coalescing.
#[derive(Clone, Debug, Default)]
struct Tail {
    ident: Box<[u8]>,
    /// The end address of the last segment.
    vaddr: Addr,
    /// The file offset corresponding to `vaddr`.
    offset: u64,
    /// The next expected segment index.
    ndx: i32,
}


#[derive(Debug, Default)]
pub(crate) struct SegmentTable {
    /// Sorted boundary addresses.
    starts: Vec<Addr>,
    /// Reported segment index per boundary, -1 for gaps.
    segndx: Vec<i32>,
    /// Owning module per boundary.
    modules: Vec<Option<ModuleId>>,
    tail: Tail,
    /// Finest segment alignment seen; zero if unset.
    align: u64,
    /// Whether module ownership is current.
    reified: bool,
}

impl SegmentTable {
    /// Forget about all segments.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Mark module ownership as stale.
    #[inline]
    pub fn invalidate(&mut self) {
        self.reified = false;
    }

    #[inline]
    pub fn is_reified(&self) -> bool {
        self.reified
    }

    #[inline]
    pub fn align(&self) -> u64 {
        self.align
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// Make sure a boundary at `addr` exists, returning its index.
    ///
    /// A new boundary inherits the segment and module of the span it
    /// splits.
    fn split_at(&mut self, addr: Addr) -> usize {
        match self.starts.binary_search(&addr) {
            Ok(idx) => idx,
            Err(idx) => {
                let (ndx, module) = if let Some(prev) = idx.checked_sub(1) {
                    (self.segndx[prev], self.modules[prev])
                } else {
                    (-1, None)
                };
                let () = self.starts.insert(idx, addr);
                let () = self.segndx.insert(idx, ndx);
                let () = self.modules.insert(idx, module);
                idx
            }
        }
    }

    /// Remove boundaries in `range` that do not change anything.
    fn compact(&mut self, range: Range<usize>) {
        let end = range.end.min(self.starts.len());
        let mut write = range.start.max(1);
        if write >= end {
            return
        }

        for read in write..end {
            if self.segndx[read] == self.segndx[write - 1]
                && self.modules[read] == self.modules[write - 1]
            {
                continue
            }
            self.starts[write] = self.starts[read];
            self.segndx[write] = self.segndx[read];
            self.modules[write] = self.modules[read];
            write += 1;
        }

        let _starts = self.starts.drain(write..end);
        let _segndx = self.segndx.drain(write..end);
        let _modules = self.modules.drain(write..end);
    }

    /// Set the segment index of all spans in `[start, end)`, returning
    /// the indices of the boundaries touched.
    fn insert(&mut self, start: Addr, end: Addr, ndx: i32) -> Range<usize> {
        if start >= end {
            return 0..0
        }
        let first = self.split_at(start);
        let last = self.split_at(end);
        self.segndx[first..last].fill(ndx);
        first..last + 1
    }

    /// Record a segment described by `phdr`, loaded with `bias`.
    ///
    /// A negative `ndx` means the segment following the last one
    /// reported. Segments that continue the last one, i.e., that have
    /// the same non-empty `ident`, start where it ended, and continue
    /// its file offset, are merged into it.
    pub fn report(&mut self, ndx: i32, phdr: &Phdr, bias: Addr, ident: &[u8]) -> i32 {
        let ndx = if ndx < 0 { self.tail.ndx } else { ndx };

        if phdr.p_align > 1 && (self.align <= 1 || phdr.p_align < self.align) {
            self.align = phdr.p_align;
        }

        let vaddr = bias.wrapping_add(phdr.p_vaddr);
        let start = align_down_u64(vaddr, self.align);
        let end = align_up_u64(vaddr.wrapping_add(phdr.p_memsz), self.align);

        let coalesce = ndx == self.tail.ndx
            && !ident.is_empty()
            && *ident == *self.tail.ident
            && start == self.tail.vaddr
            && phdr.p_offset == self.tail.offset;

        if coalesce {
            trace!("coalescing segment {ndx} ({start:#x}-{end:#x}) into its predecessor");
            let prev = match self.starts.binary_search(&start) {
                Ok(idx) => idx.checked_sub(1).map(|idx| self.segndx[idx]),
                Err(idx) => idx.checked_sub(1).map(|idx| self.segndx[idx]),
            };
            let touched = self.insert(start, end, prev.unwrap_or(ndx));
            let () = self.compact(touched);
        } else {
            let _touched = self.insert(start, end, ndx);
        }

        self.tail = Tail {
            ident: Box::from(ident),
            vaddr: end,
            offset: end
                .wrapping_sub(bias)
                .wrapping_sub(phdr.p_vaddr)
                .wrapping_add(phdr.p_offset),
            ndx: ndx + 1,
        };
        self.reified = false;
        ndx
    }

    /// Assign modules to the spans they cover.
    ///
    /// `modules` yields `(id, low, high)` for each live module in list
    /// order. Ranges are rounded outward to the segment alignment,
    /// unless that would take spans away from another module. The index
    /// of the first span covering each module is reported back.
    pub fn reify<I>(&mut self, modules: I) -> Vec<(ModuleId, usize)>
    where
        I: IntoIterator<Item = (ModuleId, Addr, Addr)>,
    {
        let modules = modules.into_iter().collect::<Vec<_>>();
        self.modules.fill(None);

        for &(id, low, high) in &modules {
            if low >= high {
                continue
            }
            let first = self.split_at(low);
            let last = self.split_at(high);
            self.modules[first..last].fill(Some(id));
        }

        if self.align > 1 {
            for &(id, low, high) in &modules {
                if low >= high {
                    continue
                }
                let start = align_down_u64(low, self.align);
                let end = align_up_u64(high, self.align);
                for (from, to) in [(start, low), (high, end)] {
                    if from >= to {
                        continue
                    }
                    let first = self.split_at(from);
                    let last = self.split_at(to);
                    for module in &mut self.modules[first..last] {
                        if module.is_none() {
                            *module = Some(id);
                        }
                    }
                }
            }
        }

        let mut backrefs = Vec::with_capacity(modules.len());
        for (idx, module) in self.modules.iter().enumerate() {
            if let Some(id) = module {
                if !backrefs.iter().any(|(other, _idx)| other == id) {
                    let () = backrefs.push((*id, idx));
                }
            }
        }

        trace!(
            "reified segment table with {} entries for {} modules",
            self.starts.len(),
            modules.len()
        );
        self.reified = true;
        backrefs
    }

    /// Look up the segment and module covering `addr`.
    ///
    /// `high_of` retrieves the end address of a module; it is used to
    /// attribute an address right at the end of a module to it.
    pub fn lookup<F>(&self, addr: Addr, high_of: F) -> Option<(i32, Option<ModuleId>)>
    where
        F: Fn(ModuleId) -> Option<Addr>,
    {
        let idx = find_match_or_lower_bound(&self.starts, addr)?;
        let ndx = self.segndx[idx];
        let module = self.modules[idx];

        if module.is_none() && self.starts[idx] == addr {
            if let Some(prev) = idx.checked_sub(1).and_then(|prev| self.modules[prev]) {
                if high_of(prev) == Some(addr) {
                    return Some((self.segndx[idx - 1], Some(prev)))
                }
            }
        }
        Some((ndx, module))
    }

    /// Retrieve the boundary at `idx`, along with its segment index
    /// and module.
    pub fn entry(&self, idx: usize) -> Option<(Addr, i32, Option<ModuleId>)> {
        Some((
            *self.starts.get(idx)?,
            self.segndx[idx],
            self.modules[idx],
        ))
    }
}
