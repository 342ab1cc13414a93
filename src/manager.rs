//! The `PageTableManager` is the process-wide registry: it owns every
//! page table, the four interval-state sets of the shared physical
//! address space, the allocation records, and the one RNG every random
//! placement draws from.
//!
//! Page tables call nothing back; every operation that must touch a VA
//! side and the PA side at once is a method here, keyed by page-table
//! name.  Registration order is iteration order, so a fixed seed and a
//! fixed call sequence reproduce a layout bit for bit.
use std::fmt;
use std::sync::Mutex;

use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::{Error, Result};
use crate::interval::{meta, Metadata};
use crate::interval_set::{align_down, align_up, IntervalSet};
use crate::page::{
    Cacheability, ExecutionContext, Page, PageSize, PageType, Permissions, Shareability,
};
use crate::page_table::PageTable;
use crate::{CROSS_CORE_PAGE_SIZE, PA_BASE, PA_SIZE};

/// Inputs for a page allocation.  Only the page type is mandatory; the
/// rest defaults per the engine contract (random size among 4K/2M,
/// size-implied alignment, RWX, write-back, non-shareable, one page).
#[derive(Clone, Debug)]
pub struct PageRequest {
    pub page_type: PageType,
    pub size: Option<PageSize>,
    pub alignment_bits: Option<u8>,
    pub permissions: Permissions,
    pub cacheable: Cacheability,
    pub shareable: Shareability,
    pub custom_attributes: Metadata,
    pub sequential_page_count: usize,
    pub va_eq_pa: bool,
}

impl PageRequest {
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            size: None,
            alignment_bits: None,
            permissions: Permissions::RWX,
            cacheable: Cacheability::WriteBack,
            shareable: Shareability::NonShareable,
            custom_attributes: Metadata::new(),
            sequential_page_count: 1,
            va_eq_pa: false,
        }
    }

    pub fn size(mut self, size: PageSize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn alignment_bits(mut self, bits: u8) -> Self {
        self.alignment_bits = Some(bits);
        self
    }

    pub fn permissions(mut self, permissions: Permissions) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn cacheable(mut self, cacheable: Cacheability) -> Self {
        self.cacheable = cacheable;
        self
    }

    pub fn shareable(mut self, shareable: Shareability) -> Self {
        self.shareable = shareable;
        self
    }

    pub fn sequential(mut self, count: usize) -> Self {
        self.sequential_page_count = count;
        self
    }

    pub fn va_eq_pa(mut self, identity: bool) -> Self {
        self.va_eq_pa = identity;
        self
    }

    pub fn attribute(mut self, key: &str, value: impl Into<crate::MetaValue>) -> Self {
        self.custom_attributes.insert(key.to_string(), value.into());
        self
    }
}

/// One segment-sized VA/PA range and the contiguous pages backing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryAllocation {
    va_start: u64,
    pa_start: u64,
    size: u64,
    page_type: PageType,
    covered_pages: Vec<Page>,
}

impl MemoryAllocation {
    pub(crate) fn new(
        va_start: u64,
        pa_start: u64,
        size: u64,
        page_type: PageType,
        covered_pages: Vec<Page>,
    ) -> Self {
        Self {
            va_start,
            pa_start,
            size,
            page_type,
            covered_pages,
        }
    }

    pub fn va_start(&self) -> u64 {
        self.va_start
    }

    pub fn pa_start(&self) -> u64 {
        self.pa_start
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn covered_pages(&self) -> &[Page] {
        &self.covered_pages
    }
}

impl fmt::Display for MemoryAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MemoryAllocation(VA:{:#x}, PA:{:#x}, size:{:#x}, {}, spans {} pages)",
            self.va_start,
            self.pa_start,
            self.size,
            self.page_type,
            self.covered_pages.len(),
        )
    }
}

/// The four interval-state sets of the shared physical space.
pub(crate) struct PhysicalSpace {
    pub(crate) unmapped: IntervalSet,
    pub(crate) mapped: IntervalSet,
    pub(crate) non_allocated: IntervalSet,
    pub(crate) allocated: IntervalSet,
}

impl PhysicalSpace {
    fn new() -> Self {
        let tags = |state: &str| meta([("state", state.into()), ("space", "pa".into())]);
        Self {
            unmapped: IntervalSet::with_region(PA_BASE, PA_SIZE, tags("unmapped")),
            mapped: IntervalSet::with_default_metadata(tags("mapped")),
            non_allocated: IntervalSet::with_default_metadata(tags("non_allocated")),
            allocated: IntervalSet::with_default_metadata(tags("allocated")),
        }
    }

    /// Moves `[pa, pa + size)` unmapped → mapped ∧ non-allocated.  The
    /// non-allocated region is tagged with the page type and its owner
    /// (or a `cross_core` flag when every table shares it).
    pub(crate) fn record_mapping(&mut self, pa: u64, size: u64, page_type: PageType, owner: Option<&str>) {
        let mut tags = meta([("page_type", page_type.into())]);
        match owner {
            Some(name) => {
                tags.insert("page_table".to_string(), name.into());
            }
            None => {
                tags.insert("cross_core".to_string(), true.into());
            }
        }

        self.unmapped.remove_region(pa, size);
        self.mapped.add_region(pa, size, None);
        self.non_allocated.add_region(pa, size, Some(tags));
    }
}

pub struct PageTableManager {
    pub(crate) pa: PhysicalSpace,
    pub(crate) page_tables: Vec<PageTable>,
    pub(crate) allocations: Vec<MemoryAllocation>,
    pub(crate) rng: ChaCha8Rng,
    seed: u64,
    pub(crate) cross_core_segment_count: u64,
}

impl PageTableManager {
    pub fn new(seed: u64) -> Self {
        info!("initializing page table manager with seed {:#x}", seed);
        Self {
            pa: PhysicalSpace::new(),
            page_tables: Vec::new(),
            allocations: Vec::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            seed,
            cross_core_segment_count: 0,
        }
    }

    /// Drops every page table and allocation and restarts the RNG.
    pub fn reset(&mut self, seed: u64) {
        *self = PageTableManager::new(seed);
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    // Registry.

    /// Creates and registers a page table.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateName` when the name is taken.
    pub fn create_page_table(
        &mut self,
        name: &str,
        core_id: &str,
        execution_context: ExecutionContext,
    ) -> Result<&PageTable> {
        if self.page_tables.iter().any(|table| table.name() == name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        info!(
            "registering page table '{}' for core '{}' at {}",
            name, core_id, execution_context
        );
        self.page_tables
            .push(PageTable::new(name, core_id, execution_context));
        Ok(self.page_tables.last().expect("just pushed"))
    }

    pub fn get_page_table(&self, name: &str) -> Result<&PageTable> {
        self.page_tables
            .iter()
            .find(|table| table.name() == name)
            .ok_or_else(|| Error::UnknownPageTable(name.to_string()))
    }

    pub fn get_all_page_tables(&self) -> &[PageTable] {
        &self.page_tables
    }

    pub fn get_core_page_tables(&self, core_id: &str) -> Vec<&PageTable> {
        self.page_tables
            .iter()
            .filter(|table| table.core_id() == core_id)
            .collect()
    }

    pub(crate) fn page_table_index(&self, name: &str) -> Result<usize> {
        self.page_tables
            .iter()
            .position(|table| table.name() == name)
            .ok_or_else(|| Error::UnknownPageTable(name.to_string()))
    }

    // Physical space.

    /// Carves a block out of the unmapped physical space.
    ///
    /// # Errors
    ///
    /// `Error::OutOfPa` when no unmapped interval can host it.
    pub fn allocate_pa_interval(
        &mut self,
        size: u64,
        alignment_bits: Option<u8>,
    ) -> Result<(u64, u64)> {
        self.pa
            .unmapped
            .find_and_remove(size, alignment_bits, None, &mut self.rng)
            .map_err(|_| Error::OutOfPa {
                size,
                alignment_bits,
            })
    }

    /// Binds a VA region of a page table to a PA region: both sides
    /// move unmapped → mapped ∧ non-allocated, tagged with `page_type`.
    pub fn map_va_to_pa(
        &mut self,
        page_table: &str,
        va: u64,
        pa: u64,
        size: u64,
        page_type: PageType,
    ) -> Result<()> {
        let index = self.page_table_index(page_table)?;
        self.record_mapping(index, va, pa, size, page_type);
        Ok(())
    }

    fn record_mapping(&mut self, index: usize, va: u64, pa: u64, size: u64, page_type: PageType) {
        debug!(
            "mapping VA:{:#x} to PA:{:#x}, size:{:#x}, type:{}",
            va, pa, size, page_type
        );
        let table = &mut self.page_tables[index];
        let owner = table.name().to_string();
        table.record_va_mapping(va, size, page_type);
        self.pa.record_mapping(pa, size, page_type, Some(&owner));
    }

    pub fn unmapped_pa(&self) -> &IntervalSet {
        &self.pa.unmapped
    }

    pub fn mapped_pa(&self) -> &IntervalSet {
        &self.pa.mapped
    }

    pub fn non_allocated_pa(&self) -> &IntervalSet {
        &self.pa.non_allocated
    }

    pub fn allocated_pa(&self) -> &IntervalSet {
        &self.pa.allocated
    }

    pub fn allocations(&self) -> &[MemoryAllocation] {
        &self.allocations
    }

    // Page allocation.

    /// Allocates `sequential_page_count` VA- and PA-contiguous pages in
    /// the named page table.
    pub fn allocate_pages(&mut self, page_table: &str, request: &PageRequest) -> Result<Vec<Page>> {
        let index = self.page_table_index(page_table)?;
        debug!(
            "allocate_pages for '{}': type={}, size={:?}, count={}, va_eq_pa={}",
            page_table,
            request.page_type,
            request.size,
            request.sequential_page_count,
            request.va_eq_pa
        );

        let size = match request.size {
            Some(PageSize::Size1G) => {
                return Err(Error::InvalidArgument(
                    "1 GiB pages are declared but not yet supported".to_string(),
                ))
            }
            Some(size) => size,
            None => [PageSize::Size4K, PageSize::Size2M][self.rng.gen_range(0..2)],
        };

        let minimum = size.alignment_bits();
        let alignment_bits = match request.alignment_bits {
            Some(requested) if requested < minimum => {
                return Err(Error::InvalidAlignment { requested, minimum })
            }
            Some(requested) => requested,
            None => minimum,
        };

        if request.sequential_page_count == 0 {
            return Err(Error::InvalidArgument(
                "sequential_page_count must be positive".to_string(),
            ));
        }
        let total = size.bytes() * request.sequential_page_count as u64;

        let (va_start, pa_start) = if request.va_eq_pa {
            let start = self.claim_identity_unmapped(index, total, alignment_bits)?;
            (start, start)
        } else {
            let table = &mut self.page_tables[index];
            let (va_start, _) = table
                .unmapped_va
                .find_and_remove(total, Some(alignment_bits), None, &mut self.rng)
                .map_err(|_| Error::OutOfVa {
                    size: total,
                    alignment_bits: Some(alignment_bits),
                })?;

            match self
                .pa
                .unmapped
                .find_and_remove(total, Some(alignment_bits), None, &mut self.rng)
            {
                Ok((pa_start, _)) => (va_start, pa_start),
                Err(_) => {
                    // Roll the VA claim back before surfacing.
                    self.page_tables[index]
                        .unmapped_va
                        .add_region(va_start, total, None);
                    return Err(Error::OutOfPa {
                        size: total,
                        alignment_bits: Some(alignment_bits),
                    });
                }
            }
        };

        self.record_mapping(index, va_start, pa_start, total, request.page_type);

        let table = &mut self.page_tables[index];
        let mut pages = Vec::with_capacity(request.sequential_page_count);
        for i in 0..request.sequential_page_count as u64 {
            let page = Page::new(
                va_start + i * size.bytes(),
                pa_start + i * size.bytes(),
                size,
                request.page_type,
                request.permissions,
                request.cacheable,
                request.shareable,
                table.execution_context(),
                request.custom_attributes.clone(),
                false,
            );
            table.push_page(page.clone());
            pages.push(page);
        }
        Ok(pages)
    }

    /// Finds an address that is free in both the table's unmapped VA
    /// space and the global unmapped PA space, then removes it from
    /// both sides.  Overlap windows and aligned slots within them are
    /// chosen uniformly.
    ///
    /// # Errors
    ///
    /// `Error::OutOfIdentityRegion` when no same-address window of
    /// `size` bytes survives the alignment.
    fn claim_identity_unmapped(&mut self, index: usize, size: u64, alignment_bits: u8) -> Result<u64> {
        let alignment = 1u64 << alignment_bits;
        let mut windows: Vec<(u64, u64)> = Vec::new();
        {
            let table = &self.page_tables[index];
            for va in table.unmapped_va.get_intervals(None) {
                for pa in self.pa.unmapped.get_intervals(None) {
                    let overlap_start = va.start().max(pa.start());
                    let overlap_last = va.last().min(pa.last());
                    if overlap_start > overlap_last {
                        continue;
                    }
                    let overlap_size = overlap_last - overlap_start + 1;
                    if overlap_size < size {
                        continue;
                    }

                    let first_aligned = align_up(overlap_start, alignment);
                    let last_aligned = align_down(overlap_start + overlap_size - size, alignment);
                    if first_aligned <= last_aligned {
                        windows.push((first_aligned, last_aligned));
                    }
                }
            }
        }

        if windows.is_empty() {
            return Err(Error::OutOfIdentityRegion { size });
        }

        let (first, last) = windows[self.rng.gen_range(0..windows.len())];
        let slots = (last - first) / alignment + 1;
        let start = first + self.rng.gen_range(0..slots) * alignment;
        debug!("identity claim at {:#x} ({} bytes)", start, size);

        self.page_tables[index].unmapped_va.remove_region(start, size);
        self.pa.unmapped.remove_region(start, size);
        Ok(start)
    }

    /// Single-page convenience form of `allocate_pages`.
    pub fn allocate_page(&mut self, page_table: &str, request: &PageRequest) -> Result<Page> {
        if request.sequential_page_count != 1 {
            return Err(Error::InvalidArgument(
                "allocate_page takes a single-page request; use allocate_pages".to_string(),
            ));
        }
        let mut pages = self.allocate_pages(page_table, request)?;
        Ok(pages.remove(0))
    }

    /// Allocates one shared 2 MiB DATA page: one physical block, one
    /// independently placed VA mapping per registered page table.  The
    /// operation is atomic; a table running out of VA space rolls every
    /// claim back.
    pub fn allocate_cross_core_page(&mut self) -> Result<Vec<Page>> {
        if self.page_tables.is_empty() {
            return Err(Error::InvalidArgument(
                "cross-core pages need at least one registered page table".to_string(),
            ));
        }

        let size = CROSS_CORE_PAGE_SIZE;
        let bytes = size.bytes();
        let alignment_bits = size.alignment_bits();
        debug!("allocate_cross_core_page: {} bytes across {} tables", bytes, self.page_tables.len());

        let (pa_start, _) = self
            .pa
            .unmapped
            .find_and_remove(bytes, Some(alignment_bits), None, &mut self.rng)
            .map_err(|_| Error::OutOfPa {
                size: bytes,
                alignment_bits: Some(alignment_bits),
            })?;

        // Phase 1: claim a VA block in every table.
        let mut claims = Vec::with_capacity(self.page_tables.len());
        for index in 0..self.page_tables.len() {
            let table = &mut self.page_tables[index];
            match table
                .unmapped_va
                .find_and_remove(bytes, Some(alignment_bits), None, &mut self.rng)
            {
                Ok((va_start, _)) => claims.push((index, va_start)),
                Err(_) => {
                    for (claimed, va) in claims {
                        self.page_tables[claimed]
                            .unmapped_va
                            .add_region(va, bytes, None);
                    }
                    self.pa.unmapped.add_region(pa_start, bytes, None);
                    return Err(Error::OutOfVa {
                        size: bytes,
                        alignment_bits: Some(alignment_bits),
                    });
                }
            }
        }

        // Phase 2: record the shared PA once, then fan the VA side out.
        self.pa
            .record_mapping(pa_start, bytes, PageType::Data, None);

        let mut pages = Vec::with_capacity(claims.len());
        for (index, va_start) in claims {
            let table = &mut self.page_tables[index];
            table.record_va_mapping(va_start, bytes, PageType::Data);
            let page = Page::new(
                va_start,
                pa_start,
                size,
                PageType::Data,
                Permissions::RWX,
                Cacheability::WriteBack,
                Shareability::NonShareable,
                table.execution_context(),
                Metadata::new(),
                true,
            );
            table.push_page(page.clone());
            pages.push(page);
        }

        info!(
            "created cross-core page at PA {:#x} across {} page tables",
            pa_start,
            pages.len()
        );
        Ok(pages)
    }

    /// Random probe of a table's unmapped VA space, without mutation.
    pub fn find_available_region(
        &mut self,
        page_table: &str,
        size: u64,
        alignment_bits: Option<u8>,
    ) -> Result<Option<(u64, u64)>> {
        let index = self.page_table_index(page_table)?;
        let table = &self.page_tables[index];
        Ok(table
            .unmapped_va
            .find_region(size, alignment_bits, None, &mut self.rng))
    }

    // Segment allocation core.

    /// Carves `size` bytes out of the table's mapped, non-allocated
    /// space of `page_type`, narrowing both the VA and PA accounting.
    pub fn allocate_segment(
        &mut self,
        page_table: &str,
        size: u64,
        page_type: PageType,
        alignment_bits: Option<u8>,
        va_eq_pa: bool,
    ) -> Result<MemoryAllocation> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "segment size must be positive".to_string(),
            ));
        }
        let index = self.page_table_index(page_table)?;

        let (va_start, pa_start, covered_pages) = if va_eq_pa {
            self.find_identity_segment(index, size, page_type, alignment_bits)?
        } else {
            self.find_segment_candidate(index, size, page_type, alignment_bits)?
        };

        self.mark_allocated(index, va_start, pa_start, size, page_type);

        let allocation = MemoryAllocation {
            va_start,
            pa_start,
            size,
            page_type,
            covered_pages,
        };
        debug!("created allocation: {}", allocation);
        self.allocations.push(allocation.clone());
        Ok(allocation)
    }

    /// Narrows `[va, va + size)` / `[pa, pa + size)` from non-allocated
    /// to allocated on both sides.
    pub(crate) fn mark_allocated(
        &mut self,
        index: usize,
        va_start: u64,
        pa_start: u64,
        size: u64,
        page_type: PageType,
    ) {
        let table = &mut self.page_tables[index];
        let tags = meta([
            ("page_type", page_type.into()),
            ("page_table", table.name().into()),
        ]);

        table.allocated_va.add_region(va_start, size, Some(tags.clone()));
        table.non_allocated_va.remove_region(va_start, size);

        self.pa.allocated.add_region(pa_start, size, Some(tags));
        self.pa.non_allocated.remove_region(pa_start, size);
    }

    fn find_segment_candidate(
        &mut self,
        index: usize,
        size: u64,
        page_type: PageType,
        alignment_bits: Option<u8>,
    ) -> Result<(u64, u64, Vec<Page>)> {
        let table = &self.page_tables[index];
        let criteria = PageTable::page_type_criteria(page_type);
        if table.non_allocated_va.get_intervals(Some(&criteria)).is_empty() {
            return Err(Error::NoAvailableMappedRegion { page_type });
        }

        let (va_start, _) = table
            .non_allocated_va
            .find_region(size, alignment_bits, Some(&criteria), &mut self.rng)
            .ok_or(Error::NoAvailableMappedRegion { page_type })?;

        let covered = Self::covering_pages(table, va_start, size)?;
        let containing = covered
            .iter()
            .find(|page| page.contains_va(va_start))
            .expect("coverage was just verified");
        let pa_start = containing.pa() + (va_start - containing.va());

        if let Some(bits) = alignment_bits {
            if pa_start % (1u64 << bits) != 0 {
                return Err(Error::PageTableInconsistent(format!(
                    "PA {:#x} backing VA {:#x} loses the requested {}-bit alignment",
                    pa_start, va_start, bits
                )));
            }
        }

        Ok((va_start, pa_start, covered))
    }

    /// Identity variant: the segment address must be free in both the
    /// table's non-allocated VA space and the global non-allocated PA
    /// space, and every page under the window must already map VA==PA.
    fn find_identity_segment(
        &mut self,
        index: usize,
        size: u64,
        page_type: PageType,
        alignment_bits: Option<u8>,
    ) -> Result<(u64, u64, Vec<Page>)> {
        let alignment = 1u64 << alignment_bits.unwrap_or(0);
        let mut windows: Vec<(u64, u64)> = Vec::new();
        {
            let table = &self.page_tables[index];
            let criteria = PageTable::page_type_criteria(page_type);
            let va_intervals = table.non_allocated_va.get_intervals(Some(&criteria));
            let pa_intervals = self.pa.non_allocated.get_intervals(Some(&criteria));
            if va_intervals.is_empty() || pa_intervals.is_empty() {
                return Err(Error::NoAvailableMappedRegion { page_type });
            }

            for va in &va_intervals {
                for pa in &pa_intervals {
                    let overlap_start = va.start().max(pa.start());
                    let overlap_last = va.last().min(pa.last());
                    if overlap_start > overlap_last {
                        continue;
                    }
                    let overlap_size = overlap_last - overlap_start + 1;
                    if overlap_size < size {
                        continue;
                    }

                    let first_aligned = align_up(overlap_start, alignment);
                    let last_aligned = align_down(overlap_start + overlap_size - size, alignment);
                    if first_aligned > last_aligned {
                        continue;
                    }

                    // Non-allocated space is always page-backed; the
                    // open question is whether those pages map VA==PA.
                    let window_last = last_aligned + size - 1;
                    let identity = table
                        .pages
                        .iter()
                        .filter(|page| page.va() <= window_last && page.end_va() >= first_aligned)
                        .all(Page::is_identity_mapped);
                    if identity {
                        windows.push((first_aligned, last_aligned));
                    }
                }
            }
        }

        if windows.is_empty() {
            return Err(Error::OutOfIdentityRegion { size });
        }

        let (first, last) = windows[self.rng.gen_range(0..windows.len())];
        let start = if alignment > 1 {
            let slots = (last - first) / alignment + 1;
            first + self.rng.gen_range(0..slots) * alignment
        } else {
            self.rng.gen_range(first..=last)
        };

        let covered = Self::covering_pages(&self.page_tables[index], start, size)?;
        Ok((start, start, covered))
    }

    /// The pages backing `[va_start, va_start + size)`, sorted by VA
    /// and checked for gap-free coverage with contiguous PAs.
    ///
    /// # Errors
    ///
    /// `Error::PageTableInconsistent` on any violation; this is fatal
    /// to the build.
    fn covering_pages(table: &PageTable, va_start: u64, size: u64) -> Result<Vec<Page>> {
        let va_last = va_start + size - 1;
        let mut covered: Vec<Page> = table
            .pages
            .iter()
            .filter(|page| page.va() <= va_last && page.end_va() >= va_start)
            .cloned()
            .collect();
        covered.sort_by_key(Page::va);

        if covered.is_empty() {
            return Err(Error::PageTableInconsistent(format!(
                "no pages cover VA:{:#x}-{:#x} in '{}'",
                va_start,
                va_last,
                table.name()
            )));
        }

        for pair in covered.windows(2) {
            if pair[0].end_va() + 1 != pair[1].va() {
                return Err(Error::PageTableInconsistent(format!(
                    "VA gap between pages {} and {}",
                    pair[0], pair[1]
                )));
            }
            if pair[0].end_pa() + 1 != pair[1].pa() {
                return Err(Error::PageTableInconsistent(format!(
                    "physical memory is not contiguous between pages {} and {}",
                    pair[0], pair[1]
                )));
            }
        }

        let first = covered.first().expect("non-empty");
        let last = covered.last().expect("non-empty");
        if first.va() > va_start || last.end_va() < va_last {
            return Err(Error::PageTableInconsistent(format!(
                "pages cover only VA:{:#x}-{:#x} of VA:{:#x}-{:#x}",
                first.va(),
                last.end_va(),
                va_start,
                va_last
            )));
        }

        Ok(covered)
    }
}

lazy_static::lazy_static! {
    static ref PROCESS_MANAGER: Mutex<PageTableManager> = Mutex::new(PageTableManager::new(0));
}

/// Returns the process-wide manager.  Creation is idempotent; callers
/// wanting a fresh deterministic build reseed it with
/// [`PageTableManager::reset`].  Tests should construct their own
/// instances instead of sharing this one.
pub fn get_page_table_manager() -> &'static Mutex<PageTableManager> {
    &PROCESS_MANAGER
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{VA_BASE, VA_SIZE};

    fn manager(seed: u64) -> PageTableManager {
        let mut manager = PageTableManager::new(seed);
        manager
            .create_page_table("c0_el3", "core_0", ExecutionContext::El3)
            .expect("fresh name");
        manager
    }

    /// Checks the global accounting identities for one table and the
    /// physical space.
    fn assert_accounting(manager: &PageTableManager, table_name: &str) {
        let table = manager.get_page_table(table_name).expect("table exists");

        let unmapped = table.unmapped_va().get_total_size(None);
        let mapped = table.mapped_va().get_total_size(None);
        let non_allocated = table.non_allocated_va().get_total_size(None);
        let allocated = table.allocated_va().get_total_size(None);
        assert_eq!(unmapped + mapped, VA_SIZE, "unmapped ∪ mapped is the VA space");
        assert_eq!(non_allocated + allocated, mapped, "mapped splits into allocation states");

        for interval in table.mapped_va().get_intervals(None) {
            assert!(!table
                .unmapped_va()
                .contains_region(interval.start(), 1, None));
        }
        for interval in table.allocated_va().get_intervals(None) {
            assert!(table.is_mapped(interval.start(), interval.size()));
            assert!(!table
                .non_allocated_va()
                .contains_region(interval.start(), 1, None));
        }

        let pa_unmapped = manager.unmapped_pa().get_total_size(None);
        let pa_mapped = manager.mapped_pa().get_total_size(None);
        let pa_non_allocated = manager.non_allocated_pa().get_total_size(None);
        let pa_allocated = manager.allocated_pa().get_total_size(None);
        assert_eq!(pa_unmapped + pa_mapped, PA_SIZE);
        assert_eq!(pa_non_allocated + pa_allocated, pa_mapped);

        for page in table.get_pages() {
            assert!(table.is_mapped(page.va(), page.size_bytes()));
            assert!(manager
                .mapped_pa()
                .contains_region(page.pa(), page.size_bytes(), None));
        }
    }

    #[test]
    fn duplicate_page_table_names_are_rejected() {
        let mut manager = manager(1);
        let err = manager
            .create_page_table("c0_el3", "core_0", ExecutionContext::El3)
            .expect_err("duplicate");
        assert_eq!(err, Error::DuplicateName("c0_el3".to_string()));

        assert!(manager.get_page_table("missing").is_err());
    }

    #[test]
    fn page_allocation_maps_both_sides() {
        let mut manager = manager(2);
        let page = manager
            .allocate_page("c0_el3", &PageRequest::new(PageType::Code).size(PageSize::Size4K))
            .expect("allocation");

        assert_eq!(page.size_bytes(), 0x1000);
        assert_eq!(page.va() % 0x1000, 0);
        assert_eq!(page.pa() % 0x1000, 0);
        assert!(page.va() >= VA_BASE && page.end_va() < VA_BASE + VA_SIZE);
        assert_eq!(page.execution_context(), ExecutionContext::El3);
        assert_eq!(page.permissions(), Permissions::RWX);

        let table = manager.get_page_table("c0_el3").unwrap();
        assert!(table.is_mapped(page.va(), page.size_bytes()));
        assert!(!table.is_allocated(page.va(), page.size_bytes()));
        assert_eq!(table.get_pages_by_type(PageType::Code).len(), 1);
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn default_page_size_is_drawn_from_the_small_pair() {
        let mut manager = manager(3);
        for _ in 0..8 {
            let page = manager
                .allocate_page("c0_el3", &PageRequest::new(PageType::Data))
                .expect("allocation");
            assert!(matches!(page.size(), PageSize::Size4K | PageSize::Size2M));
        }
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn giant_pages_and_weak_alignments_are_rejected() {
        let mut manager = manager(4);

        let err = manager
            .allocate_page("c0_el3", &PageRequest::new(PageType::Code).size(PageSize::Size1G))
            .expect_err("1 GiB is reserved");
        assert!(matches!(err, Error::InvalidArgument(_)));

        let err = manager
            .allocate_page(
                "c0_el3",
                &PageRequest::new(PageType::Code)
                    .size(PageSize::Size2M)
                    .alignment_bits(12),
            )
            .expect_err("2 MiB pages need 21 bits");
        assert_eq!(
            err,
            Error::InvalidAlignment {
                requested: 12,
                minimum: 21
            }
        );
    }

    #[test]
    fn sequential_pages_are_contiguous_on_both_sides() {
        let mut manager = manager(5);
        let pages = manager
            .allocate_pages(
                "c0_el3",
                &PageRequest::new(PageType::Data)
                    .size(PageSize::Size4K)
                    .sequential(4),
            )
            .expect("allocation");

        assert_eq!(pages.len(), 4);
        for pair in pages.windows(2) {
            assert_eq!(pair[0].end_va() + 1, pair[1].va());
            assert_eq!(pair[0].end_pa() + 1, pair[1].pa());
        }
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn identity_page_lands_on_equal_addresses() {
        let mut manager = PageTableManager::new(6);
        manager
            .create_page_table("core_0_el3_root", "core_0", ExecutionContext::El3)
            .expect("fresh name");

        let page = manager
            .allocate_page(
                "core_0_el3_root",
                &PageRequest::new(PageType::Code)
                    .size(PageSize::Size2M)
                    .va_eq_pa(true),
            )
            .expect("identity allocation");

        assert_eq!(page.va(), page.pa());
        assert!(page.is_identity_mapped());
        assert_eq!(page.va() % (1 << 21), 0);
        assert!(page.va() >= VA_BASE && page.end_va() < VA_BASE + VA_SIZE);
        assert_accounting(&manager, "core_0_el3_root");
    }

    #[test]
    fn pa_exhaustion_rolls_the_va_claim_back() {
        let mut manager = manager(7);
        manager
            .create_page_table("c1_el1", "core_1", ExecutionContext::El1Ns)
            .expect("fresh name");

        // Table 0 drains the whole shared physical space.
        manager
            .allocate_pages(
                "c0_el3",
                &PageRequest::new(PageType::Data)
                    .size(PageSize::Size2M)
                    .sequential(4096),
            )
            .expect("exactly the whole space");
        assert_eq!(manager.unmapped_pa().get_total_size(None), 0);

        // Table 1 still has its own VA space, but no PA is left.
        let err = manager
            .allocate_page("c1_el1", &PageRequest::new(PageType::Data).size(PageSize::Size4K))
            .expect_err("no PA left");
        assert!(matches!(err, Error::OutOfPa { .. }));

        let table = manager.get_page_table("c1_el1").unwrap();
        assert_eq!(table.unmapped_va().get_total_size(None), VA_SIZE);
        assert_accounting(&manager, "c1_el1");
    }

    #[test]
    fn allocation_loop_until_exhaustion_keeps_accounting() {
        let mut manager = manager(8);
        let request = PageRequest::new(PageType::Code)
            .size(PageSize::Size2M)
            .sequential(8);
        let chunk = 8 * PageSize::Size2M.bytes();

        let mut successes = 0u64;
        loop {
            match manager.allocate_pages("c0_el3", &request) {
                Ok(_) => successes += 1,
                // The VA and PA spaces fragment independently; either
                // side may run dry first.  A failed attempt must leave
                // no trace in the accounting.
                Err(Error::OutOfVa { .. }) | Err(Error::OutOfPa { .. }) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let table = manager.get_page_table("c0_el3").unwrap();
        let mapped = table.mapped_va().get_total_size(None);
        assert_eq!(mapped, successes * chunk);
        assert_eq!(mapped, VA_SIZE - table.unmapped_va().get_total_size(None));
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn segment_allocation_narrows_both_sides() {
        let mut manager = manager(9);
        manager
            .allocate_page(
                "c0_el3",
                &PageRequest::new(PageType::Code).size(PageSize::Size2M),
            )
            .expect("backing page");

        let allocation = manager
            .allocate_segment("c0_el3", 0x4000, PageType::Code, Some(12), false)
            .expect("segment");

        assert_eq!(allocation.size(), 0x4000);
        assert_eq!(allocation.va_start() % 0x1000, 0);
        assert_eq!(allocation.covered_pages().len(), 1);
        let page = &allocation.covered_pages()[0];
        assert_eq!(
            allocation.pa_start() - page.pa(),
            allocation.va_start() - page.va()
        );

        let table = manager.get_page_table("c0_el3").unwrap();
        assert!(table.is_allocated(allocation.va_start(), allocation.size()));
        assert!(manager
            .allocated_pa()
            .contains_region(allocation.pa_start(), allocation.size(), None));
        assert_eq!(manager.allocations().len(), 1);
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn segment_allocation_spans_sequential_pages() {
        let mut manager = manager(10);
        manager
            .allocate_pages(
                "c0_el3",
                &PageRequest::new(PageType::Data)
                    .size(PageSize::Size4K)
                    .sequential(8),
            )
            .expect("backing pages");

        // The whole mapped range is one candidate; a 16 KiB segment
        // must span several 4 KiB pages.
        let allocation = manager
            .allocate_segment("c0_el3", 0x4000, PageType::Data, Some(12), false)
            .expect("segment");
        assert!(allocation.covered_pages().len() >= 4);
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn segment_without_matching_pool_is_rejected() {
        let mut manager = manager(11);
        manager
            .allocate_page(
                "c0_el3",
                &PageRequest::new(PageType::Data).size(PageSize::Size2M),
            )
            .expect("data page");

        let err = manager
            .allocate_segment("c0_el3", 0x1000, PageType::Code, None, false)
            .expect_err("no code pool");
        assert_eq!(
            err,
            Error::NoAvailableMappedRegion {
                page_type: PageType::Code
            }
        );
    }

    #[test]
    fn uncovered_allocated_region_is_detected_as_inconsistency() {
        let mut manager = manager(12);

        // Forge a non-allocated DATA region with no backing page.
        manager.page_tables[0].non_allocated_va.add_region(
            VA_BASE,
            0x10000,
            Some(PageTable::page_type_criteria(PageType::Data)),
        );

        let err = manager
            .allocate_segment("c0_el3", 0x1000, PageType::Data, None, false)
            .expect_err("no covering page");
        assert!(matches!(err, Error::PageTableInconsistent(_)));
    }

    #[test]
    fn identity_segment_requires_identity_pages() {
        let mut manager = manager(13);

        // A regular page virtually never lands on VA==PA; the identity
        // segment path must refuse to use it.
        manager
            .allocate_page(
                "c0_el3",
                &PageRequest::new(PageType::Data).size(PageSize::Size2M),
            )
            .expect("regular page");
        let page = manager.get_page_table("c0_el3").unwrap().get_pages()[0].clone();
        assert_ne!(page.va(), page.pa(), "seed chosen to keep VA != PA");

        let err = manager
            .allocate_segment("c0_el3", 0x1000, PageType::Data, Some(4), true)
            .expect_err("no identity backing");
        assert_eq!(err, Error::OutOfIdentityRegion { size: 0x1000 });

        // With an identity page in place the same request succeeds.
        manager
            .allocate_page(
                "c0_el3",
                &PageRequest::new(PageType::Data)
                    .size(PageSize::Size2M)
                    .va_eq_pa(true),
            )
            .expect("identity page");
        let allocation = manager
            .allocate_segment("c0_el3", 0x1000, PageType::Data, Some(4), true)
            .expect("identity segment");
        assert_eq!(allocation.va_start(), allocation.pa_start());
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn map_va_to_pa_moves_unmapped_regions() {
        let mut manager = manager(14);
        manager
            .map_va_to_pa("c0_el3", VA_BASE, PA_BASE + 0x20_0000, 0x1000, PageType::System)
            .expect("mapping");

        let table = manager.get_page_table("c0_el3").unwrap();
        assert!(table.is_mapped(VA_BASE, 0x1000));
        assert!(manager
            .non_allocated_pa()
            .contains_region(PA_BASE + 0x20_0000, 0x1000, None));
        assert_accounting(&manager, "c0_el3");
    }

    #[test]
    fn identical_seeds_reproduce_identical_layouts() {
        let build = |seed: u64| {
            let mut manager = PageTableManager::new(seed);
            manager
                .create_page_table("c0_el3", "core_0", ExecutionContext::El3)
                .unwrap();
            manager
                .create_page_table("c1_el1", "core_1", ExecutionContext::El1Ns)
                .unwrap();
            for name in ["c0_el3", "c1_el1"] {
                manager
                    .allocate_page(name, &PageRequest::new(PageType::Code))
                    .unwrap();
                manager
                    .allocate_pages(
                        name,
                        &PageRequest::new(PageType::Data)
                            .size(PageSize::Size4K)
                            .sequential(4),
                    )
                    .unwrap();
            }
            manager.allocate_cross_core_page().unwrap();
            manager
                .get_all_page_tables()
                .iter()
                .map(|table| table.get_pages().to_vec())
                .collect::<Vec<_>>()
        };

        assert_eq!(build(42), build(42));
        assert_ne!(build(42), build(43));
    }
}
