//! A `PageTable` is one MMU context: the virtual address space of one
//! (core, execution context) pair.  It owns the four VA interval-state
//! sets and the page inventory; the allocation algorithms that touch
//! the shared physical space live on the `PageTableManager`.
//!
//! The VA space of every context starts as a single unmapped interval
//! `[VA_BASE, VA_BASE + VA_SIZE)`.  Regions move unmapped → mapped ∧
//! non-allocated when pages are created, and non-allocated → allocated
//! when segments consume them; there is no way back.
use std::collections::BTreeMap;

use log::debug;

use crate::interval::{meta, Metadata};
use crate::interval_set::IntervalSet;
use crate::page::{ExecutionContext, Page, PageType};
use crate::segment::SegmentManager;
use crate::{VA_BASE, VA_SIZE};

/// Point-in-time usage summary of one page table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageTableStats {
    pub page_table_name: String,
    pub core_id: String,
    pub execution_context: ExecutionContext,
    pub total_pages: usize,
    pub pages_by_type: BTreeMap<PageType, usize>,
    pub unmapped_bytes: u64,
    pub mapped_bytes: u64,
    pub non_allocated_bytes: u64,
    pub allocated_bytes: u64,
}

#[derive(Debug)]
pub struct PageTable {
    name: String,
    core_id: String,
    execution_context: ExecutionContext,

    /// VA space not yet bound to any PA.
    pub(crate) unmapped_va: IntervalSet,
    /// Union of all VA regions bound to some PA.
    pub(crate) mapped_va: IntervalSet,
    /// Mapped but not yet consumed by a segment; tagged with the page type.
    pub(crate) non_allocated_va: IntervalSet,
    /// Consumed by a segment; tagged with page type and owner.
    pub(crate) allocated_va: IntervalSet,

    pub(crate) pages: Vec<Page>,
    pages_by_type: BTreeMap<PageType, Vec<usize>>,

    pub(crate) segments: SegmentManager,
}

impl PageTable {
    pub(crate) fn new(name: &str, core_id: &str, execution_context: ExecutionContext) -> Self {
        debug!(
            "setting up page table '{}' for {} at {}",
            name, core_id, execution_context
        );

        let tags = |state: &str| {
            meta([
                ("state", state.into()),
                ("space", "va".into()),
                ("page_table", name.into()),
            ])
        };

        Self {
            name: name.to_string(),
            core_id: core_id.to_string(),
            execution_context,
            unmapped_va: IntervalSet::with_region(VA_BASE, VA_SIZE, tags("unmapped")),
            mapped_va: IntervalSet::with_default_metadata(tags("mapped")),
            non_allocated_va: IntervalSet::with_default_metadata(tags("non_allocated")),
            allocated_va: IntervalSet::with_default_metadata(tags("allocated")),
            pages: Vec::new(),
            pages_by_type: PageType::ALL.iter().map(|t| (*t, Vec::new())).collect(),
            segments: SegmentManager::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn core_id(&self) -> &str {
        &self.core_id
    }

    pub fn execution_context(&self) -> ExecutionContext {
        self.execution_context
    }

    /// All pages, in creation order.
    pub fn get_pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn get_pages_by_type(&self, page_type: PageType) -> Vec<&Page> {
        self.pages_by_type[&page_type]
            .iter()
            .map(|index| &self.pages[*index])
            .collect()
    }

    pub(crate) fn push_page(&mut self, page: Page) {
        debug!("created page in '{}': {}", self.name, page);
        self.pages_by_type
            .get_mut(&page.page_type())
            .expect("index lists cover every page type")
            .push(self.pages.len());
        self.pages.push(page);
    }

    /// Moves `[va, va + size)` unmapped → mapped ∧ non-allocated,
    /// tagging the non-allocated region with its page type.
    pub(crate) fn record_va_mapping(&mut self, va: u64, size: u64, page_type: PageType) {
        self.unmapped_va.remove_region(va, size);
        self.mapped_va.add_region(va, size, None);
        self.non_allocated_va
            .add_region(va, size, Some(Self::page_type_criteria(page_type)));
    }

    /// Is the VA region fully bound to physical memory?
    pub fn is_mapped(&self, va: u64, size: u64) -> bool {
        self.mapped_va.contains_region(va, size, None)
    }

    /// Is the VA region fully consumed by a segment?
    pub fn is_allocated(&self, va: u64, size: u64) -> bool {
        self.allocated_va.contains_region(va, size, None)
    }

    pub fn segments(&self) -> &SegmentManager {
        &self.segments
    }

    // Read access to the interval-state sets, for emitters and tests.

    pub fn unmapped_va(&self) -> &IntervalSet {
        &self.unmapped_va
    }

    pub fn mapped_va(&self) -> &IntervalSet {
        &self.mapped_va
    }

    pub fn non_allocated_va(&self) -> &IntervalSet {
        &self.non_allocated_va
    }

    pub fn allocated_va(&self) -> &IntervalSet {
        &self.allocated_va
    }

    pub fn get_memory_stats(&self) -> PageTableStats {
        PageTableStats {
            page_table_name: self.name.clone(),
            core_id: self.core_id.clone(),
            execution_context: self.execution_context,
            total_pages: self.pages.len(),
            pages_by_type: self
                .pages_by_type
                .iter()
                .map(|(page_type, indices)| (*page_type, indices.len()))
                .collect(),
            unmapped_bytes: self.unmapped_va.get_total_size(None),
            mapped_bytes: self.mapped_va.get_total_size(None),
            non_allocated_bytes: self.non_allocated_va.get_total_size(None),
            allocated_bytes: self.allocated_va.get_total_size(None),
        }
    }

    /// Metadata tag for regions of `page_type`, as stored in the
    /// non-allocated and allocated sets.
    pub(crate) fn page_type_criteria(page_type: PageType) -> Metadata {
        meta([("page_type", page_type.into())])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_table_has_the_whole_va_space_unmapped() {
        let table = PageTable::new("c0_el3", "core_0", ExecutionContext::El3);

        assert_eq!(table.unmapped_va().get_total_size(None), VA_SIZE);
        assert!(table.mapped_va().is_empty());
        assert!(table.non_allocated_va().is_empty());
        assert!(table.allocated_va().is_empty());
        assert!(table.get_pages().is_empty());

        assert!(!table.is_mapped(VA_BASE, 0x1000));
        assert!(!table.is_allocated(VA_BASE, 0x1000));
    }

    #[test]
    fn stats_reflect_the_empty_state() {
        let table = PageTable::new("c1_el1ns", "core_1", ExecutionContext::El1Ns);
        let stats = table.get_memory_stats();

        assert_eq!(stats.page_table_name, "c1_el1ns");
        assert_eq!(stats.core_id, "core_1");
        assert_eq!(stats.execution_context, ExecutionContext::El1Ns);
        assert_eq!(stats.total_pages, 0);
        assert_eq!(stats.unmapped_bytes, VA_SIZE);
        assert_eq!(stats.mapped_bytes, 0);
        assert_eq!(stats.pages_by_type.len(), PageType::ALL.len());
    }
}
