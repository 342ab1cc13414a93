//! Memory segments: named regions carved out of a page table's mapped
//! space, plus the per-table `SegmentManager` store.  `DATA_PRESERVE`
//! data segments carry their own private interval set so fine-grained
//! data objects can be sub-allocated inside them.
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::interval::Metadata;
use crate::interval_set::IntervalSet;
use crate::page::PageType;

/// The pool a segment is carved for.  Every memory type maps onto a
/// page type; the enum is closed, so there is no invalid mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MemoryType {
    BspBootCode,
    BootCode,
    Code,
    DataShared,
    DataPreserve,
    Stack,
}

impl MemoryType {
    pub const fn as_str(self) -> &'static str {
        match self {
            MemoryType::BspBootCode => "bsp_boot_code",
            MemoryType::BootCode => "boot_code",
            MemoryType::Code => "code",
            MemoryType::DataShared => "data_shared",
            MemoryType::DataPreserve => "data_preserve",
            MemoryType::Stack => "stack",
        }
    }

    pub const fn is_code(self) -> bool {
        matches!(
            self,
            MemoryType::BspBootCode | MemoryType::BootCode | MemoryType::Code
        )
    }

    /// The page pool this memory type allocates from.
    pub const fn page_type(self) -> PageType {
        if self.is_code() {
            PageType::Code
        } else {
            PageType::Data
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A data object sub-allocated inside a data segment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataUnit {
    pub name: String,
    pub page_table: String,
    pub segment_name: String,
    pub va_address: u64,
    pub pa_address: u64,
    /// Offset of the object from the segment start; equal across all
    /// mirrors of a cross-core object.
    pub segment_offset: u64,
    pub byte_size: u64,
    pub alignment_bits: Option<u8>,
    pub init_value: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodeSegment {
    name: String,
    page_table: String,
    address: u64,
    pa_address: u64,
    byte_size: u64,
    memory_type: MemoryType,
}

impl CodeSegment {
    pub(crate) fn new(
        name: &str,
        page_table: &str,
        address: u64,
        pa_address: u64,
        byte_size: u64,
        memory_type: MemoryType,
    ) -> Self {
        Self {
            name: name.to_string(),
            page_table: page_table.to_string(),
            address,
            pa_address,
            byte_size,
            memory_type,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSegment {
    name: String,
    page_table: String,
    address: u64,
    pa_address: u64,
    byte_size: u64,
    memory_type: MemoryType,
    is_cross_core: bool,
    data_units: Vec<DataUnit>,
    /// Present for `DATA_PRESERVE`: the still-free space inside the
    /// segment, consumed by data-unit sub-allocation.
    interval_tracker: Option<IntervalSet>,
}

impl DataSegment {
    pub(crate) fn new(
        name: &str,
        page_table: &str,
        address: u64,
        pa_address: u64,
        byte_size: u64,
        memory_type: MemoryType,
        is_cross_core: bool,
    ) -> Result<Self> {
        if is_cross_core && memory_type != MemoryType::DataPreserve {
            return Err(Error::InvalidArgument(format!(
                "cross-core segments must be data_preserve, got {}",
                memory_type
            )));
        }

        let interval_tracker = (memory_type == MemoryType::DataPreserve)
            .then(|| IntervalSet::with_region(address, byte_size, Metadata::new()));

        Ok(Self {
            name: name.to_string(),
            page_table: page_table.to_string(),
            address,
            pa_address,
            byte_size,
            memory_type,
            is_cross_core,
            data_units: Vec::new(),
            interval_tracker,
        })
    }

    pub fn data_units(&self) -> &[DataUnit] {
        &self.data_units
    }

    pub fn interval_tracker(&self) -> Option<&IntervalSet> {
        self.interval_tracker.as_ref()
    }

    pub(crate) fn interval_tracker_mut(&mut self) -> Option<&mut IntervalSet> {
        self.interval_tracker.as_mut()
    }

    pub(crate) fn push_data_unit(&mut self, unit: DataUnit) {
        self.data_units.push(unit);
    }
}

/// A named region carved from a single page table's mapped space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemorySegment {
    Code(CodeSegment),
    Data(DataSegment),
}

impl MemorySegment {
    pub fn name(&self) -> &str {
        match self {
            MemorySegment::Code(segment) => &segment.name,
            MemorySegment::Data(segment) => &segment.name,
        }
    }

    pub fn page_table(&self) -> &str {
        match self {
            MemorySegment::Code(segment) => &segment.page_table,
            MemorySegment::Data(segment) => &segment.page_table,
        }
    }

    /// Segment start VA.
    pub fn address(&self) -> u64 {
        match self {
            MemorySegment::Code(segment) => segment.address,
            MemorySegment::Data(segment) => segment.address,
        }
    }

    /// Segment start PA.
    pub fn pa_address(&self) -> u64 {
        match self {
            MemorySegment::Code(segment) => segment.pa_address,
            MemorySegment::Data(segment) => segment.pa_address,
        }
    }

    pub fn byte_size(&self) -> u64 {
        match self {
            MemorySegment::Code(segment) => segment.byte_size,
            MemorySegment::Data(segment) => segment.byte_size,
        }
    }

    pub fn memory_type(&self) -> MemoryType {
        match self {
            MemorySegment::Code(segment) => segment.memory_type,
            MemorySegment::Data(segment) => segment.memory_type,
        }
    }

    pub fn is_cross_core(&self) -> bool {
        match self {
            MemorySegment::Code(_) => false,
            MemorySegment::Data(segment) => segment.is_cross_core,
        }
    }

    pub fn as_data(&self) -> Option<&DataSegment> {
        match self {
            MemorySegment::Code(_) => None,
            MemorySegment::Data(segment) => Some(segment),
        }
    }

    pub(crate) fn as_data_mut(&mut self) -> Option<&mut DataSegment> {
        match self {
            MemorySegment::Code(_) => None,
            MemorySegment::Data(segment) => Some(segment),
        }
    }
}

impl fmt::Display for MemorySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            MemorySegment::Code(_) => "CodeSegment",
            MemorySegment::Data(_) => "DataSegment",
        };
        write!(
            f,
            "{}(name={}, VA:{:#x}-{:#x}, PA:{:#x}-{:#x}, size={:#x}, type={}, cross_core={})",
            kind,
            self.name(),
            self.address(),
            self.address() + self.byte_size() - 1,
            self.pa_address(),
            self.pa_address() + self.byte_size() - 1,
            self.byte_size(),
            self.memory_type(),
            self.is_cross_core(),
        )
    }
}

/// Per page-table store of segments with a memory-type index.
#[derive(Default, Debug)]
pub struct SegmentManager {
    segments: Vec<MemorySegment>,
    by_type: BTreeMap<MemoryType, Vec<usize>>,
}

impl SegmentManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn segments(&self) -> &[MemorySegment] {
        &self.segments
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.segments.iter().any(|segment| segment.name() == name)
    }

    pub(crate) fn push(&mut self, segment: MemorySegment) -> &MemorySegment {
        self.by_type
            .entry(segment.memory_type())
            .or_default()
            .push(self.segments.len());
        self.segments.push(segment);
        self.segments.last().expect("just pushed")
    }

    /// Segments of any of the given memory types, in creation order.
    pub fn get_segments(&self, memory_types: &[MemoryType]) -> Vec<&MemorySegment> {
        let mut indices: Vec<usize> = memory_types
            .iter()
            .filter_map(|memory_type| self.by_type.get(memory_type))
            .flatten()
            .copied()
            .collect();
        indices.sort_unstable();
        indices.into_iter().map(|index| &self.segments[index]).collect()
    }

    pub fn get_segment(&self, name: &str) -> Result<&MemorySegment> {
        self.segments
            .iter()
            .find(|segment| segment.name() == name)
            .ok_or_else(|| Error::InvalidArgument(format!("no segment named '{}'", name)))
    }

    /// Indices of data segments in the pool, filtered by cross-core flag.
    pub(crate) fn data_segment_indices(
        &self,
        memory_type: MemoryType,
        cross_core: bool,
    ) -> Vec<usize> {
        self.by_type
            .get(&memory_type)
            .into_iter()
            .flatten()
            .copied()
            .filter(|index| self.segments[*index].is_cross_core() == cross_core)
            .collect()
    }

    pub(crate) fn segment_at(&self, index: usize) -> &MemorySegment {
        &self.segments[index]
    }

    pub(crate) fn segment_at_mut(&mut self, index: usize) -> &mut MemorySegment {
        &mut self.segments[index]
    }

    /// The start VA of the single stack segment.
    ///
    /// # Errors
    ///
    /// `Error::AmbiguousStackSegment` unless exactly one STACK segment
    /// exists.
    pub fn get_stack_data_start_address(&self) -> Result<u64> {
        let stacks = self.get_segments(&[MemoryType::Stack]);
        if stacks.len() != 1 {
            return Err(Error::AmbiguousStackSegment(stacks.len()));
        }
        Ok(stacks[0].address())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_segment(name: &str, memory_type: MemoryType, cross_core: bool) -> MemorySegment {
        MemorySegment::Data(
            DataSegment::new(name, "pt0", 0x9000_0000, 0xa000_0000, 0x1000, memory_type, cross_core)
                .expect("valid segment"),
        )
    }

    #[test]
    fn memory_types_map_onto_page_types() {
        assert_eq!(MemoryType::Code.page_type(), PageType::Code);
        assert_eq!(MemoryType::BootCode.page_type(), PageType::Code);
        assert_eq!(MemoryType::BspBootCode.page_type(), PageType::Code);
        assert_eq!(MemoryType::DataShared.page_type(), PageType::Data);
        assert_eq!(MemoryType::DataPreserve.page_type(), PageType::Data);
        assert_eq!(MemoryType::Stack.page_type(), PageType::Data);
    }

    #[test]
    fn preserve_segments_track_their_free_space() {
        let segment = data_segment("scratch", MemoryType::DataPreserve, false);
        let tracker = segment
            .as_data()
            .and_then(DataSegment::interval_tracker)
            .expect("preserve segments have a tracker");
        assert_eq!(tracker.get_total_size(None), 0x1000);

        let shared = data_segment("bag", MemoryType::DataShared, false);
        assert!(shared.as_data().unwrap().interval_tracker().is_none());
    }

    #[test]
    fn cross_core_requires_data_preserve() {
        let err = DataSegment::new(
            "nope",
            "pt0",
            0x9000_0000,
            0xa000_0000,
            0x1000,
            MemoryType::DataShared,
            true,
        )
        .expect_err("shared cross-core must be rejected");
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn stack_lookup_needs_exactly_one_stack() {
        let mut manager = SegmentManager::new();
        assert_eq!(
            manager.get_stack_data_start_address(),
            Err(Error::AmbiguousStackSegment(0))
        );

        manager.push(data_segment("stack_a", MemoryType::Stack, false));
        assert_eq!(manager.get_stack_data_start_address(), Ok(0x9000_0000));

        manager.push(data_segment("stack_b", MemoryType::Stack, false));
        assert_eq!(
            manager.get_stack_data_start_address(),
            Err(Error::AmbiguousStackSegment(2))
        );
    }

    #[test]
    fn type_index_filters_segments() {
        let mut manager = SegmentManager::new();
        manager.push(data_segment("preserve", MemoryType::DataPreserve, false));
        manager.push(data_segment("shared", MemoryType::DataShared, false));
        manager.push(data_segment("cc", MemoryType::DataPreserve, true));

        let preserve =
            manager.get_segments(&[MemoryType::DataPreserve]);
        assert_eq!(preserve.len(), 2);

        assert_eq!(manager.data_segment_indices(MemoryType::DataPreserve, true), vec![2]);
        assert_eq!(manager.data_segment_indices(MemoryType::DataPreserve, false), vec![0]);
        assert!(manager.get_segment("shared").is_ok());
        assert!(manager.get_segment("missing").is_err());
    }
}
