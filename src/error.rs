//! Error taxonomy for the allocation engine.
//!
//! Every fallible operation surfaces one of these kinds; none of them
//! is silently recovered inside the crate.  `PageTableInconsistent` is
//! special: it means the page inventory no longer backs the interval
//! accounting, and callers should abort the layout build.
use crate::page::PageType;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A request was malformed (missing page type, zero size, 1 GiB
    /// page, cross-core request against a non-preserve pool, ...).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The requested alignment is below the page-size-implied minimum.
    #[error("alignment of {requested} bits is below the required minimum of {minimum} bits")]
    InvalidAlignment { requested: u8, minimum: u8 },

    /// A page table or segment with this name already exists.
    #[error("name '{0}' is already registered")]
    DuplicateName(String),

    /// No page table with this name is registered.
    #[error("page table '{0}' does not exist")]
    UnknownPageTable(String),

    /// The page table's unmapped VA space cannot host the request.
    #[error("out of virtual address space for {size:#x} bytes (alignment bits: {alignment_bits:?})")]
    OutOfVa { size: u64, alignment_bits: Option<u8> },

    /// The shared unmapped PA space cannot host the request.
    #[error("out of physical address space for {size:#x} bytes (alignment bits: {alignment_bits:?})")]
    OutOfPa { size: u64, alignment_bits: Option<u8> },

    /// No address is simultaneously free in the VA and PA spaces.
    #[error("no region of {size:#x} bytes admits an identity (VA==PA) mapping")]
    OutOfIdentityRegion { size: u64 },

    /// Segment allocation found no non-allocated region of the page type.
    #[error("no available mapped {page_type} region")]
    NoAvailableMappedRegion { page_type: PageType },

    /// The cross-core page has no aligned window left for a segment.
    #[error("no room left inside the cross-core page")]
    NoCrossCoreRoom,

    /// The page inventory contradicts the interval accounting.  Fatal.
    #[error("page table inconsistent: {0}")]
    PageTableInconsistent(String),

    /// `find_and_remove` found no suitable interval.
    #[error("no interval of {size:#x} bytes found (alignment bits: {alignment_bits:?})")]
    NotFound { size: u64, alignment_bits: Option<u8> },

    /// `split_region` was asked for a range no single interval contains.
    #[error("range {start:#x}+{size:#x} is not contained in a single interval")]
    NotContained { start: u64, size: u64 },

    /// Address translation outside the page.
    #[error("address {address:#x} is outside the page")]
    OutOfRange { address: u64 },

    /// `get_stack_data_start_address` requires exactly one STACK segment.
    #[error("expected exactly one stack segment, found {0}")]
    AmbiguousStackSegment(usize),
}
