//! The `Page` value: one immutable VA→PA mapping of a single page
//! size, together with the attribute vocabulary shared across the
//! engine (page sizes, page types, permissions, cacheability,
//! shareability, execution contexts).
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::fmt;

use crate::error::{Error, Result};
use crate::interval::{MetaValue, Metadata};

/// Supported translation granules.  1 GiB is part of the vocabulary
/// but rejected by the allocator until an emitter can walk it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    pub const fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 * 1024,
            PageSize::Size2M => 2 * 1024 * 1024,
            PageSize::Size1G => 1024 * 1024 * 1024,
        }
    }

    /// The minimum alignment a page of this size requires.
    pub const fn alignment_bits(self) -> u8 {
        match self {
            PageSize::Size4K => 12,
            PageSize::Size2M => 21,
            PageSize::Size1G => 30,
        }
    }
}

impl fmt::Display for PageSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSize::Size4K => write!(f, "4K"),
            PageSize::Size2M => write!(f, "2M"),
            PageSize::Size1G => write!(f, "1G"),
        }
    }
}

/// What a page holds, which also selects the segment pools it feeds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageType {
    Code,
    Data,
    Device,
    System,
}

impl PageType {
    pub const ALL: [PageType; 4] = [
        PageType::Code,
        PageType::Data,
        PageType::Device,
        PageType::System,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            PageType::Code => "code",
            PageType::Data => "data",
            PageType::Device => "device",
            PageType::System => "system",
        }
    }
}

impl fmt::Display for PageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<PageType> for MetaValue {
    fn from(value: PageType) -> Self {
        MetaValue::Text(value.as_str().to_string())
    }
}

bitflags::bitflags! {
    /// Access permission mask.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Permissions: u8 {
        const READ = 0b001;
        const WRITE = 0b010;
        const EXECUTE = 0b100;
    }
}

impl Permissions {
    pub const RWX: Permissions = Permissions::all();
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tags = String::new();
        if self.contains(Permissions::READ) {
            tags.push('R');
        }
        if self.contains(Permissions::WRITE) {
            tags.push('W');
        }
        if self.contains(Permissions::EXECUTE) {
            tags.push('X');
        }
        if tags.is_empty() {
            tags.push('-');
        }
        f.write_str(&tags)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cacheability {
    NonCacheable,
    WriteThrough,
    WriteBack,
}

impl fmt::Display for Cacheability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cacheability::NonCacheable => write!(f, "non-cacheable"),
            Cacheability::WriteThrough => write!(f, "write-through"),
            Cacheability::WriteBack => write!(f, "write-back"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Shareability {
    NonShareable,
    Inner,
    Outer,
}

impl fmt::Display for Shareability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shareability::NonShareable => write!(f, "non-shareable"),
            Shareability::Inner => write!(f, "inner-shareable"),
            Shareability::Outer => write!(f, "outer-shareable"),
        }
    }
}

/// Privilege level plus security world.  Each page table is bound to
/// exactly one of these.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ExecutionContext {
    El3,
    El2Ns,
    El2S,
    El1Ns,
    El1S,
    El1Realm,
    El0Ns,
    El0S,
    El0Realm,
}

impl ExecutionContext {
    pub const fn as_str(self) -> &'static str {
        match self {
            ExecutionContext::El3 => "EL3",
            ExecutionContext::El2Ns => "EL2_NS",
            ExecutionContext::El2S => "EL2_S",
            ExecutionContext::El1Ns => "EL1_NS",
            ExecutionContext::El1S => "EL1_S",
            ExecutionContext::El1Realm => "EL1_Realm",
            ExecutionContext::El0Ns => "EL0_NS",
            ExecutionContext::El0S => "EL0_S",
            ExecutionContext::El0Realm => "EL0_Realm",
        }
    }
}

impl fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One page mapping.  Pages are immutable once constructed and are
/// safe to copy around; the page table keeps the canonical list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Page {
    va: u64,
    pa: u64,
    size: PageSize,
    page_type: PageType,
    permissions: Permissions,
    cacheable: Cacheability,
    shareable: Shareability,
    execution_context: ExecutionContext,
    is_cross_core: bool,
    custom_attributes: Metadata,
}

impl Page {
    #[allow(clippy::too_many_arguments)]
    #[requires(va % size.bytes() == 0, "VA must be aligned to the page size")]
    #[requires(pa % size.bytes() == 0, "PA must be aligned to the page size")]
    pub(crate) fn new(
        va: u64,
        pa: u64,
        size: PageSize,
        page_type: PageType,
        permissions: Permissions,
        cacheable: Cacheability,
        shareable: Shareability,
        execution_context: ExecutionContext,
        custom_attributes: Metadata,
        is_cross_core: bool,
    ) -> Self {
        Self {
            va,
            pa,
            size,
            page_type,
            permissions,
            cacheable,
            shareable,
            execution_context,
            is_cross_core,
            custom_attributes,
        }
    }

    #[inline]
    pub fn va(&self) -> u64 {
        self.va
    }

    #[inline]
    pub fn pa(&self) -> u64 {
        self.pa
    }

    #[inline]
    pub fn size(&self) -> PageSize {
        self.size
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.size.bytes()
    }

    #[inline]
    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    #[inline]
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    #[inline]
    pub fn cacheable(&self) -> Cacheability {
        self.cacheable
    }

    #[inline]
    pub fn shareable(&self) -> Shareability {
        self.shareable
    }

    #[inline]
    pub fn execution_context(&self) -> ExecutionContext {
        self.execution_context
    }

    #[inline]
    pub fn is_cross_core(&self) -> bool {
        self.is_cross_core
    }

    pub fn custom_attributes(&self) -> &Metadata {
        &self.custom_attributes
    }

    /// Virtual address of the last byte in this page.
    #[inline]
    pub fn end_va(&self) -> u64 {
        self.va + self.size.bytes() - 1
    }

    /// Physical address of the last byte in this page.
    #[inline]
    pub fn end_pa(&self) -> u64 {
        self.pa + self.size.bytes() - 1
    }

    pub fn contains_va(&self, address: u64) -> bool {
        self.va <= address && address <= self.end_va()
    }

    pub fn contains_pa(&self, address: u64) -> bool {
        self.pa <= address && address <= self.end_pa()
    }

    #[inline]
    pub fn is_identity_mapped(&self) -> bool {
        self.va == self.pa
    }

    /// Translates a virtual address through this page.
    ///
    /// # Errors
    ///
    /// `Error::OutOfRange` when the address is not inside the page.
    pub fn va_to_pa(&self, address: u64) -> Result<u64> {
        if !self.contains_va(address) {
            return Err(Error::OutOfRange { address });
        }
        Ok(self.pa + (address - self.va))
    }

    /// Translates a physical address back through this page.
    ///
    /// # Errors
    ///
    /// `Error::OutOfRange` when the address is not inside the page.
    pub fn pa_to_va(&self, address: u64) -> Result<u64> {
        if !self.contains_pa(address) {
            return Err(Error::OutOfRange { address });
        }
        Ok(self.va + (address - self.pa))
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Page(VA:{:#x}-{:#x}, PA:{:#x}-{:#x}, {}, {}, {}, {}, cross_core: {}, va_eq_pa: {})",
            self.va,
            self.end_va(),
            self.pa,
            self.end_pa(),
            self.size,
            self.page_type,
            self.permissions,
            self.cacheable,
            self.is_cross_core,
            self.is_identity_mapped(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(va: u64, pa: u64) -> Page {
        Page::new(
            va,
            pa,
            PageSize::Size4K,
            PageType::Data,
            Permissions::RWX,
            Cacheability::WriteBack,
            Shareability::NonShareable,
            ExecutionContext::El1Ns,
            Metadata::new(),
            false,
        )
    }

    #[test]
    fn derived_accessors() {
        let page = page(0x8020_0000, 0x9000_0000);

        assert_eq!(page.end_va(), 0x8020_0fff);
        assert_eq!(page.end_pa(), 0x9000_0fff);
        assert!(page.contains_va(0x8020_0fff));
        assert!(!page.contains_va(0x8020_1000));
        assert!(!page.is_identity_mapped());
    }

    #[test]
    fn translation_round_trips_inside_the_page() {
        let page = page(0x8020_0000, 0x9000_0000);

        let pa = page.va_to_pa(0x8020_0123).expect("inside");
        assert_eq!(pa, 0x9000_0123);
        assert_eq!(page.pa_to_va(pa).expect("inside"), 0x8020_0123);

        assert_eq!(
            page.va_to_pa(0x8020_1000),
            Err(Error::OutOfRange { address: 0x8020_1000 })
        );
        assert_eq!(
            page.pa_to_va(0x8fff_ffff),
            Err(Error::OutOfRange { address: 0x8fff_ffff })
        );
    }

    #[test]
    fn permission_display_is_compact() {
        assert_eq!(Permissions::RWX.to_string(), "RWX");
        assert_eq!(
            (Permissions::READ | Permissions::EXECUTE).to_string(),
            "RX"
        );
        assert_eq!(Permissions::empty().to_string(), "-");
    }

    #[test]
    fn page_sizes_and_alignments_line_up() {
        assert_eq!(PageSize::Size4K.bytes(), 0x1000);
        assert_eq!(PageSize::Size2M.bytes(), 0x20_0000);
        assert_eq!(PageSize::Size1G.bytes(), 0x4000_0000);
        for size in [PageSize::Size4K, PageSize::Size2M, PageSize::Size1G] {
            assert_eq!(1u64 << size.alignment_bits(), size.bytes());
        }
    }
}
