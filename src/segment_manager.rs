//! Segment orchestration on top of the allocation core: named code and
//! data segments, the cross-core data-segment fan-out, and data-unit
//! sub-allocation inside data segments.
//!
//! Cross-core operations follow a collect-then-commit discipline: every
//! page table is checked before any accounting is narrowed, so a
//! failure never leaves a partial layout behind.
use log::{debug, info};
use rand::Rng;

use crate::error::{Error, Result};
use crate::interval::meta;
use crate::interval_set::align_up;
use crate::manager::{MemoryAllocation, PageTableManager};
use crate::page::{Page, PageType};
use crate::page_table::PageTable;
use crate::segment::{CodeSegment, DataSegment, DataUnit, MemorySegment, MemoryType};
use crate::{CROSS_CORE_SEGMENT_ALIGN_BITS, CROSS_CORE_SEGMENT_BYTES};

impl PageTableManager {
    /// Carves a named segment out of the page table's mapped space and
    /// registers it with the table's segment store.
    ///
    /// # Errors
    ///
    /// `Error::DuplicateName` on a name collision, plus everything
    /// `allocate_segment` can surface.
    pub fn allocate_memory_segment(
        &mut self,
        page_table: &str,
        name: &str,
        byte_size: u64,
        memory_type: MemoryType,
        alignment_bits: Option<u8>,
        va_eq_pa: bool,
    ) -> Result<&MemorySegment> {
        let index = self.page_table_index(page_table)?;
        if self.page_tables[index].segments.contains_name(name) {
            return Err(Error::DuplicateName(name.to_string()));
        }

        let page_type = memory_type.page_type();
        // Instructions must land on at least 8-byte boundaries.
        let alignment_bits = if memory_type.is_code() {
            Some(alignment_bits.unwrap_or(3).max(3))
        } else {
            alignment_bits
        };

        let allocation =
            self.allocate_segment(page_table, byte_size, page_type, alignment_bits, va_eq_pa)?;

        let table = &mut self.page_tables[index];
        let table_name = table.name().to_string();
        let segment = if memory_type.is_code() {
            MemorySegment::Code(CodeSegment::new(
                name,
                &table_name,
                allocation.va_start(),
                allocation.pa_start(),
                allocation.size(),
                memory_type,
            ))
        } else {
            MemorySegment::Data(DataSegment::new(
                name,
                &table_name,
                allocation.va_start(),
                allocation.pa_start(),
                allocation.size(),
                memory_type,
                false,
            )?)
        };
        info!("allocated segment {} in '{}'", segment, table_name);
        Ok(table.segments.push(segment))
    }

    /// Allocates the cross-core data segment: one 2 KiB, 16-byte
    /// aligned window at the same offset inside every table's view of
    /// one shared cross-core page.  The physical window is narrowed
    /// exactly once; each table narrows its own VA view and receives a
    /// cross-core `DataSegment`.  Returns the segment name, shared by
    /// all tables.
    pub fn allocate_cross_core_data_memory_segment(&mut self, page_table: &str) -> Result<String> {
        let init_index = self.page_table_index(page_table)?;
        let byte_size = CROSS_CORE_SEGMENT_BYTES;
        let alignment = 1u64 << CROSS_CORE_SEGMENT_ALIGN_BITS;
        let criteria = PageTable::page_type_criteria(PageType::Data);

        // Pick one of the initiator's cross-core data pages.
        let (page_va, page_pa, page_bytes) = {
            let table = &self.page_tables[init_index];
            let candidates: Vec<&Page> = table
                .get_pages_by_type(PageType::Data)
                .into_iter()
                .filter(|page| page.is_cross_core())
                .collect();
            if candidates.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "no cross-core page in '{}'; allocate one first",
                    page_table
                )));
            }
            let chosen = candidates[self.rng.gen_range(0..candidates.len())];
            (chosen.va(), chosen.pa(), chosen.size_bytes())
        };
        let page_last_va = page_va + page_bytes - 1;

        // Windows of the page still unconsumed by segments.
        let mut contained: Vec<(u64, u64)> = Vec::new();
        for interval in self.page_tables[init_index]
            .non_allocated_va
            .get_intervals(Some(&criteria))
        {
            let start = interval.start().max(page_va);
            let last = interval.last().min(page_last_va);
            if start > last {
                continue;
            }
            let size = last - start + 1;
            if size >= byte_size {
                contained.push((start, size));
            }
        }
        if contained.is_empty() {
            return Err(Error::NoCrossCoreRoom);
        }

        // A uniformly chosen aligned slot in a uniformly chosen window.
        let (window_start, window_size) = contained[self.rng.gen_range(0..contained.len())];
        let min_start = align_up(window_start, alignment);
        let max_start = window_start + window_size - byte_size;
        if min_start > max_start {
            return Err(Error::NoCrossCoreRoom);
        }
        let slots = (max_start - min_start) / alignment + 1;
        let chosen_va = min_start + self.rng.gen_range(0..slots) * alignment;

        // The same page offset addresses the shared bytes everywhere.
        let offset_in_page = chosen_va - page_va;
        let shared_pa = page_pa + offset_in_page;
        debug!(
            "cross-core data segment window: VA {:#x} (offset {:#x}), PA {:#x}",
            chosen_va, offset_in_page, shared_pa
        );

        // Collect phase: every table must hold the twin page and have
        // its local window free.
        let mut plans: Vec<(usize, u64, Page)> = Vec::new();
        for (index, table) in self.page_tables.iter().enumerate() {
            let local_page = table
                .pages
                .iter()
                .find(|page| page.is_cross_core() && page.pa() == page_pa)
                .ok_or_else(|| {
                    Error::PageTableInconsistent(format!(
                        "page table '{}' lacks a cross-core page at PA {:#x}",
                        table.name(),
                        page_pa
                    ))
                })?;
            let local_va = local_page.va() + offset_in_page;
            if !table
                .non_allocated_va
                .contains_region(local_va, byte_size, Some(&criteria))
            {
                return Err(Error::NoCrossCoreRoom);
            }
            plans.push((index, local_va, local_page.clone()));
        }

        // Commit phase.  The shared physical window narrows once.
        let name = format!("cross_core_data_segment_{}", self.cross_core_segment_count);
        self.cross_core_segment_count += 1;

        self.pa.allocated.add_region(
            shared_pa,
            byte_size,
            Some(meta([
                ("page_type", PageType::Data.into()),
                ("cross_core", true.into()),
            ])),
        );
        self.pa.non_allocated.remove_region(shared_pa, byte_size);

        for (index, local_va, local_page) in plans {
            let table = &mut self.page_tables[index];
            let table_name = table.name().to_string();
            table.allocated_va.add_region(
                local_va,
                byte_size,
                Some(meta([
                    ("page_type", PageType::Data.into()),
                    ("page_table", table_name.as_str().into()),
                ])),
            );
            table.non_allocated_va.remove_region(local_va, byte_size);

            let segment = DataSegment::new(
                &name,
                &table_name,
                local_va,
                shared_pa,
                byte_size,
                MemoryType::DataPreserve,
                true,
            )?;
            table.segments.push(MemorySegment::Data(segment));
            self.allocations.push(MemoryAllocation::new(
                local_va,
                shared_pa,
                byte_size,
                PageType::Data,
                vec![local_page],
            ));
        }

        info!(
            "created cross-core data segment '{}' at PA {:#x} across {} page tables",
            name,
            shared_pa,
            self.page_tables.len()
        );
        Ok(name)
    }

    /// Sub-allocates a data object inside one of the table's data
    /// segments.  Shared pools hand out untracked random offsets;
    /// preserve pools carve from the segment's interval tracker.  A
    /// cross-core request mirrors the same segment offset into every
    /// other table's twin segment and returns all created units, the
    /// initiator's first.
    pub fn allocate_data_memory(
        &mut self,
        page_table: &str,
        name: &str,
        memory_type: MemoryType,
        byte_size: u64,
        cross_core: bool,
        alignment_bits: Option<u8>,
        init_value: Option<Vec<u8>>,
    ) -> Result<Vec<DataUnit>> {
        if !matches!(memory_type, MemoryType::DataShared | MemoryType::DataPreserve) {
            return Err(Error::InvalidArgument(format!(
                "data memory comes from data_shared or data_preserve pools, got {}",
                memory_type
            )));
        }
        if byte_size == 0 {
            return Err(Error::InvalidArgument(
                "data memory size must be positive".to_string(),
            ));
        }
        if memory_type == MemoryType::DataShared && init_value.is_some() {
            return Err(Error::InvalidArgument(
                "shared memory cannot carry an init value".to_string(),
            ));
        }
        if cross_core && memory_type != MemoryType::DataPreserve {
            return Err(Error::InvalidArgument(
                "cross-core data memory requires the data_preserve pool".to_string(),
            ));
        }
        let index = self.page_table_index(page_table)?;

        let pool: Vec<usize> = {
            let table = &self.page_tables[index];
            table
                .segments
                .data_segment_indices(memory_type, cross_core)
                .into_iter()
                .filter(|i| table.segments.segment_at(*i).byte_size() >= byte_size)
                .collect()
        };
        if pool.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no {} segments can host {:#x} bytes in '{}'",
                memory_type, byte_size, page_table
            )));
        }
        let segment_index = pool[self.rng.gen_range(0..pool.len())];

        let (segment_name, seg_address, seg_pa, seg_size) = {
            let segment = self.page_tables[index].segments.segment_at(segment_index);
            (
                segment.name().to_string(),
                segment.address(),
                segment.pa_address(),
                segment.byte_size(),
            )
        };

        if memory_type == MemoryType::DataShared {
            // Shared pools are a free-for-all: a random offset, no
            // tracking, overlaps allowed.
            let max_start = seg_address + seg_size - byte_size;
            let va_address = self.rng.gen_range(seg_address..=max_start);
            let segment_offset = va_address - seg_address;
            let unit = DataUnit {
                name: name.to_string(),
                page_table: page_table.to_string(),
                segment_name,
                va_address,
                pa_address: seg_pa + segment_offset,
                segment_offset,
                byte_size,
                alignment_bits,
                init_value: None,
            };
            self.page_tables[index]
                .segments
                .segment_at_mut(segment_index)
                .as_data_mut()
                .expect("data pools only hold data segments")
                .push_data_unit(unit.clone());
            debug!("shared data unit '{}' at VA {:#x}", unit.name, unit.va_address);
            return Ok(vec![unit]);
        }

        // DATA_PRESERVE: carve from the segment's private tracker.
        let va_address = {
            let segment = self.page_tables[index].segments.segment_at_mut(segment_index);
            let tracker = segment
                .as_data_mut()
                .expect("data pools only hold data segments")
                .interval_tracker_mut()
                .expect("preserve segments track their free space");
            let (va_address, _) = tracker
                .find_and_remove(byte_size, alignment_bits, None, &mut self.rng)
                .map_err(|_| Error::NotFound {
                    size: byte_size,
                    alignment_bits,
                })?;
            va_address
        };
        let segment_offset = va_address - seg_address;
        let pa_address = seg_pa + segment_offset;

        let unit = DataUnit {
            name: name.to_string(),
            page_table: page_table.to_string(),
            segment_name,
            va_address,
            pa_address,
            segment_offset,
            byte_size,
            alignment_bits,
            init_value: init_value.clone(),
        };
        self.page_tables[index]
            .segments
            .segment_at_mut(segment_index)
            .as_data_mut()
            .expect("data pools only hold data segments")
            .push_data_unit(unit.clone());
        debug!("preserve data unit '{}' at VA {:#x}", unit.name, unit.va_address);
        let mut units = vec![unit];

        if cross_core {
            // Mirror the same offset into every twin segment (same
            // shared PA, same size) of the other tables.
            let mut mirrors: Vec<(usize, usize)> = Vec::new();
            for (other_index, table) in self.page_tables.iter().enumerate() {
                if other_index == index {
                    continue;
                }
                let twin = table
                    .segments
                    .data_segment_indices(MemoryType::DataPreserve, true)
                    .into_iter()
                    .find(|i| {
                        let segment = table.segments.segment_at(*i);
                        segment.pa_address() == seg_pa && segment.byte_size() == seg_size
                    })
                    .ok_or_else(|| {
                        Error::PageTableInconsistent(format!(
                            "no cross-core segment twin at PA {:#x} in '{}'",
                            seg_pa,
                            table.name()
                        ))
                    })?;
                mirrors.push((other_index, twin));
            }

            for (other_index, twin_index) in mirrors {
                let (other_table_name, twin_name, twin_address) = {
                    let table = &self.page_tables[other_index];
                    let segment = table.segments.segment_at(twin_index);
                    (
                        table.name().to_string(),
                        segment.name().to_string(),
                        segment.address() + segment_offset,
                    )
                };

                let data = self.page_tables[other_index]
                    .segments
                    .segment_at_mut(twin_index)
                    .as_data_mut()
                    .expect("cross-core segments are data segments");
                data.interval_tracker_mut()
                    .expect("preserve segments track their free space")
                    .remove_region(twin_address, byte_size);
                let mirror = DataUnit {
                    name: format!("{}__{}", name, other_table_name),
                    page_table: other_table_name,
                    segment_name: twin_name,
                    va_address: twin_address,
                    pa_address,
                    segment_offset,
                    byte_size,
                    alignment_bits,
                    init_value: init_value.clone(),
                };
                data.push_data_unit(mirror.clone());
                units.push(mirror);
            }
        }

        Ok(units)
    }
}
