//! Demo entry point: builds a small two-core layout through the
//! process-wide manager and prints the resulting inventory.  Exits
//! non-zero on any allocation failure.
use std::process::ExitCode;

use mematlas::{
    get_page_table_manager, ExecutionContext, MemoryType, PageRequest, PageSize, PageTableManager,
    PageType, Result,
};

const DEFAULT_SEED: u64 = 0x7ab1e;

fn build_layout(manager: &mut PageTableManager) -> Result<()> {
    manager.create_page_table("core_0_el3_root", "core_0", ExecutionContext::El3)?;
    manager.create_page_table("core_0_el1_ns", "core_0", ExecutionContext::El1Ns)?;
    manager.create_page_table("core_1_el1_ns", "core_1", ExecutionContext::El1Ns)?;

    // The boot core runs with the MMU off first, so its boot code must
    // live at identical virtual and physical addresses.
    manager.allocate_page(
        "core_0_el3_root",
        &PageRequest::new(PageType::Code)
            .size(PageSize::Size2M)
            .va_eq_pa(true),
    )?;
    manager.allocate_memory_segment(
        "core_0_el3_root",
        "bsp_boot",
        0x4000,
        MemoryType::BspBootCode,
        None,
        true,
    )?;

    for name in ["core_0_el1_ns", "core_1_el1_ns"] {
        manager.allocate_page(
            name,
            &PageRequest::new(PageType::Code).size(PageSize::Size2M),
        )?;
        manager.allocate_pages(
            name,
            &PageRequest::new(PageType::Data)
                .size(PageSize::Size4K)
                .sequential(16),
        )?;

        manager.allocate_memory_segment(name, "main_code", 0x8000, MemoryType::Code, None, false)?;
        manager.allocate_memory_segment(name, "stack", 0x4000, MemoryType::Stack, Some(4), false)?;
        manager.allocate_memory_segment(
            name,
            "scratch",
            0x2000,
            MemoryType::DataPreserve,
            Some(4),
            false,
        )?;
        manager.allocate_data_memory(
            name,
            "boot_counter",
            MemoryType::DataPreserve,
            8,
            false,
            Some(3),
            Some(vec![0; 8]),
        )?;
    }

    // One shared physical page, visible from every context, and a
    // mailbox all cores can reach through it.
    manager.allocate_cross_core_page()?;
    manager.allocate_cross_core_data_memory_segment("core_0_el1_ns")?;
    manager.allocate_data_memory(
        "core_0_el1_ns",
        "mailbox",
        MemoryType::DataPreserve,
        64,
        true,
        Some(4),
        None,
    )?;

    Ok(())
}

fn print_summary(manager: &PageTableManager) {
    println!("memory layout (seed {:#x})", manager.seed());
    println!("================================");

    for table in manager.get_all_page_tables() {
        let stats = table.get_memory_stats();
        println!(
            "\n{} ({} @ {}): {} pages, mapped {:#x} bytes, allocated {:#x} bytes",
            stats.page_table_name,
            stats.core_id,
            stats.execution_context,
            stats.total_pages,
            stats.mapped_bytes,
            stats.allocated_bytes,
        );
        for page in table.get_pages() {
            println!("  {}", page);
        }
        for segment in table.segments().segments() {
            println!("  {}", segment);
            if let Some(data) = segment.as_data() {
                for unit in data.data_units() {
                    println!(
                        "    DataUnit(name={}, VA:{:#x}, PA:{:#x}, size={:#x})",
                        unit.name, unit.va_address, unit.pa_address, unit.byte_size
                    );
                }
            }
        }
    }

    println!(
        "\nphysical space: unmapped {:#x}, mapped {:#x}, allocated {:#x}",
        manager.unmapped_pa().get_total_size(None),
        manager.mapped_pa().get_total_size(None),
        manager.allocated_pa().get_total_size(None),
    );
    println!("allocation records: {}", manager.allocations().len());
}

fn main() -> ExitCode {
    env_logger::init();

    let seed = std::env::args()
        .nth(1)
        .and_then(|argument| argument.parse().ok())
        .unwrap_or(DEFAULT_SEED);

    let mut manager = get_page_table_manager()
        .lock()
        .expect("the demo is single-threaded");
    manager.reset(seed);

    if let Err(error) = build_layout(&mut manager) {
        eprintln!("layout build failed: {error}");
        return ExitCode::FAILURE;
    }

    print_summary(&manager);
    ExitCode::SUCCESS
}
