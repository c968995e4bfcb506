use std::{
    hint::black_box,
    ptr::NonNull,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, ensure};
use rand::Rng;
use ulmm::{
    buffer::{BufferTable, Embedded, SideTable, StateLayout},
    mem::PageSize,
    vm::{self, MmapAdvise, Protection},
};

use crate::{FixBenchArgs, backing::ensure_data_file, commands::report};

pub fn do_fix_bench(args: FixBenchArgs) -> Result<()> {
    let FixBenchArgs {
        data_file,
        pages,
        ops,
    } = args;
    ensure!(pages > 0, "need at least one page");

    let page_size = PageSize::Size4K.bytes();
    let len = pages * page_size;
    let file = ensure_data_file(&data_file, pages, page_size)?;
    let base = vm::map_shared(&file, len, 0, Protection::READ | Protection::WRITE)?;

    let result = compare_layouts(base, pages, page_size, ops);
    unsafe { vm::release(base, len)? };
    result
}

fn compare_layouts(base: usize, pages: usize, page_size: usize, ops: u64) -> Result<()> {
    vm::advise_access_pattern(base, pages * page_size, MmapAdvise::MADV_WILLNEED)?;
    let data = NonNull::new(base as *mut u8).context("mapping at null")?;

    let side = BufferTable::new(unsafe { SideTable::new(data, pages, page_size) });
    let elapsed = random_fixes(&side, ops)?;
    println!("side table, N = {ops}");
    report("side table", elapsed, ops);

    // Overwrites the first eight bytes of every page in the data file.
    let embedded = BufferTable::new(unsafe { Embedded::new(data, pages, page_size) });
    let elapsed = random_fixes(&embedded, ops)?;
    println!("embedded, N = {ops}");
    report("embedded", elapsed, ops);
    Ok(())
}

/// Fix a random page, read a word from it, unfix it; `ops` times.
fn random_fixes<L: StateLayout>(table: &BufferTable<L>, ops: u64) -> Result<Duration> {
    let mut rng = rand::thread_rng();
    let mut acc = 0u64;

    let start = Instant::now();
    for _ in 0..ops {
        let pid = rng.gen_range(0..table.page_count());
        let data = table.fix(pid)?;
        acc = acc.wrapping_add(unsafe { data.cast::<u32>().as_ptr().read() } as u64);
        table.unfix(pid)?;
    }
    let elapsed = start.elapsed();

    black_box(acc);
    Ok(elapsed)
}
