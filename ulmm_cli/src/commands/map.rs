use std::{fs::File, os::fd::AsFd, thread, time::Duration};

use anyhow::{Context, Result, ensure};
use ulmm::{
    engine::{Backing, Engine, EngineOptions, MapKind},
    mem::PageSize,
    pool::PoolOptions,
    vm::{self, Protection},
};

use crate::MapArgs;

/// Bytes between two touches; the first one is off the page boundary.
const TOUCH_STRIDE: usize = 1024;
const FIRST_TOUCH: usize = 0xf;

pub fn do_map(args: MapArgs) -> Result<()> {
    let MapArgs {
        pages,
        file,
        offset,
        delay,
    } = args;
    ensure!(pages > 0, "nothing to map");

    let page_size = PageSize::Size4K.bytes();
    let len = pages * page_size;
    let pool = PoolOptions::new()
        .shards(4)
        .pages_per_shard(pages.div_ceil(4).max(16));
    let engine = Engine::new_host(EngineOptions::new().pool(pool))?;

    let file = file
        .map(|path| File::open(&path).with_context(|| format!("open {}", path.display())))
        .transpose()?;
    let (kind, backing) = match &file {
        Some(file) => (
            MapKind::PRIVATE | MapKind::FILE,
            Some(Backing::new(file.as_fd(), offset)),
        ),
        None => (MapKind::PRIVATE | MapKind::ANONYMOUS, None),
    };

    let base = engine.map(None, len, Protection::READ | Protection::WRITE, kind, backing);
    println!("Address returned by map() = {:#x}", base);

    let mut at = FIRST_TOUCH;
    while at < len {
        let byte = unsafe { vm::touch_page(base + at) };
        println!("Read address {:#x}: {}", base + at, byte.escape_ascii());
        at += TOUCH_STRIDE;
        if delay > 0 {
            thread::sleep(Duration::from_millis(delay));
        }
    }

    log::info!(
        "{} faults resolved, pool {}",
        engine.fault_count(base).unwrap_or(0),
        engine.pool()
    );
    engine.unmap(base, len)?;
    Ok(())
}
