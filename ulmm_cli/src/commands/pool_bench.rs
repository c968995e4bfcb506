use std::{hint::black_box, thread, time::Instant};

use anyhow::{Result, ensure};
use ulmm::{
    Errno, fatal,
    mem::PAGE_SIZE,
    pool::{PagePool, PoolOptions},
};

use crate::{PoolBenchArgs, commands::report};

pub fn do_pool_bench(args: PoolBenchArgs) -> Result<()> {
    let PoolBenchArgs {
        total_pages,
        ops,
        threads,
        max_shards,
    } = args;

    let mut shards = 2;
    while shards <= max_shards {
        for &threads in threads.iter() {
            bench(shards, total_pages / shards, threads, ops)?;
        }
        shards *= 2;
    }
    Ok(())
}

fn bench(shards: usize, pages_per_shard: usize, threads: usize, ops: usize) -> Result<()> {
    println!("========= shards: {shards}, threads: {threads}, ops / thread: {ops}");
    ensure!(
        threads * ops <= shards * pages_per_shard,
        "{} threads holding {} pages each do not fit in {} pages",
        threads,
        ops,
        shards * pages_per_shard
    );

    let pool = PoolOptions::new()
        .shards(shards)
        .pages_per_shard(pages_per_shard)
        .build()?;
    let total = (threads * ops) as u64;

    let elapsed = run_threads(threads, || malloc_round(ops));
    report("malloc", elapsed, total);

    let elapsed = run_threads(threads, || pool_round(&pool, ops));
    report("pool", elapsed, total);

    log::debug!("after run: {}", pool);
    Ok(())
}

fn run_threads<F: Fn() + Sync>(threads: usize, work: F) -> std::time::Duration {
    let start = Instant::now();
    thread::scope(|scope| {
        for _ in 0..threads {
            scope.spawn(&work);
        }
    });
    start.elapsed()
}

fn malloc_round(ops: usize) {
    let held: Vec<Box<[u8]>> = (0..ops)
        .map(|_| vec![42u8; PAGE_SIZE].into_boxed_slice())
        .collect();
    black_box(&held);
}

fn pool_round(pool: &PagePool, ops: usize) {
    let mut held = Vec::with_capacity(ops);
    for _ in 0..ops {
        let Some(mut page) = pool.allocate() else {
            fatal(
                "pool benchmark",
                Errno::Exhausted.with_message(format!("{} pages held", held.len())),
            );
        };
        pool.page_bytes_mut(&mut page).fill(42);
        held.push(page);
    }
    for page in held {
        pool.deallocate(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_run_returns_every_page() {
        let pool = PoolOptions::new().shards(2).pages_per_shard(64).build().unwrap();
        run_threads(4, || pool_round(&pool, 32));
        assert_eq!(pool.free_pages(), 128);
    }

    #[test]
    fn oversubscribed_runs_are_refused() {
        assert!(bench(2, 4, 4, 4).is_err());
    }
}
