use std::time::Duration;

pub use fix_bench::*;
pub use map::*;
pub use pool_bench::*;

mod fix_bench;
mod map;
mod pool_bench;

fn report(label: &str, elapsed: Duration, ops: u64) {
    println!("{} time: {} ms", label, elapsed.as_millis());
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        println!("{} throughput: {:.0} ops/s", label, ops as f64 / secs);
    }
}
