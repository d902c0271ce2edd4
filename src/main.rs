//! Sim Portal - performance runner
//!
//! Measures real round-trip numbers for the shared memory channel.

mod bench;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    bench::run_performance_comparison()
}
