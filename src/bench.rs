//! Round-trip performance measurement for the shared memory channel
//!
//! Spawns the simulation side on a second thread and measures full
//! request/response round trips through one segment, to provide real numbers
//! for the busy-wait hand-off rather than theoretical estimates.

use sim_portal::prelude::*;
use std::time::{Duration, Instant};

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Request {
    sequence: u64,
    payload: [u64; 4],
}
unsafe impl ShmSafe for Request {}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct Response {
    sequence: u64,
    checksum: u64,
}
unsafe impl ShmSafe for Response {}

/// Results from a round-trip run
struct BenchResults {
    test_name: String,
    round_trips: usize,
    duration: Duration,
    round_trips_per_second: f64,
    avg_latency_us: f64,
}

impl BenchResults {
    fn print(&self) {
        println!("📊 {}", self.test_name);
        println!("   Round trips: {}", self.round_trips);
        println!("   Duration: {:.3}s", self.duration.as_secs_f64());
        println!("   Rate: {:.0} round trips/sec", self.round_trips_per_second);
        println!("   Avg latency: {:.2} μs", self.avg_latency_us);
    }
}

/// Drive `round_trips` request/response exchanges and time them.
fn run_round_trip(segment_name: &str, round_trips: usize) -> anyhow::Result<BenchResults> {
    let mut agent = MsgChannel::<Request, Response>::new(ChannelConfig::creator(segment_name))?;

    let sim_segment = segment_name.to_string();
    let sim = std::thread::spawn(move || -> anyhow::Result<()> {
        let mut channel =
            MsgChannel::<Request, Response>::new(ChannelConfig::attacher(&sim_segment))?;
        for sequence in 0..round_trips as u64 {
            channel.sim_send_begin();
            *channel.sim2agent_mut() = Request {
                sequence,
                payload: [sequence; 4],
            };
            channel.sim_send_end();

            channel.sim_recv_begin();
            let response = *channel.agent2sim();
            channel.sim_recv_end();
            anyhow::ensure!(
                response.sequence == sequence,
                "response {} answered request {}",
                response.sequence,
                sequence
            );
        }
        Ok(())
    });

    let start = Instant::now();
    for _ in 0..round_trips {
        agent.agent_recv_begin();
        let request = *agent.sim2agent();
        agent.agent_recv_end();

        agent.agent_send_begin();
        *agent.agent2sim_mut() = Response {
            sequence: request.sequence,
            checksum: request.payload.iter().sum(),
        };
        agent.agent_send_end();
    }
    let duration = start.elapsed();

    sim.join().expect("simulation thread panicked")?;

    // Drain the shutdown mark the attacher sends on drop.
    agent.agent_recv_begin();
    assert!(agent.finished());
    agent.agent_recv_end();

    let secs = duration.as_secs_f64();
    Ok(BenchResults {
        test_name: format!("Shared memory round trip ({} bytes up)", std::mem::size_of::<Request>()),
        round_trips,
        duration,
        round_trips_per_second: round_trips as f64 / secs,
        avg_latency_us: secs * 1e6 / round_trips as f64,
    })
}

pub fn run_performance_comparison() -> anyhow::Result<()> {
    println!("🚀 Sim Portal round-trip performance");
    println!();

    let segment_name = format!("sim-portal-bench-{}", uuid::Uuid::new_v4().simple());

    // Warm-up pass so page faults and thread start-up stay out of the numbers.
    run_round_trip(&segment_name, 1_000)?;

    let results = run_round_trip(&segment_name, 100_000)?;
    results.print();

    Ok(())
}
