//! A-plus-B demo, struct mode
//!
//! The canonical round trip: the simulation side sends two operands, the
//! agent side answers with their sum. Both sides run in one process here (the
//! agent on a second thread) but talk exclusively through the named shared
//! memory region, exactly as two separate processes would.

use rand::Rng;
use sim_portal::prelude::*;
use tracing::info;

const NUM_ENV: u32 = 10_000;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct EnvStruct {
    env_a: u32,
    env_b: u32,
}
unsafe impl ShmSafe for EnvStruct {}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct ActStruct {
    act_c: u32,
}
unsafe impl ShmSafe for ActStruct {}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let segment_name = format!("apb-demo-{}", uuid::Uuid::new_v4().simple());

    // The agent side creates the region and keeps answering until the
    // simulation marks the channel finished. The creator must be fully
    // constructed before the attacher starts; that ordering is the caller's
    // job, so the channel is built before the attacher side runs.
    let mut channel =
        MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&segment_name))?;
    let agent = std::thread::spawn(move || -> anyhow::Result<u32> {
        let mut answered = 0;
        loop {
            channel.agent_recv_begin();
            if channel.finished() {
                channel.agent_recv_end();
                break;
            }
            let env = *channel.sim2agent();
            channel.agent_recv_end();

            channel.agent_send_begin();
            channel.agent2sim_mut().act_c = env.env_a + env.env_b;
            channel.agent_send_end();
            answered += 1;
        }
        Ok(answered)
    });

    let mut channel = MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&segment_name))?;
    let mut rng = rand::thread_rng();

    for iteration in 0..NUM_ENV {
        let env_a = rng.gen_range(1..=10);
        let env_b = rng.gen_range(1..=10);

        channel.sim_send_begin();
        *channel.sim2agent_mut() = EnvStruct { env_a, env_b };
        channel.sim_send_end();

        channel.sim_recv_begin();
        let act_c = channel.agent2sim().act_c;
        channel.sim_recv_end();

        anyhow::ensure!(
            act_c == env_a + env_b,
            "iteration {}: {} + {} answered {}",
            iteration,
            env_a,
            env_b,
            act_c
        );
    }

    // Dropping the attacher announces shutdown; the agent thread unblocks
    // once, observes the mark, and exits its loop.
    drop(channel);

    let answered = agent.join().expect("agent thread panicked")?;
    info!(answered, "a-plus-b demo complete");
    Ok(())
}
