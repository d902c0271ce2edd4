//! A-plus-B demo, vector mode
//!
//! Same round trip as the struct-mode demo, but each hand-off carries a batch
//! of operand pairs. The batch size is agreed up front on both sides; the
//! vectors are resized within the capacity the creator reserved.

use rand::Rng;
use sim_portal::prelude::*;
use tracing::info;

const NUM_ENV: u32 = 10_000;
const APB_SIZE: usize = 3;

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

    let segment_name = format!("apb-vec-demo-{}", uuid::Uuid::new_v4().simple());

    // Creator first: the attacher may only start once the region and its
    // named objects exist.
    let mut config = ChannelConfig::creator(&segment_name);
    config.sim2agent_capacity = APB_SIZE as u32;
    config.agent2sim_capacity = APB_SIZE as u32;
    let mut channel = VecChannel::<EnvStruct, ActStruct>::new(config)?;

    let agent = std::thread::spawn(move || -> anyhow::Result<u32> {
        let mut answered = 0;
        loop {
            channel.agent_recv_begin();
            if channel.finished() {
                channel.agent_recv_end();
                break;
            }
            let batch: Vec<EnvStruct> = channel.sim2agent().to_vec();
            channel.agent_recv_end();

            channel.agent_send_begin();
            let replies = channel.agent2sim_mut();
            replies.resize(batch.len())?;
            for (reply, env) in replies.iter_mut().zip(&batch) {
                reply.act_c = env.env_a + env.env_b;
            }
            channel.agent_send_end();
            answered += 1;
        }
        Ok(answered)
    });

    let mut channel = VecChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&segment_name))?;
    let mut rng = rand::thread_rng();

    for iteration in 0..NUM_ENV {
        let batch: Vec<EnvStruct> = (0..APB_SIZE)
            .map(|_| EnvStruct {
                env_a: rng.gen_range(1..=10),
                env_b: rng.gen_range(1..=10),
            })
            .collect();

        channel.sim_send_begin();
        let out = channel.sim2agent_mut();
        out.resize(APB_SIZE)?;
        out.copy_from_slice(&batch);
        channel.sim_send_end();

        channel.sim_recv_begin();
        let replies = channel.agent2sim();
        anyhow::ensure!(
            replies.len() == APB_SIZE,
            "iteration {}: expected {} replies, got {}",
            iteration,
            APB_SIZE,
            replies.len()
        );
        for (reply, env) in replies.iter().zip(&batch) {
            anyhow::ensure!(
                reply.act_c == env.env_a + env.env_b,
                "iteration {}: {} + {} answered {}",
                iteration,
                env.env_a,
                env.env_b,
                reply.act_c
            );
        }
        channel.sim_recv_end();
    }

    drop(channel);

    let answered = agent.join().expect("agent thread panicked")?;
    info!(answered, batch = APB_SIZE, "a-plus-b vector demo complete");
    Ok(())
}
