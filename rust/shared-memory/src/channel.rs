//! Duplex single-slot message channels
//!
//! A channel binds a segment, a [`SyncBlock`] and one payload slot per
//! direction into a full duplex, single-slot-per-direction message channel
//! between the simulation process and the agent process. Each direction
//! alternates strictly: the producer waits for its "empty" semaphore, writes
//! the slot in place, and signals "full"; the consumer waits for "full",
//! reads, and signals "empty" — so message N is completely written before it
//! is read, and completely read before message N+1 is written. The two
//! directions are independent; a request and its response are correlated only
//! by the callers' own send/receive sequencing.
//!
//! The payload shape is part of the channel's type: [`MsgChannel`] carries
//! one fixed struct per direction, [`VecChannel`] a resizable sequence per
//! direction. Both processes must construct the same channel type over the
//! same names; picking different shapes cannot compile into a working pair
//! because the slot layouts differ and the lookup fails fast.
//!
//! Slot access is only valid between a matching begin/end pair. The channel
//! does not police this; it is the usage contract that makes the
//! no-torn-reads guarantee hold.

use crate::{
    Direction, Result, Role, Segment, ShmSafe, ShmVec, SyncBlock, DEFAULT_SEGMENT_SIZE,
    DEFAULT_VECTOR_CAPACITY,
};
use std::ptr::NonNull;
use tracing::debug;

/// Channel construction parameters.
///
/// Both processes must agree on every string (byte-identical) and disagree on
/// `role` (exactly one creator). `segment_size` and the vector capacities are
/// honored on the creator side only; attachers inherit whatever the creator
/// built.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub role: Role,
    /// Send the shutdown mark automatically when the channel is dropped
    /// without an explicit [`MsgChannel::finish`]. Attacher side only.
    pub handle_finish: bool,
    /// Segment capacity in bytes (creator only).
    pub segment_size: u32,
    pub segment_name: String,
    pub sim2agent_name: String,
    pub agent2sim_name: String,
    pub sync_name: String,
    /// Element capacity reserved for the sim-to-agent vector (creator only,
    /// vector mode only).
    pub sim2agent_capacity: u32,
    /// Element capacity reserved for the agent-to-sim vector (creator only,
    /// vector mode only).
    pub agent2sim_capacity: u32,
}

impl ChannelConfig {
    /// Configuration for the creating side (conventionally the agent
    /// process, which is started first and owns the region's lifetime).
    pub fn creator(segment_name: impl Into<String>) -> Self {
        Self::with_role(Role::Creator, segment_name)
    }

    /// Configuration for the attaching side (conventionally the simulation
    /// process). Attachers default to announcing shutdown on drop.
    pub fn attacher(segment_name: impl Into<String>) -> Self {
        let mut config = Self::with_role(Role::Attacher, segment_name);
        config.handle_finish = true;
        config
    }

    fn with_role(role: Role, segment_name: impl Into<String>) -> Self {
        Self {
            role,
            handle_finish: false,
            segment_size: DEFAULT_SEGMENT_SIZE,
            segment_name: segment_name.into(),
            sim2agent_name: "sim2agent".to_string(),
            agent2sim_name: "agent2sim".to_string(),
            sync_name: "sync-block".to_string(),
            sim2agent_capacity: DEFAULT_VECTOR_CAPACITY,
            agent2sim_capacity: DEFAULT_VECTOR_CAPACITY,
        }
    }
}

/// Segment/sync plumbing shared by both channel flavors.
struct ChannelCore {
    segment: Segment,
    sync: NonNull<SyncBlock>,
    handle_finish: bool,
    finished_seen: bool,
    finish_sent: bool,
}

// Safety: the sync pointer targets the segment mapping owned by this value;
// the protocol serializes all cross-process access.
unsafe impl Send for ChannelCore {}

impl ChannelCore {
    fn new(config: &ChannelConfig) -> Result<Self> {
        let segment = match config.role {
            Role::Creator => {
                // Unconditionally clear any stale region a crashed previous
                // run left behind; recovery is part of creation.
                let _ = Segment::remove(&config.segment_name);
                Segment::create(&config.segment_name, config.segment_size as usize)?
            }
            Role::Attacher => Segment::attach(&config.segment_name)?,
        };

        let sync = match config.role {
            Role::Creator => segment.construct(&config.sync_name, SyncBlock::new())?,
            Role::Attacher => segment.find(&config.sync_name)?,
        };

        Ok(Self {
            segment,
            sync,
            handle_finish: config.handle_finish,
            finished_seen: false,
            finish_sent: false,
        })
    }

    fn sync(&self) -> &SyncBlock {
        unsafe { self.sync.as_ref() }
    }

    fn send_begin(&self, direction: Direction) {
        self.sync().empty(direction).wait();
    }

    fn send_end(&self, direction: Direction) {
        self.sync().full(direction).signal();
    }

    fn recv_begin(&self, direction: Direction) {
        self.sync().full(direction).wait();
    }

    fn recv_end(&self, direction: Direction) {
        self.sync().empty(direction).signal();
    }

    /// The shutdown visibility point: called right after `recv_begin` on the
    /// sim-to-agent direction, where the mark travels.
    fn latch_finished(&mut self) {
        self.finished_seen = self.sync().is_finished();
    }

    fn finish(&mut self) {
        if self.finish_sent {
            return;
        }
        // The mark rides a normal full handshake on the direction the
        // terminating side sends on; the slot contents are not meaningful for
        // this hand-off.
        self.send_begin(Direction::SimToAgent);
        self.sync().set_finished();
        self.send_end(Direction::SimToAgent);
        self.finish_sent = true;
        debug!(segment = %self.segment.name(), "marked channel finished");
    }

    fn finish_on_drop(&mut self) {
        if self.handle_finish && self.segment.role() == Role::Attacher && !self.finish_sent {
            self.finish();
        }
    }
}

/// Duplex channel carrying one fixed POD struct per direction.
///
/// `S` is the sim-to-agent payload type, `A` the agent-to-sim payload type.
/// Both processes must instantiate the pair identically; the raw memory image
/// is the wire format, so the structs must have the same layout in both
/// binaries.
pub struct MsgChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
    core: ChannelCore,
    sim2agent: NonNull<S>,
    agent2sim: NonNull<A>,
}

// Safety: the slot pointers target the segment mapping owned by `core`.
unsafe impl<S, A> Send for MsgChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
}

impl<S, A> MsgChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
    /// Construct (creator) or look up (attacher) the channel described by
    /// `config`. The creator initializes both slots to their defaults.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let core = ChannelCore::new(&config)?;
        let (sim2agent, agent2sim) = match config.role {
            Role::Creator => (
                core.segment.construct(&config.sim2agent_name, S::default())?,
                core.segment.construct(&config.agent2sim_name, A::default())?,
            ),
            Role::Attacher => (
                core.segment.find(&config.sim2agent_name)?,
                core.segment.find(&config.agent2sim_name)?,
            ),
        };
        debug!(
            segment = %config.segment_name,
            role = ?config.role,
            "message channel ready"
        );
        Ok(Self {
            core,
            sim2agent,
            agent2sim,
        })
    }

    // Simulation side

    /// Block until the sim-to-agent slot is writable.
    pub fn sim_send_begin(&mut self) {
        self.core.send_begin(Direction::SimToAgent);
    }

    /// Publish the sim-to-agent slot. The slot must not be touched again
    /// until the next `sim_send_begin` returns.
    pub fn sim_send_end(&mut self) {
        self.core.send_end(Direction::SimToAgent);
    }

    /// Block until an agent-to-sim payload is available.
    pub fn sim_recv_begin(&mut self) {
        self.core.recv_begin(Direction::AgentToSim);
    }

    /// Release the agent-to-sim slot back to the agent.
    pub fn sim_recv_end(&mut self) {
        self.core.recv_end(Direction::AgentToSim);
    }

    // Agent side

    /// Block until a sim-to-agent payload is available. This is also where a
    /// freshly set shutdown mark becomes visible; check [`Self::finished`]
    /// before interpreting the slot.
    pub fn agent_recv_begin(&mut self) {
        self.core.recv_begin(Direction::SimToAgent);
        self.core.latch_finished();
    }

    /// Release the sim-to-agent slot back to the simulation.
    pub fn agent_recv_end(&mut self) {
        self.core.recv_end(Direction::SimToAgent);
    }

    /// Block until the agent-to-sim slot is writable.
    pub fn agent_send_begin(&mut self) {
        self.core.send_begin(Direction::AgentToSim);
    }

    /// Publish the agent-to-sim slot.
    pub fn agent_send_end(&mut self) {
        self.core.send_end(Direction::AgentToSim);
    }

    // Payload slots; only valid between a matching begin/end pair.

    pub fn sim2agent(&self) -> &S {
        unsafe { self.sim2agent.as_ref() }
    }

    pub fn sim2agent_mut(&mut self) -> &mut S {
        unsafe { self.sim2agent.as_mut() }
    }

    pub fn agent2sim(&self) -> &A {
        unsafe { self.agent2sim.as_ref() }
    }

    pub fn agent2sim_mut(&mut self) -> &mut A {
        unsafe { self.agent2sim.as_mut() }
    }

    /// Announce that no further sim-to-agent messages will follow. One-shot;
    /// called by the terminating (simulation) side.
    pub fn finish(&mut self) {
        self.core.finish();
    }

    /// Whether a shutdown mark has been observed by [`Self::agent_recv_begin`].
    /// Once true, stays true.
    pub fn finished(&self) -> bool {
        self.core.finished_seen
    }

    pub fn segment(&self) -> &Segment {
        &self.core.segment
    }
}

impl<S, A> Drop for MsgChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
    fn drop(&mut self) {
        self.core.finish_on_drop();
    }
}

/// Duplex channel carrying a resizable sequence of POD structs per direction.
///
/// The creator reserves element storage up front (`sim2agent_capacity` /
/// `agent2sim_capacity`); producers resize within that reservation during
/// their write window. The expected element count is a configuration
/// contract between the two processes, agreed before traffic begins.
pub struct VecChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
    core: ChannelCore,
    sim2agent: ShmVec<S>,
    agent2sim: ShmVec<A>,
}

impl<S, A> VecChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
    /// Construct (creator) or look up (attacher) the vector channel described
    /// by `config`. Both vectors start empty.
    pub fn new(config: ChannelConfig) -> Result<Self> {
        let core = ChannelCore::new(&config)?;
        let (sim2agent, agent2sim) = match config.role {
            Role::Creator => (
                ShmVec::construct(
                    &core.segment,
                    &config.sim2agent_name,
                    config.sim2agent_capacity as usize,
                )?,
                ShmVec::construct(
                    &core.segment,
                    &config.agent2sim_name,
                    config.agent2sim_capacity as usize,
                )?,
            ),
            Role::Attacher => (
                ShmVec::find(&core.segment, &config.sim2agent_name)?,
                ShmVec::find(&core.segment, &config.agent2sim_name)?,
            ),
        };
        debug!(
            segment = %config.segment_name,
            role = ?config.role,
            "vector channel ready"
        );
        Ok(Self {
            core,
            sim2agent,
            agent2sim,
        })
    }

    // Simulation side

    pub fn sim_send_begin(&mut self) {
        self.core.send_begin(Direction::SimToAgent);
    }

    pub fn sim_send_end(&mut self) {
        self.core.send_end(Direction::SimToAgent);
    }

    pub fn sim_recv_begin(&mut self) {
        self.core.recv_begin(Direction::AgentToSim);
    }

    pub fn sim_recv_end(&mut self) {
        self.core.recv_end(Direction::AgentToSim);
    }

    // Agent side

    pub fn agent_recv_begin(&mut self) {
        self.core.recv_begin(Direction::SimToAgent);
        self.core.latch_finished();
    }

    pub fn agent_recv_end(&mut self) {
        self.core.recv_end(Direction::SimToAgent);
    }

    pub fn agent_send_begin(&mut self) {
        self.core.send_begin(Direction::AgentToSim);
    }

    pub fn agent_send_end(&mut self) {
        self.core.send_end(Direction::AgentToSim);
    }

    // Payload slots; only valid between a matching begin/end pair.

    pub fn sim2agent(&self) -> &ShmVec<S> {
        &self.sim2agent
    }

    pub fn sim2agent_mut(&mut self) -> &mut ShmVec<S> {
        &mut self.sim2agent
    }

    pub fn agent2sim(&self) -> &ShmVec<A> {
        &self.agent2sim
    }

    pub fn agent2sim_mut(&mut self) -> &mut ShmVec<A> {
        &mut self.agent2sim
    }

    /// Announce that no further sim-to-agent messages will follow.
    pub fn finish(&mut self) {
        self.core.finish();
    }

    /// Whether a shutdown mark has been observed by [`Self::agent_recv_begin`].
    pub fn finished(&self) -> bool {
        self.core.finished_seen
    }

    pub fn segment(&self) -> &Segment {
        &self.core.segment
    }
}

impl<S, A> Drop for VecChannel<S, A>
where
    S: ShmSafe + Copy + Default,
    A: ShmSafe + Copy + Default,
{
    fn drop(&mut self) {
        self.core.finish_on_drop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[repr(C)]
    #[derive(Clone, Copy, Default, Debug, PartialEq)]
    struct EnvStruct {
        a: u32,
        b: u32,
    }
    unsafe impl ShmSafe for EnvStruct {}

    #[repr(C)]
    #[derive(Clone, Copy, Default, Debug, PartialEq)]
    struct ActStruct {
        c: u32,
    }
    unsafe impl ShmSafe for ActStruct {}

    fn unique_name(tag: &str) -> String {
        format!("sim-portal-{}-{}", tag, uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_round_trip_10k_randomized() {
        const ITERATIONS: u32 = 10_000;
        let name = unique_name("apb");

        let mut agent =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name)).unwrap();

        let sim_name = name.clone();
        let sim = std::thread::spawn(move || {
            let mut channel =
                MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&sim_name))
                    .unwrap();
            let mut rng = rand::thread_rng();

            for _ in 0..ITERATIONS {
                let a = rng.gen_range(1..=10);
                let b = rng.gen_range(1..=10);

                channel.sim_send_begin();
                *channel.sim2agent_mut() = EnvStruct { a, b };
                channel.sim_send_end();

                channel.sim_recv_begin();
                // Exactly this iteration's sum, never a stale value.
                assert_eq!(channel.agent2sim().c, a + b);
                channel.sim_recv_end();
            }
        });

        for _ in 0..ITERATIONS {
            agent.agent_recv_begin();
            assert!(!agent.finished());
            let env = *agent.sim2agent();
            agent.agent_recv_end();

            agent.agent_send_begin();
            agent.agent2sim_mut().c = env.a + env.b;
            agent.agent_send_end();
        }

        sim.join().unwrap();
        // One shutdown mark still arrives from the attacher's drop.
        agent.agent_recv_begin();
        assert!(agent.finished());
        agent.agent_recv_end();
    }

    #[test]
    fn test_shutdown_visibility() {
        let name = unique_name("shutdown");
        let mut agent =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name)).unwrap();

        let sim_name = name.clone();
        let sim = std::thread::spawn(move || {
            let mut channel =
                MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&sim_name))
                    .unwrap();
            for i in 0..3 {
                channel.sim_send_begin();
                *channel.sim2agent_mut() = EnvStruct { a: i, b: i };
                channel.sim_send_end();
            }
            channel.finish();
        });

        let mut received = 0;
        loop {
            agent.agent_recv_begin();
            let done = agent.finished();
            agent.agent_recv_end();
            if done {
                break;
            }
            received += 1;
        }
        assert_eq!(received, 3);
        // The mark is one-shot and sticky.
        assert!(agent.finished());

        sim.join().unwrap();
    }

    #[test]
    fn test_finish_sent_on_drop() {
        let name = unique_name("dropfin");
        let mut agent =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name)).unwrap();

        let sim_name = name.clone();
        let sim = std::thread::spawn(move || {
            let mut channel =
                MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&sim_name))
                    .unwrap();
            channel.sim_send_begin();
            *channel.sim2agent_mut() = EnvStruct { a: 1, b: 2 };
            channel.sim_send_end();
            // Dropped here without an explicit finish; handle_finish covers it.
        });

        agent.agent_recv_begin();
        assert!(!agent.finished());
        agent.agent_recv_end();

        agent.agent_recv_begin();
        assert!(agent.finished());
        agent.agent_recv_end();

        sim.join().unwrap();
    }

    #[test]
    fn test_vector_round_trip() {
        const ITERATIONS: u32 = 100;
        const BATCH: usize = 3;
        let name = unique_name("apbvec");

        let mut config = ChannelConfig::creator(&name);
        config.sim2agent_capacity = 8;
        config.agent2sim_capacity = 8;
        let mut agent = VecChannel::<EnvStruct, ActStruct>::new(config).unwrap();

        let sim_name = name.clone();
        let sim = std::thread::spawn(move || {
            let mut channel =
                VecChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&sim_name))
                    .unwrap();
            let mut rng = rand::thread_rng();

            for _ in 0..ITERATIONS {
                let batch: Vec<EnvStruct> = (0..BATCH)
                    .map(|_| EnvStruct {
                        a: rng.gen_range(1..=10),
                        b: rng.gen_range(1..=10),
                    })
                    .collect();

                channel.sim_send_begin();
                let out = channel.sim2agent_mut();
                out.resize(BATCH).unwrap();
                out.copy_from_slice(&batch);
                channel.sim_send_end();

                channel.sim_recv_begin();
                let sums = channel.agent2sim();
                assert_eq!(sums.len(), BATCH);
                for (reply, env) in sums.iter().zip(&batch) {
                    assert_eq!(reply.c, env.a + env.b);
                }
                channel.sim_recv_end();
            }
        });

        for _ in 0..ITERATIONS {
            agent.agent_recv_begin();
            assert!(!agent.finished());
            let batch: Vec<EnvStruct> = agent.sim2agent().to_vec();
            assert_eq!(batch.len(), BATCH);
            agent.agent_recv_end();

            agent.agent_send_begin();
            let out = agent.agent2sim_mut();
            out.resize(BATCH).unwrap();
            for (reply, env) in out.iter_mut().zip(&batch) {
                reply.c = env.a + env.b;
            }
            agent.agent_send_end();
        }

        sim.join().unwrap();
        agent.agent_recv_begin();
        assert!(agent.finished());
        agent.agent_recv_end();
    }

    #[test]
    fn test_attach_before_create_fails() {
        let name = unique_name("orphan");
        match MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&name)) {
            Err(crate::ShmError::RegionNotFound(_)) => {}
            other => panic!("expected RegionNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_creator_restart_over_stale_region() {
        let name = unique_name("restart");

        let mut first =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name)).unwrap();
        first.sim2agent_mut().a = 99;
        // Model an ungraceful shutdown: the process dies without removing the
        // region, leaving the OS object and its contents behind.
        std::mem::forget(first);

        let second =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name)).unwrap();
        assert_eq!(*second.sim2agent(), EnvStruct::default());
        assert!(!second.finished());
    }

    #[test]
    fn test_independent_channels_do_not_interfere() {
        let name_x = unique_name("chanx");
        let name_y = unique_name("chany");

        let mut agent_x =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name_x)).unwrap();
        let mut agent_y =
            MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::creator(&name_y)).unwrap();

        let (sim_x_name, sim_y_name) = (name_x.clone(), name_y.clone());
        let sim = std::thread::spawn(move || {
            let mut x =
                MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&sim_x_name))
                    .unwrap();
            let mut y =
                MsgChannel::<EnvStruct, ActStruct>::new(ChannelConfig::attacher(&sim_y_name))
                    .unwrap();
            for i in 0..10 {
                x.sim_send_begin();
                *x.sim2agent_mut() = EnvStruct { a: i, b: 0 };
                x.sim_send_end();

                y.sim_send_begin();
                *y.sim2agent_mut() = EnvStruct { a: 0, b: i };
                y.sim_send_end();
            }
        });

        for i in 0..10 {
            agent_x.agent_recv_begin();
            assert_eq!(*agent_x.sim2agent(), EnvStruct { a: i, b: 0 });
            agent_x.agent_recv_end();

            agent_y.agent_recv_begin();
            assert_eq!(*agent_y.sim2agent(), EnvStruct { a: 0, b: i });
            agent_y.agent_recv_end();
        }

        sim.join().unwrap();
        for channel in [&mut agent_x, &mut agent_y] {
            channel.agent_recv_begin();
            assert!(channel.finished());
            channel.agent_recv_end();
        }
    }

    #[test]
    fn test_tagged_variant_payload() {
        #[repr(C, u8)]
        #[derive(Clone, Copy, Default, Debug, PartialEq)]
        enum Command {
            #[default]
            Idle,
            SetRate(u32),
            Stop,
        }
        unsafe impl ShmSafe for Command {}

        let name = unique_name("tagged");
        let mut agent =
            MsgChannel::<EnvStruct, Command>::new(ChannelConfig::creator(&name)).unwrap();

        let sim_name = name.clone();
        let sim = std::thread::spawn(move || {
            let mut channel =
                MsgChannel::<EnvStruct, Command>::new(ChannelConfig::attacher(&sim_name)).unwrap();
            let mut rates = Vec::new();
            loop {
                channel.sim_recv_begin();
                let command = *channel.agent2sim();
                channel.sim_recv_end();
                match command {
                    Command::Idle => {}
                    Command::SetRate(rate) => rates.push(rate),
                    Command::Stop => break,
                }
            }
            rates
        });

        for command in [Command::Idle, Command::SetRate(54), Command::Stop] {
            agent.agent_send_begin();
            *agent.agent2sim_mut() = command;
            agent.agent_send_end();
        }

        assert_eq!(sim.join().unwrap(), vec![54]);
        // Drain the attacher's drop-time shutdown mark.
        agent.agent_recv_begin();
        assert!(agent.finished());
        agent.agent_recv_end();
    }
}
