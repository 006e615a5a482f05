//! The command system: carries time-tagged commands from the network
//! into the store.
//!
//! Network handlers stage decoded commands against their entity; at
//! every tick the system tags the staged entries with the tick
//! timestamp, applies them to the store, and commits the shared kinds
//! under that same timestamp. Store errors are logged and skipped —
//! a bad command from one client must never stall the tick.

use std::io::Write;
use std::sync::Arc;

use anyhow::bail;
use flume::Receiver;
use lattice_protocol::packets::decode_body;
use lattice_protocol::{Decode, Encode};
use lattice_sched::{System, TICK};
use lattice_store::{
    EntityId, StagedQueue, Store, StoreError, Timestamp, Transform, Velocity, HISTORY_LEN,
};
use tracing::{debug, warn};

use crate::network::RoutedFrame;

/// A command a client (or a server-side order source) applies to one
/// entity.
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum UserCommand {
    SetVelocity(Velocity),
    SetVelocityMax(Velocity),
    SetGameTransform(Transform),
    SetHealth(u32),
}

const TAG_VELOCITY: u8 = 1;
const TAG_VELOCITY_MAX: u8 = 2;
const TAG_GAME_TRANSFORM: u8 = 3;
const TAG_HEALTH: u8 = 4;

fn encode_velocity(v: &Velocity, mut w: impl Write) -> anyhow::Result<()> {
    for c in [v.linear.x, v.linear.y, v.linear.z, v.angular.x, v.angular.y, v.angular.z] {
        c.encode(&mut w)?;
    }
    Ok(())
}

fn decode_velocity(r: &mut &[u8]) -> anyhow::Result<Velocity> {
    let mut c = [0f32; 6];
    for slot in &mut c {
        *slot = f32::decode(r)?;
    }
    Ok(Velocity {
        linear: [c[0], c[1], c[2]].into(),
        angular: [c[3], c[4], c[5]].into(),
    })
}

impl Encode for UserCommand {
    fn encode(&self, mut w: impl Write) -> anyhow::Result<()> {
        match self {
            Self::SetVelocity(v) => {
                TAG_VELOCITY.encode(&mut w)?;
                encode_velocity(v, w)
            }
            Self::SetVelocityMax(v) => {
                TAG_VELOCITY_MAX.encode(&mut w)?;
                encode_velocity(v, w)
            }
            Self::SetGameTransform(t) => {
                TAG_GAME_TRANSFORM.encode(&mut w)?;
                for c in [
                    t.translation.x,
                    t.translation.y,
                    t.translation.z,
                    t.orientation.x,
                    t.orientation.y,
                    t.orientation.z,
                    t.orientation.w,
                    t.scale,
                ] {
                    c.encode(&mut w)?;
                }
                Ok(())
            }
            Self::SetHealth(h) => {
                TAG_HEALTH.encode(&mut w)?;
                h.encode(&mut w)
            }
        }
    }
}

impl Decode<'_> for UserCommand {
    fn decode(r: &mut &[u8]) -> anyhow::Result<Self> {
        match u8::decode(r)? {
            TAG_VELOCITY => Ok(Self::SetVelocity(decode_velocity(r)?)),
            TAG_VELOCITY_MAX => Ok(Self::SetVelocityMax(decode_velocity(r)?)),
            TAG_GAME_TRANSFORM => {
                let mut c = [0f32; 8];
                for slot in &mut c {
                    *slot = f32::decode(r)?;
                }
                Ok(Self::SetGameTransform(Transform {
                    translation: [c[0], c[1], c[2]].into(),
                    orientation: glam::Quat::from_xyzw(c[3], c[4], c[5], c[6]),
                    scale: c[7],
                }))
            }
            TAG_HEALTH => Ok(Self::SetHealth(u32::decode(r)?)),
            tag => bail!("unknown command tag {tag}"),
        }
    }
}

fn apply(store: &Store, entity: EntityId, command: UserCommand) -> Result<(), StoreError> {
    match command {
        UserCommand::SetVelocity(v) => store.velocity.update(entity, v),
        UserCommand::SetVelocityMax(v) => store.velocity_max.update(entity, v),
        UserCommand::SetGameTransform(t) => store.game_transform.update(entity, t),
        UserCommand::SetHealth(h) => {
            store.health.update(entity, h);
            Ok(())
        }
    }
}

/// How long applied commands stay queryable before `clean_until`
/// retires them; matches the store's history depth.
const RETENTION_TICKS: i64 = HISTORY_LEN as i64;

/// The simulation system bridging network frames to store commits.
pub struct CommandSystem {
    store: Arc<Store>,
    user_commands: Arc<StagedQueue<UserCommand>>,
    orders: Arc<StagedQueue<UserCommand>>,
    incoming: Receiver<RoutedFrame>,
}

impl CommandSystem {
    #[must_use]
    pub fn new(
        store: Arc<Store>,
        user_commands: Arc<StagedQueue<UserCommand>>,
        orders: Arc<StagedQueue<UserCommand>>,
        incoming: Receiver<RoutedFrame>,
    ) -> Self {
        Self {
            store,
            user_commands,
            orders,
            incoming,
        }
    }

    fn drain_network(&self) {
        for frame in self.incoming.try_iter() {
            match decode_body::<UserCommand>(&frame.body) {
                Ok(command) => {
                    if let Err(e) = self.user_commands.add(frame.entity, command) {
                        debug!(entity = frame.entity, "command refused: {e}");
                    }
                }
                Err(e) => {
                    debug!(entity = frame.entity, "malformed command frame: {e:#}");
                }
            }
        }
    }
}

impl System for CommandSystem {
    fn name(&self) -> &'static str {
        "command-system"
    }

    fn handle_events(&mut self, tick: Timestamp) {
        self.drain_network();

        for (entity, command) in self.user_commands.tag_from(tick) {
            if let Err(e) = apply(&self.store, entity, command) {
                debug!(entity, "user command skipped: {e}");
            }
        }
        for (entity, order) in self.orders.tag_from(tick) {
            if let Err(e) = apply(&self.store, entity, order) {
                debug!(entity, "order skipped: {e}");
            }
        }

        if let Err(e) = self.store.commit_shared(tick) {
            warn!(tick, "commit failed: {e}");
        }

        let horizon = tick - RETENTION_TICKS * TICK.as_nanos() as i64;
        self.user_commands.clean_until(horizon);
        self.orders.clean_until(horizon);
    }

    fn terminate(&mut self) {
        self.user_commands.close();
        self.orders.close();
    }
}
