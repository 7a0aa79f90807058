pub mod xpc;

pub use xpc::{
    config::Config,
    endpoint::{
        AllocFlags, ChannelStats, Endpoint, Location, MsgHandle, NotifyStats, PartitionInfo, Phase,
    },
    error::{Error, Result},
    fabric::{Fabric, Region},
    machine::{Machine, Port},
    partition::ActState,
    registry::{Event, EventKind, MsgId, Registration},
    ChannelId, PartId,
};
