//! Edge relay (spec.md §4.10, component C10): a node that is simultaneously
//! a server to local clients (via [`server::relay_push_commit`], which
//! wraps the ordinary push pipeline with an atomic forward-outbox enqueue)
//! and a client to an upstream server (via [`forward::forward_once`] and
//! [`pull_engine::relay_pull_once`]), coordinated by a [`mode::ModeManager`]
//! that tracks upstream reachability.

pub mod backoff;
pub mod forward;
pub mod forward_outbox;
pub mod mode;
pub mod pull_engine;
pub mod sequence_map;
pub mod server;

pub use forward::{
    forward_once,
    ForwardOutcome,
};
pub use forward_outbox::{
    ForwardOutboxEntry,
    ForwardStatus,
    InMemoryForwardOutbox,
};
pub use mode::{
    Mode,
    ModeManager,
};
pub use pull_engine::{
    relay_pull_once,
    MirroredTable,
    OnRelayPullReject,
    PullRoundReport,
};
pub use sequence_map::{
    InMemorySequenceMap,
    SequenceMapEntry,
    SequenceStatus,
};
pub use server::relay_push_commit;
