// Stream-multiplexed messaging over framed TCP sockets.
//
// A `MsgLoop` runs a pool of workers, each a single task owning a set of
// sockets. Many logical streams are multiplexed over one socket; a stream
// is bound to exactly one worker at each endpoint for its lifetime. All
// cross-worker interaction happens by posting commands onto a worker's
// bounded queue; there is no shared mutable state on the hot path.
pub mod allocator;
pub mod event_loop;
pub mod flow;
pub mod msg_loop;
pub mod socket;

pub use event_loop::{Command, WorkerCtx};
pub use flow::Flow;
pub use msg_loop::{
    current_worker_index, MessageCallback, MsgLoop, MsgLoopHandle, MsgLoopOptions, StreamKey,
    TickCallback, UnhealthyCallback, WorkerStateFactory,
};

pub type Result<T> = cascade_common::Result<T>;

/// Identifies a socket within one `MsgLoop`.
pub type SocketId = u64;
