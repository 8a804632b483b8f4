//! Peer links: framing, heartbeat, request correlation and dispatch.

mod builtins;
mod handler;
mod heartbeat;
mod peer_link;
mod protocol;
mod request;

pub use handler::{Dispatch, HandlerFn, HandlerModule};
pub use heartbeat::{HeartbeatMonitor, Pinger, TimeoutHandler};
pub use peer_link::{
    BoxedReader, BoxedWriter, Dialer, LinkEnv, LinkEvent, LinkPhase, LinkRole, PeerLink, TcpDialer,
};
pub use protocol::{
    close_code, close_payload, lowercase_keys, native, read_frame, write_frame, Envelope, Frame,
    FrameKind, FrameWriter, MessageId, StreamWriter,
};
pub use request::{Outcome, RemoteRequest};
