//! Agent Center Protocol Definitions
//!
//! This crate defines the frames exchanged between endpoint agents and the
//! agent center, and the length-prefixed codec used to put them on the wire.

pub mod codec;
pub mod messages;

pub use codec::{CodecError, FrameCodec};
pub use messages::*;

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Record type carried by the agent's own periodic heartbeat
pub const AGENT_HEARTBEAT_DATA_TYPE: i32 = 1000;
