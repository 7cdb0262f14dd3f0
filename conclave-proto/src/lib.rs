//! # conclave-proto
//!
//! The wire protocol layer of the Conclave collaboration hub: endian-aware
//! framed I/O over a duplex byte stream, the fixed base message set, the
//! message-id registry that hands contiguous id ranges to protocol plugins,
//! and the plugin trait pair that higher-level protocols implement to ride
//! on top of the base transport.

pub mod messages;
pub mod pipe;
pub mod plugin;
pub mod registry;

pub use messages::{read_client_state, write_client_state, MessageId};
pub use pipe::{
    protocol_error, read_endian_marker, send_endian_marker, MessageBuffer, PipeReader, PipeWriter,
    ENDIAN_MARKER,
};
pub use plugin::{downcast_state, downcast_state_ref, ClientPlugin, PluginState, ServerPlugin};
pub use registry::MessageTable;
