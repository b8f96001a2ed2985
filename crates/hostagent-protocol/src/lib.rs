//! Wire protocol for the host agent.
//!
//! The agent speaks newline-delimited JSON over a local stream socket (a named
//! pipe on Windows, a Unix domain socket elsewhere). Every frame is a JSON
//! object tagged by `type`.
//!
//! Most requests are answered by exactly one response frame. Two requests
//! switch the connection into a streaming mode:
//!
//! - `wait` streams `stdout` / `stderr` chunks followed by one `exited` frame.
//! - `keep_alive` expects more `keep_alive` pings from the client, terminated
//!   by `keep_alive_close`; the agent then kills the process and replies with
//!   `keep_alive_ack`.

pub mod expose;
pub mod messages;
pub mod volume;

pub use expose::{Expose, ExposeParseError, Protocol, parse_expose, parse_exposes};
pub use messages::*;
pub use volume::{VolumePath, VolumePathError, parse_volume_path, parse_volume_paths};
