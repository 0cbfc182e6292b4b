//! Local control socket for mesh nodes.
//!
//! Administrative commands ("directives") reach a running node over a Unix
//! socket. The [`ControlListener`] parses each request and hands it to a
//! [`DirectiveExecutor`]; [`send_directive`] is the matching client.

pub mod client;
pub mod listener;
pub mod protocol;

pub use client::{send_directive, READ_SIZE, STDIN_PAYLOAD};
pub use listener::{remove_socket, ControlListener, DirectiveExecutor};
pub use protocol::{find_delimiter, ControlError, DirectiveRequest, DELIM, MAX_REQUEST_SIZE};
