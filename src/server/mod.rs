//! TCP server exposing the in-memory brokers over the wire protocol.

mod handler;

pub use handler::{run_server, run_server_on_listener, Brokers};
