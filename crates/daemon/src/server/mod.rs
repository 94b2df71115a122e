//! SSH front end.
//!
//! - [`listener`]: host key loading, socket binding and the accept loop
//! - [`connection`]: per-connection authentication and channel requests
//! - [`remote`]: the SSH channel a session writes to

pub mod connection;
pub mod listener;
pub mod remote;

pub use connection::ConnectionHandler;
pub use listener::{default_host_key_path, load_host_key, BoundServer, Server, ServerError};
pub use remote::SshChannel;
