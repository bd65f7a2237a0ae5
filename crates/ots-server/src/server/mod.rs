//! SSH server implementation

mod handler;
mod listener;

pub use handler::ConnectionHandler;
pub use listener::{SshServer, SHUTDOWN_GRACE};
