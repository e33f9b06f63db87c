//! Transport sessions to remote serve-protocol workers.
//!
//! A [`Session`] owns one child process (usually `ssh … nix-store --serve
//! --write`), the handshaken framed connection to it, and the cumulative
//! byte counters for both directions.

pub mod counting;
pub mod error;
pub mod session;
pub mod upload;

pub use counting::{CountingReader, CountingWriter};
pub use error::SessionError;
pub use session::{ServeConnection, Session, SshStoreConfig};
pub use upload::send_closure;
