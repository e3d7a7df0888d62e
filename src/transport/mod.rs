//! Stream transport: connection lifecycle and message framing.

pub mod connection;
pub mod framer;
pub mod resolve;
pub mod server;

pub use connection::{ConnectStart, Connection, ConnectionState};
pub use framer::{Drained, FrameBuffer};
pub use resolve::{resolve, AddressFamily, Resolution};
pub use server::{ServerModule, SERVER_MODULE, SERVER_VERSION};
