// ecall-common - Shared wire protocol and transport for the ecall RPC runtime
//
// Both the client and the server speak through the same framed Connection.

pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod types;

// Re-export for convenience
pub use config::*;
pub use connection::*;
pub use error::*;
pub use protocol::*;
pub use types::*;
