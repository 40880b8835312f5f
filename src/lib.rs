//! Ferry - remote shell relay with chunked file transfer, plus a LAN file drop
//!
//! The relay bridges a browser terminal to an SSH shell over one websocket
//! and multiplexes flow-controlled uploads and downloads onto the same
//! connection. The local server is a plain HTTP upload/download/delete surface
//! rooted at one directory.

pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod listen;
pub mod local;
pub mod logging;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use error::{TransferError, TransportError};
pub use protocol::{ClientEvent, Credentials, ServerEvent};
