//! # hap-transport
//!
//! Everything between the TCP socket and the application.
//!
//! This crate provides:
//! - The per-connection security session (encrypted, sequenced framing)
//! - A request reader that streams firmware uploads to storage
//! - Response and event messages
//! - The connection worker and the TCP server

pub mod connection;
pub mod http;
pub mod ota;
pub mod reader;
pub mod server;
pub mod session;

pub use connection::{AccessoryServices, Connection, EventSender, RequestHandler};
pub use http::{Request, RequestBody, RequestHead, Response};
pub use ota::{FileFirmwareSink, FirmwareSink};
pub use reader::{FramedReader, ReaderConfig};
pub use server::AccessoryServer;
pub use session::{PendingPlaintext, SecuritySession};
