//! # evstore-protocol
//!
//! Wire protocol implementation for the evstore TCP client.
//!
//! This crate provides:
//! - Length-prefixed package framing with optional credentials block
//! - The closed set of TCP commands and their request/completion pairing
//! - A streaming decoder that tolerates arbitrary TCP segmentation
//! - Protocol-buffer payload messages

pub mod codec;
pub mod command;
pub mod error;
pub mod messages;
pub mod package;

pub use codec::Decoder;
pub use command::TcpCommand;
pub use error::ProtocolError;
pub use package::{TcpFlags, TcpPackage, UserCredentials};

/// Default plain TCP port of the server.
pub const DEFAULT_PORT: u16 = 1113;

/// Size of the little-endian length prefix preceding every package.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Maximum package content size (64 MiB).
pub const MAX_PACKAGE_SIZE: usize = 64 * 1024 * 1024;
