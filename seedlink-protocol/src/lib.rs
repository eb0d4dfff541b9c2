//! SeedLink v3 protocol types, commands, and frame encoding.
//!
//! This crate provides the wire layer used by the seedlink-hub server:
//! command parsing, 24-bit message numbers, `TIME` argument parsing,
//! text responses, and the 520-byte data/INFO frame codec.

pub mod command;
pub mod error;
pub mod frame;
pub mod response;
pub mod sequence;
pub mod time;

pub use command::Command;
pub use error::{Result, SeedlinkError};
pub use frame::{DataFrame, RawFrame};
pub use response::Response;
pub use sequence::MessageNumber;
pub use time::CivilTime;
