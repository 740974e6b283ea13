//! Types shared between nestrun and the daemon it drives.

pub mod errors;
pub mod records;

pub use errors::{NestrunError, NestrunResult};
