//! Progressive download path: appendable source plus its transport.

pub mod appendable_source;
pub mod transport;
