//! Remote access to the discovery authority
pub mod client;

pub use client::HttpAuthority;
