//! SMB2 adapter: a blocking client for dialects 2.0.2 and 2.1 with NTLM
//! authentication, wrapped into the async storage contract.

mod adapter;
pub mod client;
pub mod error;
#[cfg(test)]
mod mock_server;
mod netbios;
pub mod ntlm;
pub mod protocol;
mod spnego;

pub use adapter::SmbAdapter;
pub use client::SmbClient;
pub use error::{NtStatus, SmbError, SmbResult};
