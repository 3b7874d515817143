//! Account handling
//!
//! - [`AccountBuilder`]: records → protocol credentials
//! - [`diff`]: snapshot comparison driving incremental provisioning
//! - [`Cipher`]: Shadowsocks cipher table and key derivation

pub mod builder;
pub mod cipher;
pub mod diff;

pub use builder::{AccountBuilder, AccountDescriptor, BuildParams, Credential};
pub use cipher::{Cipher, derive_key};
pub use diff::{AccountDiff, diff};
