//! # nodepool-id
//!
//! Identity types shared by the node pool controllers.
//!
//! ## Design Principles
//!
//! - Objects are addressed by a compound [`ObjectKey`] (`namespace/name`)
//! - Back references between objects store only keys and uids, never pointers
//! - Uids are typed to prevent mixing them with other identifiers
//!
//! ## Uid Format
//!
//! Object uids use a prefixed format: `{prefix}_{ulid}`, for example
//! `uid_01HV4Z2WQXKJNM8GPQY6VBKC3D`.

mod error;
mod key;
mod macros;
mod types;

pub use error::IdError;
pub use key::ObjectKey;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
