//! bastion-core: shared protocol library for the SSH bastion.
//!
//! Provides the tunnel control messages and binary frame codec spoken between
//! the bastion and its agents, identity-string parsing, target patterns,
//! authorized_keys parsing, the audit record format, and the common error type.

pub mod audit;
pub mod codec;
pub mod error;
pub mod identity;
pub mod keys;
pub mod messages;
pub mod pattern;

// Re-export commonly used items at crate root.
pub use codec::{decode_data_frame, encode_data_frame, validate_session_id, FRAME_DELIMITER};
pub use error::{BastionError, BastionResult};
pub use identity::{fingerprint, target_with_port, PrincipalRequest};
pub use messages::{AckStatus, ControlMessage, WireMessage};
pub use pattern::TargetPattern;
