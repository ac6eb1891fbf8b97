//! Package Trust Verification
//!
//! Signature pinning for the privileged companion app. Before any IPC bind
//! is attempted, the companion package must be installed and signed with a
//! certificate whose SHA-256 digest matches a pinned record, since a
//! malicious package could otherwise masquerade under the same identifier.
//!
//! Trusted digests come from two layers: a builtin table compiled into the
//! client, and a runtime layer that can be replaced wholesale (for example
//! from a server-delivered configuration) and persisted to disk.

mod records;
mod store;
mod verifier;

pub use records::{COMPANION_PACKAGE, SignatureMap, TrustedPackages};
pub use store::{StoreError, load_signatures, save_signatures};
pub use verifier::{PackageRegistry, TrustVerifier, format_certificate_digest};
