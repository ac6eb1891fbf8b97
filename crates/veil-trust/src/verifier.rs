//! Signature verification against the trusted package table.

use crate::records::TrustedPackages;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::warn;

/// Platform package registry seam. The platform side answers installation
/// queries and hands out the raw signing certificate of an installed
/// package.
pub trait PackageRegistry: Send + Sync {
    /// Whether the registry has an entry for `package_id`.
    fn is_installed(&self, package_id: &str) -> bool;

    /// The DER bytes of the package's signing certificate, or `None` when
    /// the package is absent or its signature block cannot be read.
    fn signing_certificate(&self, package_id: &str) -> Option<Vec<u8>>;
}

/// Format a certificate's SHA-256 digest as colon-separated uppercase hex
/// pairs, e.g. `AE:2E:20:…`.
pub fn format_certificate_digest(certificate: &[u8]) -> String {
    let digest = Sha256::digest(certificate);
    let hex = hex::encode_upper(digest);
    hex.as_bytes()
        .chunks(2)
        .map(|pair| std::str::from_utf8(pair).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(":")
}

/// Verifies that packages are installed and carry a pinned signature.
///
/// Every failure path returns `false` and logs a warning; verification
/// never panics and never propagates platform errors.
#[derive(Clone)]
pub struct TrustVerifier {
    registry: Arc<dyn PackageRegistry>,
    trusted: Arc<TrustedPackages>,
}

impl TrustVerifier {
    pub fn new(registry: Arc<dyn PackageRegistry>, trusted: Arc<TrustedPackages>) -> Self {
        Self { registry, trusted }
    }

    /// Whether the platform package registry has an entry for `package_id`.
    /// No side effects.
    pub fn is_installed(&self, package_id: &str) -> bool {
        self.registry.is_installed(package_id)
    }

    /// Whether the installed package's signing certificate matches one of
    /// the pinned digests for `package_id`.
    pub fn verify_signature(&self, package_id: &str) -> bool {
        let expected = self.trusted.expected_digests(package_id);
        if expected.is_empty() {
            warn!("no trusted signatures found for package {package_id}");
            return false;
        }

        let Some(certificate) = self.registry.signing_certificate(package_id) else {
            warn!("verification failed for package {package_id}, package not found");
            return false;
        };

        let actual = format_certificate_digest(&certificate);
        if expected.contains(&actual) {
            true
        } else {
            warn!("verification failed for package {package_id}, signature mismatch");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::SignatureMap;
    use std::collections::{BTreeSet, HashMap};

    struct FakeRegistry {
        certificates: HashMap<String, Vec<u8>>,
    }

    impl PackageRegistry for FakeRegistry {
        fn is_installed(&self, package_id: &str) -> bool {
            self.certificates.contains_key(package_id)
        }

        fn signing_certificate(&self, package_id: &str) -> Option<Vec<u8>> {
            self.certificates.get(package_id).cloned()
        }
    }

    fn verifier_for(package_id: &str, certificate: &[u8], pinned: &str) -> TrustVerifier {
        let registry = FakeRegistry {
            certificates: HashMap::from([(package_id.to_string(), certificate.to_vec())]),
        };
        let mut builtin = SignatureMap::new();
        builtin.insert(package_id.to_string(), BTreeSet::from([pinned.to_string()]));
        TrustVerifier::new(
            Arc::new(registry),
            Arc::new(TrustedPackages::with_entries(builtin)),
        )
    }

    #[test]
    fn test_digest_format_is_colon_separated_uppercase() {
        let formatted = format_certificate_digest(b"certificate");
        assert_eq!(formatted.len(), 32 * 2 + 31);
        assert!(formatted.split(':').all(|pair| {
            pair.len() == 2 && pair.chars().all(|c| c.is_ascii_hexdigit() && !c.is_lowercase())
        }));
    }

    #[test]
    fn test_verify_accepts_pinned_certificate() {
        let cert = b"companion-release-cert";
        let pinned = format_certificate_digest(cert);
        let verifier = verifier_for("org.example.app", cert, &pinned);

        assert!(verifier.is_installed("org.example.app"));
        assert!(verifier.verify_signature("org.example.app"));
    }

    #[test]
    fn test_verify_rejects_mismatched_certificate() {
        let pinned = format_certificate_digest(b"expected-cert");
        let verifier = verifier_for("org.example.app", b"impostor-cert", &pinned);

        assert!(!verifier.verify_signature("org.example.app"));
    }

    #[test]
    fn test_verify_rejects_unknown_package() {
        let cert = b"cert";
        let pinned = format_certificate_digest(cert);
        let verifier = verifier_for("org.example.app", cert, &pinned);

        assert!(!verifier.is_installed("org.example.missing"));
        assert!(!verifier.verify_signature("org.example.missing"));
    }

    #[test]
    fn test_verify_rejects_package_without_certificate() {
        let registry = FakeRegistry {
            certificates: HashMap::new(),
        };
        let mut builtin = SignatureMap::new();
        builtin.insert(
            "org.example.app".to_string(),
            BTreeSet::from(["AA:BB".to_string()]),
        );
        let verifier = TrustVerifier::new(
            Arc::new(registry),
            Arc::new(TrustedPackages::with_entries(builtin)),
        );

        assert!(!verifier.verify_signature("org.example.app"));
    }
}
