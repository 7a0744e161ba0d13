//! Trust policy admission check for one scanned extension file.

use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{
    safe_fs::{ExtensionFile, ExtensionScope},
    trust_policy::TrustPolicy,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionRejection {
    #[error("blocked by trust policy (denied)")]
    Denied,
    #[error(
        "blocked by trust policy (project-local extensions are not loaded unless trust is enforced or explicitly disabled)"
    )]
    UntrustedProjectExtension,
    #[error("blocked by trust policy (enforced without an allowlist)")]
    EnforcedWithoutAllowlist,
    #[error("blocked by trust policy (not in allowlist)")]
    NotAllowlisted,
    #[error("blocked by trust policy (integrity hash required but not pinned)")]
    MissingHash,
    #[error("integrity hash mismatch (expected {expected}, found {actual})")]
    HashMismatch { expected: String, actual: String },
    #[error("integrity hash mismatch (unable to hash file: {0})")]
    HashUnavailable(String),
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn sha256_file_hex(path: &Path) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(sha256_hex(&bytes))
}

/// Decides whether `file` may run under `policy`.
pub fn check_extension_admission(
    file: &ExtensionFile,
    policy: &TrustPolicy,
) -> Result<(), AdmissionRejection> {
    let key = file.policy_key();
    if policy.is_denied(&key) {
        return Err(AdmissionRejection::Denied);
    }
    if !policy.enforce {
        if file.scope == ExtensionScope::Project && !policy.is_explicit_opt_out() {
            return Err(AdmissionRejection::UntrustedProjectExtension);
        }
        return Ok(());
    }
    if policy.requires_allowlist {
        return Err(AdmissionRejection::EnforcedWithoutAllowlist);
    }
    if !policy.allowed.is_empty() && !policy.is_allowlisted(&key) {
        return Err(AdmissionRejection::NotAllowlisted);
    }
    match policy.pinned_hash(&key) {
        None if policy.require_hashes => Err(AdmissionRejection::MissingHash),
        None => Ok(()),
        Some(expected) => {
            let actual = sha256_file_hex(&file.path)
                .map_err(|error| AdmissionRejection::HashUnavailable(format!("{error:#}")))?;
            if actual != expected {
                return Err(AdmissionRejection::HashMismatch {
                    expected: expected.to_string(),
                    actual,
                });
            }
            Ok(())
        }
    }
}

/// Digest an admitted file was checked against, if any. Pins only apply under
/// enforcement.
pub fn admitted_sha256<'a>(file: &ExtensionFile, policy: &'a TrustPolicy) -> Option<&'a str> {
    if !policy.enforce {
        return None;
    }
    policy.pinned_hash(&file.policy_key())
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs, path::PathBuf};

    use tempfile::tempdir;

    use super::{admitted_sha256, check_extension_admission, sha256_hex, AdmissionRejection};
    use crate::{
        safe_fs::{ExtensionFile, ExtensionScope},
        trust_policy::TrustPolicy,
    };

    fn file(name: &str, scope: ExtensionScope) -> ExtensionFile {
        ExtensionFile {
            path: PathBuf::from(format!("/nonexistent/{name}.js")),
            name: name.to_string(),
            scope,
        }
    }

    fn names(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn unit_sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"test"),
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn unit_unenforced_policy_admits_global_and_blocks_project_extensions() {
        let policy = TrustPolicy::default();
        assert_eq!(
            check_extension_admission(&file("audit", ExtensionScope::Global), &policy),
            Ok(())
        );
        assert_eq!(
            check_extension_admission(&file("audit", ExtensionScope::Project), &policy),
            Err(AdmissionRejection::UntrustedProjectExtension)
        );
    }

    #[test]
    fn unit_explicit_opt_out_admits_project_extensions() {
        let policy = TrustPolicy {
            explicit_enforce: Some(false),
            ..TrustPolicy::default()
        };
        assert_eq!(
            check_extension_admission(&file("audit", ExtensionScope::Project), &policy),
            Ok(())
        );
    }

    #[test]
    fn regression_deny_wins_over_allow_for_every_scope() {
        let policy = TrustPolicy {
            enforce: true,
            allowed: names(&["deploy"]),
            denied: names(&["deploy"]),
            ..TrustPolicy::default()
        };
        for scope in [ExtensionScope::Global, ExtensionScope::Project] {
            assert_eq!(
                check_extension_admission(&file("Deploy", scope), &policy),
                Err(AdmissionRejection::Denied)
            );
        }
        let unenforced = TrustPolicy {
            denied: names(&["deploy"]),
            ..TrustPolicy::default()
        };
        assert_eq!(
            check_extension_admission(&file("deploy", ExtensionScope::Global), &unenforced),
            Err(AdmissionRejection::Denied)
        );
    }

    #[test]
    fn regression_enforcement_without_rules_denies_everything() {
        let policy = TrustPolicy {
            enforce: true,
            explicit_enforce: Some(true),
            requires_allowlist: true,
            ..TrustPolicy::default()
        };
        for scope in [ExtensionScope::Global, ExtensionScope::Project] {
            assert_eq!(
                check_extension_admission(&file("anything", scope), &policy),
                Err(AdmissionRejection::EnforcedWithoutAllowlist)
            );
        }
    }

    #[test]
    fn functional_allowlist_and_required_hashes_gate_admission() {
        let policy = TrustPolicy {
            enforce: true,
            allowed: names(&["deploy", "audit"]),
            require_hashes: true,
            ..TrustPolicy::default()
        };
        assert_eq!(
            check_extension_admission(&file("other", ExtensionScope::Global), &policy),
            Err(AdmissionRejection::NotAllowlisted)
        );
        assert_eq!(
            check_extension_admission(&file("deploy", ExtensionScope::Project), &policy),
            Err(AdmissionRejection::MissingHash)
        );

        let deny_only = TrustPolicy {
            enforce: true,
            denied: names(&["legacy"]),
            ..TrustPolicy::default()
        };
        assert_eq!(
            check_extension_admission(&file("fresh", ExtensionScope::Project), &deny_only),
            Ok(())
        );
    }

    #[test]
    fn functional_pinned_hash_is_verified_against_file_bytes() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("deploy.js");
        fs::write(&path, "test").expect("write");
        let extension = ExtensionFile {
            path: path.clone(),
            name: "deploy".to_string(),
            scope: ExtensionScope::Global,
        };
        let mut policy = TrustPolicy {
            enforce: true,
            allowed: names(&["deploy"]),
            require_hashes: true,
            ..TrustPolicy::default()
        };
        policy
            .hashes
            .insert("deploy".to_string(), sha256_hex(b"test"));
        assert_eq!(check_extension_admission(&extension, &policy), Ok(()));

        fs::write(&path, "tesT").expect("mutate");
        let error = check_extension_admission(&extension, &policy).expect_err("mismatch");
        assert!(matches!(error, AdmissionRejection::HashMismatch { .. }));
        assert!(error.to_string().starts_with("integrity hash mismatch"));

        fs::remove_file(&path).expect("remove");
        let error = check_extension_admission(&extension, &policy).expect_err("missing file");
        assert!(matches!(error, AdmissionRejection::HashUnavailable(_)));
        assert!(error.to_string().starts_with("integrity hash mismatch"));
    }

    #[test]
    fn unit_admitted_sha256_only_carries_pins_under_enforcement() {
        let extension = file("Deploy", ExtensionScope::Global);
        let mut enforced = TrustPolicy {
            enforce: true,
            allowed: names(&["deploy"]),
            ..TrustPolicy::default()
        };
        assert_eq!(admitted_sha256(&extension, &enforced), None);
        enforced
            .hashes
            .insert("deploy".to_string(), sha256_hex(b"test"));
        assert_eq!(
            admitted_sha256(&extension, &enforced),
            Some(sha256_hex(b"test").as_str())
        );

        let unenforced = TrustPolicy {
            hashes: enforced.hashes.clone(),
            ..TrustPolicy::default()
        };
        assert_eq!(admitted_sha256(&extension, &unenforced), None);
    }
}
