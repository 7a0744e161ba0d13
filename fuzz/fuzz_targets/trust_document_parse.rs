#![no_main]

use latch_extensions::trust_policy::{normalize_sha256_hex, trust_policy_from_document};
use libfuzzer_sys::fuzz_target;
use serde_json::Value;

fuzz_target!(|data: &[u8]| {
    let Ok(document) = serde_json::from_slice::<Value>(data) else {
        return;
    };
    let (policy, log) = trust_policy_from_document(&document, "fuzz");

    assert!(!policy.denied.iter().any(|name| name.is_empty()));
    assert!(!policy.allowed.iter().any(|name| name.is_empty()));
    assert_eq!(
        policy.requires_allowlist,
        policy.enforce && policy.allowed.is_empty() && policy.denied.is_empty()
    );
    for (name, digest) in &policy.hashes {
        assert_eq!(name, &name.to_ascii_lowercase());
        assert_eq!(normalize_sha256_hex(digest).as_deref(), Some(digest.as_str()));
    }
    if !document.is_object() {
        assert_eq!(log.len(), 1);
    }
});
