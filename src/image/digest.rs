// Deterministic cache digests derived from an image reference.
//
// The digest keys the on-disk artifact cache, so it only has to be stable
// for a given reference string. It is not a content digest of the artifact
// bytes; the registry-side content digest is resolved by the download URL.

use sha2::{Digest, Sha256};

/// Algorithm tag prefixed to every cache digest.
pub const DIGEST_PREFIX: &str = "sha256:";

/// Number of hex characters kept after the prefix.
pub const DIGEST_HEX_LEN: usize = 12;

/// Compute the cache digest for an image reference.
///
/// Same reference always yields the same digest; the output is a fixed
/// 19-character string (`sha256:` + 12 hex chars).
pub fn compute_digest(image_ref: &str) -> String {
    let hash = Sha256::digest(image_ref.as_bytes());
    let mut hex = String::with_capacity(DIGEST_HEX_LEN);
    for byte in hash.iter().take(DIGEST_HEX_LEN / 2) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("{}{}", DIGEST_PREFIX, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn digest_is_deterministic() {
        let a = compute_digest("denbox-vm:latest");
        let b = compute_digest("denbox-vm:latest");
        assert_eq!(a, b);
    }

    #[test]
    fn digest_differs_for_different_refs() {
        let a = compute_digest("denbox-vm:latest");
        let b = compute_digest("denbox-vm:v2");
        assert_ne!(a, b);
    }

    #[test]
    fn digest_has_fixed_shape() {
        let d = compute_digest("ghcr.io/denbox/vm:2024-11");
        assert!(d.starts_with(DIGEST_PREFIX));
        assert_eq!(d.len(), DIGEST_PREFIX.len() + DIGEST_HEX_LEN);
        assert!(d[DIGEST_PREFIX.len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn digest_shape_holds_for_any_ref(image_ref in ".{0,128}") {
            let d = compute_digest(&image_ref);
            prop_assert!(d.starts_with(DIGEST_PREFIX));
            prop_assert_eq!(d.len(), DIGEST_PREFIX.len() + DIGEST_HEX_LEN);
        }

        #[test]
        fn digest_is_stable_across_calls(image_ref in ".{0,128}") {
            prop_assert_eq!(compute_digest(&image_ref), compute_digest(&image_ref));
        }
    }
}
