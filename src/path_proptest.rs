//! Property-based tests for path manipulation functions.
//!
//! These tests use proptest to generate random inputs and verify that
//! invariants hold for all possible inputs.

#[cfg(test)]
mod proptest_tests {
    use crate::path::{encode_path_component, is_excluded, strip_diff_prefix};
    use proptest::prelude::*;

    proptest! {
        /// Property: encode_path_component never produces filesystem-unsafe characters
        #[test]
        fn encode_never_produces_unsafe_chars(input in ".*") {
            let result = encode_path_component(&input);
            let unsafe_chars = ['/', '\\', ':', '*', '?', '"', '<', '>', '|'];
            for ch in unsafe_chars {
                prop_assert!(
                    !result.contains(ch),
                    "encode_path_component produced unsafe character '{}' from input '{}'",
                    ch,
                    input
                );
            }
        }

        /// Property: encode_path_component preserves alphanumeric characters
        #[test]
        fn encode_preserves_alphanumeric(input in "[a-zA-Z0-9]+") {
            prop_assert_eq!(encode_path_component(&input), input);
        }

        /// Property: characters are replaced 1:1
        #[test]
        fn encode_preserves_char_count(input in ".+") {
            let result = encode_path_component(&input);
            prop_assert_eq!(result.chars().count(), input.chars().count());
        }

        /// Property: a literal directory exclusion covers every path beneath it
        #[test]
        fn excluded_directory_covers_children(
            dir in "[a-z]{1,8}",
            child in "[a-z]{1,8}(/[a-z]{1,8}){0,3}",
        ) {
            let excludes = vec![dir.clone()];
            let path = format!("{}/{}", dir, child);
            prop_assert!(is_excluded(&path, &excludes).unwrap());
        }

        /// Property: an empty exclusion list excludes nothing
        #[test]
        fn empty_excludes_exclude_nothing(path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}") {
            prop_assert!(!is_excluded(&path, &[]).unwrap());
        }

        /// Property: stripping the git prefix from `a/<p>` and `b/<p>` agrees
        #[test]
        fn diff_prefixes_agree(path in "[a-z]{1,8}(/[a-z]{1,8}){0,3}") {
            prop_assert_eq!(
                strip_diff_prefix(&format!("a/{}", path)),
                strip_diff_prefix(&format!("b/{}", path))
            );
        }
    }
}
