//! Property-based fuzzing of unique-value normalization.
//!
//! Index keys become document ids, so normalization must always produce
//! a path-safe, deterministic, idempotent key or reject the value.

use proptest::prelude::*;

use prism_core::unique::normalize_unique_value;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Accepted keys are path-safe and stable under re-normalization.
    #[test]
    fn fuzz_normalized_keys_are_path_safe(raw in "\\PC{0,60}") {
        match normalize_unique_value(&raw) {
            Ok(key) => {
                prop_assert!(!key.is_empty());
                prop_assert!(!key.contains('/'), "path separator survived: {key:?}");
                prop_assert!(!key.contains('.'), "id separator survived: {key:?}");
                prop_assert!(!key.chars().any(char::is_whitespace));
                prop_assert_eq!(key.clone(), key.to_lowercase());
                // Idempotent: a key normalizes to itself.
                prop_assert_eq!(normalize_unique_value(&key), Ok(key));
            }
            Err(_) => {
                // Only values without any usable content are rejected.
                prop_assert!(raw.split_whitespace().next().is_none());
            }
        }
    }

    /// Values differing only by case or whitespace collide on one key.
    #[test]
    fn fuzz_case_and_spacing_collide(word in "[a-zA-Z]{1,20}", spaces in 1usize..5) {
        let spaced = format!("{}{}{}", word.to_uppercase(), " ".repeat(spaces), word);
        let tight = format!("{} {}", word.to_lowercase(), word.to_lowercase());
        prop_assert_eq!(normalize_unique_value(&spaced), normalize_unique_value(&tight));
    }
}
