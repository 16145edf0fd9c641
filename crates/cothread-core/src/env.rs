//! `COT_*` environment lookups
//!
//! Every knob falls back to its compiled default when the variable is unset
//! or does not parse; a typo in the environment never aborts startup.

use std::str::FromStr;

/// Parsed value of `key`, or `default`
#[inline]
pub fn env_get<T: FromStr>(key: &str, default: T) -> T {
    env_get_opt(key).unwrap_or(default)
}

/// Parsed value of `key` if it is set and valid
#[inline]
pub fn env_get_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

/// On/off switch such as `COT_FLUSH_EPRINT`
///
/// `1/true/yes/on` and `0/false/no/off` in any case; other values keep
/// `default`.
pub fn env_get_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_switch(&v))
        .unwrap_or(default)
}

/// Bitmask such as `COT_DEBUG`, see [`parse_bits`]
pub fn env_get_bits(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bits(v.trim()))
        .unwrap_or(default)
}

/// `12`, `0x0c` and `0b1100` all give 12
pub fn parse_bits(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_switch(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test owns its variable names; the harness runs tests in parallel.

    #[test]
    fn test_unset_falls_back() {
        assert_eq!(env_get("COT_TEST_ENV_UNSET", 42usize), 42);
        assert_eq!(env_get_opt::<u32>("COT_TEST_ENV_UNSET"), None);
        assert!(env_get_bool("COT_TEST_ENV_UNSET", true));
        assert_eq!(env_get_bits("COT_TEST_ENV_UNSET", 7), 7);
    }

    #[test]
    fn test_numeric_values() {
        std::env::set_var("COT_TEST_ENV_NUM", " 123 ");
        assert_eq!(env_get("COT_TEST_ENV_NUM", 0usize), 123);
        std::env::set_var("COT_TEST_ENV_NUM", "lots");
        assert_eq!(env_get("COT_TEST_ENV_NUM", 99usize), 99);
        std::env::remove_var("COT_TEST_ENV_NUM");
    }

    #[test]
    fn test_switch_values() {
        for on in ["1", "TRUE", "yes", "On"] {
            assert_eq!(parse_switch(on), Some(true), "{}", on);
        }
        for off in ["0", "false", "NO", "off"] {
            assert_eq!(parse_switch(off), Some(false), "{}", off);
        }
        assert_eq!(parse_switch("maybe"), None);

        std::env::set_var("COT_TEST_ENV_SWITCH", "maybe");
        assert!(env_get_bool("COT_TEST_ENV_SWITCH", true));
        std::env::set_var("COT_TEST_ENV_SWITCH", "off");
        assert!(!env_get_bool("COT_TEST_ENV_SWITCH", true));
        std::env::remove_var("COT_TEST_ENV_SWITCH");
    }

    #[test]
    fn test_bitmasks() {
        assert_eq!(parse_bits("12"), Some(12));
        assert_eq!(parse_bits("0x0c"), Some(12));
        assert_eq!(parse_bits("0B1100"), Some(12));
        assert_eq!(parse_bits("0xzz"), None);

        std::env::set_var("COT_TEST_ENV_BITS", "0x10");
        assert_eq!(env_get_bits("COT_TEST_ENV_BITS", 0), 16);
        std::env::set_var("COT_TEST_ENV_BITS", "junk");
        assert_eq!(env_get_bits("COT_TEST_ENV_BITS", 3), 3);
        std::env::remove_var("COT_TEST_ENV_BITS");
    }
}
