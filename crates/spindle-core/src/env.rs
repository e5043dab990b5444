//! Environment-variable helpers
//!
//! Small parse-with-default wrappers used for runtime knobs
//! (log level, stack size, demo configuration).

use std::str::FromStr;

/// Read an env var and parse it, falling back to `default` when the
/// variable is unset or unparsable.
pub fn env_get<T: FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(v) => v.parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Read a boolean env var. Accepts `1/true/yes/on` (any case) as true and
/// `0/false/no/off` as false; anything else falls back to `default`.
pub fn env_get_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

/// Whether an env var is set at all (regardless of value).
pub fn env_is_set(name: &str) -> bool {
    std::env::var_os(name).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_get_default() {
        assert_eq!(env_get("SPINDLE_TEST_UNSET_VAR", 42usize), 42);
        assert!(!env_get_bool("SPINDLE_TEST_UNSET_VAR", false));
        assert!(!env_is_set("SPINDLE_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_env_get_parses() {
        unsafe { std::env::set_var("SPINDLE_TEST_NUM", "7") };
        assert_eq!(env_get("SPINDLE_TEST_NUM", 0usize), 7);
        unsafe { std::env::set_var("SPINDLE_TEST_BOOL", "on") };
        assert!(env_get_bool("SPINDLE_TEST_BOOL", false));
    }
}
