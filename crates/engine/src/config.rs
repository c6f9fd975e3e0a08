use std::env;
use std::str::FromStr;

use tracing::warn;

/// Reads `var` and parses it, falling back to `fallback` when it is unset or
/// unparsable. Bad values are logged, never fatal.
pub fn env_override<T>(var: &'static str, fallback: T) -> T
where
    T: FromStr,
{
    match env::var(var) {
        Ok(value) => parse_override(var, &value, fallback),
        Err(env::VarError::NotPresent) => fallback,
        Err(err) => {
            warn!(
                env_var = var,
                error = %err,
                "unable to read env var; falling back to config"
            );
            fallback
        }
    }
}

fn parse_override<T: FromStr>(var: &'static str, value: &str, fallback: T) -> T {
    match value.trim().parse::<T>() {
        Ok(parsed) => parsed,
        Err(_) => {
            warn!(
                env_var = var,
                value,
                "invalid env var value; falling back to config"
            );
            fallback
        }
    }
}

/// Reads `var` as a trimmed string; empty counts as unset.
pub fn env_string(var: &'static str) -> Option<String> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Ok(_) | Err(env::VarError::NotPresent) => None,
        Err(err) => {
            warn!(env_var = var, error = %err, "unable to read env var");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_override_is_parsed() {
        assert_eq!(parse_override("REALM_TEST", " 75 ", 50u64), 75);
    }

    #[test]
    fn invalid_override_falls_back() {
        assert_eq!(parse_override("REALM_TEST", "fast", 50u64), 50);
    }

    #[test]
    fn unset_variable_uses_fallback() {
        assert_eq!(
            env_override("REALM_TEST_DEFINITELY_UNSET_VARIABLE", 12u32),
            12
        );
    }
}
