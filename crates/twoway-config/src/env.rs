use regex::Regex;
use std::env;

use crate::ConfigError;

const PLACEHOLDER: &str = r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}";

/// Interpolate environment variables in a string.
/// Replaces `${VAR_NAME}` with the value of the environment variable, and
/// `${VAR_NAME:-fallback}` with the value or, when unset, `fallback`.
/// Every missing variable is reported, not just the first.
pub fn interpolate_env(input: &str) -> Result<String, ConfigError> {
    interpolate_with(input, |name| env::var(name).ok())
}

/// Same as [`interpolate_env`] with a caller-supplied lookup.
pub fn interpolate_with<F>(input: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let re = Regex::new(PLACEHOLDER)
        .map_err(|e| ConfigError::InvalidConfig(format!("placeholder pattern: {}", e)))?;
    let mut missing = Vec::new();

    let result = re.replace_all(input, |cap: &regex::Captures<'_>| {
        let name = &cap[1];
        match (lookup(name), cap.get(2)) {
            (Some(value), _) => value,
            (None, Some(fallback)) => fallback.as_str().to_string(),
            (None, None) => {
                if !missing.iter().any(|m| m == name) {
                    missing.push(name.to_string());
                }
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(ConfigError::MissingEnvVars(missing));
    }

    Ok(result.into_owned())
}
