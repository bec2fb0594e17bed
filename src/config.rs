// Configuration glue: reads the server coordinates and credentials from the
// environment, falling back to an interactive prompt for anything secret
// that is missing. Loading mechanics live here so the client itself never
// touches the environment.

use anyhow::{Context, Result};
use dialoguer::{Input, Password};
use std::env;

/// Everything the API client needs to talk to one server.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the server, without a trailing slash.
    pub base_url: String,
    /// Optional path prefix the server is hosted under, normalized to
    /// either "" or "/prefix".
    pub context_root: String,
    pub user: String,
    pub token: String,
    /// Skip TLS certificate verification when set.
    pub insecure: bool,
}

impl Config {
    /// Load from `JENQ_URL`, `JENQ_CONTEXT_ROOT`, `JENQ_USER`, `JENQ_TOKEN`
    /// and `JENQ_INSECURE`. The URL is required; missing credentials are
    /// prompted for on the terminal.
    pub fn from_env() -> Result<Config> {
        let base_url = env::var("JENQ_URL").context("JENQ_URL is not set")?;
        let context_root = normalize_root(&env::var("JENQ_CONTEXT_ROOT").unwrap_or_default());
        let insecure = matches!(
            env::var("JENQ_INSECURE").as_deref(),
            Ok("1") | Ok("true") | Ok("yes")
        );
        let user = match env::var("JENQ_USER") {
            Ok(user) if !user.is_empty() => user,
            _ => Input::new()
                .with_prompt("Username")
                .interact_text()
                .context("Failed to read username")?,
        };
        let token = match env::var("JENQ_TOKEN") {
            Ok(token) if !token.is_empty() => token,
            _ => Password::new()
                .with_prompt("API token")
                .interact()
                .context("Failed to read API token")?,
        };
        Ok(Config {
            base_url: base_url.trim_end_matches('/').to_string(),
            context_root,
            user,
            token,
            insecure,
        })
    }
}

/// Normalize a context root to "" or "/prefix": ensure the leading slash,
/// drop any trailing one.
fn normalize_root(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_root_handles_all_spellings() {
        assert_eq!(normalize_root(""), "");
        assert_eq!(normalize_root("/"), "");
        assert_eq!(normalize_root("jenkins"), "/jenkins");
        assert_eq!(normalize_root("/jenkins"), "/jenkins");
        assert_eq!(normalize_root("/jenkins/"), "/jenkins");
        assert_eq!(normalize_root("ci/jenkins"), "/ci/jenkins");
    }
}
