//! Bearer token authentication for the publisher.
//!
//! Tokens come from configuration or the `JUX_API_TOKEN` environment
//! variable. Loopback endpoints accept unauthenticated submissions, so the
//! client only demands a token for remote servers.

/// Environment variable holding the API token.
pub const TOKEN_ENV_VAR: &str = "JUX_API_TOKEN";

/// Token provider for publisher authentication.
#[derive(Clone, Default)]
pub enum TokenProvider {
    /// Static token (from config or env).
    Static(String),

    /// No authentication.
    #[default]
    None,
}

impl TokenProvider {
    /// Create a static token provider.
    pub fn static_token(token: impl Into<String>) -> Self {
        Self::Static(token.into())
    }

    /// Read `JUX_API_TOKEN`; an unset or empty variable means no auth.
    pub fn from_env() -> Self {
        match std::env::var(TOKEN_ENV_VAR) {
            Ok(token) if !token.is_empty() => Self::Static(token),
            _ => Self::None,
        }
    }

    /// Current token, if any.
    pub fn get_token(&self) -> Option<&str> {
        match self {
            Self::Static(token) => Some(token),
            Self::None => None,
        }
    }

    /// Check if authentication is configured.
    pub fn is_authenticated(&self) -> bool {
        !matches!(self, Self::None)
    }
}

// Never print the token.
impl std::fmt::Debug for TokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static(_) => f.write_str("TokenProvider::Static(<redacted>)"),
            Self::None => f.write_str("TokenProvider::None"),
        }
    }
}
