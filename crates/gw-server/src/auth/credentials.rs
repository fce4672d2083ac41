//! Effective server credentials and the handshake authorizer.
//!
//! Credentials are resolved once at server construction: configuration
//! first, then the environment, else empty. An empty server secret means
//! every attempt in that mode fails closed.

use crate::config::AuthSection;
use gw_core::{constant_time_eq, ConnectAuth};
use serde::Serialize;
use std::fmt;

/// Fallback for `gateway.auth.token`.
pub const TOKEN_ENV: &str = "GW_GATEWAY_TOKEN";
/// Fallback for `gateway.auth.password`.
pub const PASSWORD_ENV: &str = "GW_GATEWAY_PASSWORD";

/// Which credential kind the server expects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    Token,
    Password,
    /// Anything else found in the config; always rejected.
    Other(String),
}

impl AuthMode {
    fn parse(raw: &str) -> Self {
        match raw.trim() {
            "token" => AuthMode::Token,
            "password" => AuthMode::Password,
            other => AuthMode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Token => f.write_str("token"),
            AuthMode::Password => f.write_str("password"),
            AuthMode::Other(mode) => f.write_str(mode),
        }
    }
}

/// Server-side effective credentials. Immutable after construction.
#[derive(Clone, PartialEq, Eq)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    pub token: String,
    pub password: String,
}

impl fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("mode", &self.mode)
            .field("token_set", &!self.token.is_empty())
            .field("password_set", &!self.password.is_empty())
            .finish()
    }
}

/// Resolve credentials from config with process-environment fallback.
pub fn resolve_auth(section: &AuthSection) -> ResolvedAuth {
    resolve_auth_with(section, |key| std::env::var(key).ok())
}

/// Resolve credentials using `env` to look up fallback variables.
pub fn resolve_auth_with<F>(section: &AuthSection, env: F) -> ResolvedAuth
where
    F: Fn(&str) -> Option<String>,
{
    let fallback = |configured: &str, key: &str| {
        if configured.is_empty() {
            env(key).unwrap_or_default()
        } else {
            configured.to_string()
        }
    };
    let token = fallback(&section.token, TOKEN_ENV);
    let password = fallback(&section.password, PASSWORD_ENV);

    let mode = match section.mode.as_deref().map(str::trim) {
        Some(mode) if !mode.is_empty() => AuthMode::parse(mode),
        _ if !password.is_empty() => AuthMode::Password,
        _ => AuthMode::Token,
    };

    ResolvedAuth {
        mode,
        token,
        password,
    }
}

/// Credential kind that admitted a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Token,
    Password,
}

/// Outcome of one authorization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub ok: bool,
    pub method: Option<AuthMethod>,
    pub reason: Option<String>,
}

impl AuthResult {
    fn success(method: AuthMethod) -> Self {
        Self {
            ok: true,
            method: Some(method),
            reason: None,
        }
    }

    fn failure(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            method: None,
            reason: Some(reason.into()),
        }
    }

    /// Failure reason, or an empty string on success.
    pub fn reason(&self) -> &str {
        self.reason.as_deref().unwrap_or_default()
    }
}

/// Validate client credentials against the server's. Pure; no I/O.
pub fn authorize(server: &ResolvedAuth, client: Option<&ConnectAuth>) -> AuthResult {
    let Some(client) = client else {
        return AuthResult::failure("no credentials provided");
    };

    match &server.mode {
        AuthMode::Token => check_secret(
            &server.token,
            client.token.as_deref(),
            AuthMethod::Token,
            ["server token not configured", "token required", "token_mismatch"],
        ),
        AuthMode::Password => check_secret(
            &server.password,
            client.password.as_deref(),
            AuthMethod::Password,
            [
                "server password not configured",
                "password required",
                "password_mismatch",
            ],
        ),
        AuthMode::Other(mode) => AuthResult::failure(format!("unknown auth mode: {mode}")),
    }
}

/// `reasons` = [server secret missing, client secret missing, mismatch].
fn check_secret(
    expected: &str,
    provided: Option<&str>,
    method: AuthMethod,
    reasons: [&str; 3],
) -> AuthResult {
    let [unconfigured, required, mismatch] = reasons;
    if expected.is_empty() {
        return AuthResult::failure(unconfigured);
    }
    let provided = provided.unwrap_or_default();
    if provided.is_empty() {
        return AuthResult::failure(required);
    }
    if !constant_time_eq(expected, provided) {
        return AuthResult::failure(mismatch);
    }
    AuthResult::success(method)
}
