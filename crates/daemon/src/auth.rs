// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 rtunnel Contributors

// rtunnel - Authentication Module
// Token check for the daemon control API

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use subtle::ConstantTimeEq;
use tracing::{info, trace, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use rtunnel_common::{ErrorResponse, AUTH_TOKEN_HEADER};

/// Mask all but the last 4 characters, for logs
pub fn obfuscate_token(token: &str) -> String {
    if token.len() < 4 || !token.is_ascii() {
        return "*".repeat(token.chars().count());
    }
    let mask_len = token.len() - 4;
    format!("{}{}", "*".repeat(mask_len), &token[mask_len..])
}

/// Load the token at `token_path`, generating and saving a new one if missing or empty
///
/// Returns the token and whether it was generated now.
pub fn load_or_generate_token(token_path: &Path) -> Result<(Zeroizing<String>, bool)> {
    if token_path.exists() {
        let token = Zeroizing::new(
            fs::read_to_string(token_path)
                .context("Failed to read authentication token file")?
                .trim()
                .to_string(),
        );

        if !token.is_empty() {
            info!("Loaded authentication token from: {}", token_path.display());
            return Ok((token, false));
        }
        warn!("Token file {} is empty, regenerating", token_path.display());
    }

    let token = Zeroizing::new(Uuid::new_v4().to_string());
    save_token(token_path, &token)?;

    info!("Generated new authentication token");
    info!(
        "Token: {} (full token in {})",
        obfuscate_token(&token),
        token_path.display()
    );
    info!("Clients must send it in the {} header", AUTH_TOKEN_HEADER);

    Ok((token, true))
}

fn save_token(token_path: &Path, token: &str) -> Result<()> {
    if let Some(parent) = token_path.parent() {
        fs::create_dir_all(parent).context("Failed to create token directory")?;
    }

    fs::write(token_path, token).context("Failed to write token file")?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(token_path, fs::Permissions::from_mode(0o600))
            .context("Failed to set token file permissions")?;
    }

    Ok(())
}

/// Authentication middleware state
#[derive(Clone)]
pub struct AuthState {
    token: Zeroizing<String>,
}

impl AuthState {
    pub fn new(token: Zeroizing<String>) -> Self {
        Self { token }
    }

    /// Constant-time comparison against the daemon token
    fn accepts(&self, provided: &str) -> bool {
        self.token.as_bytes().ct_eq(provided.as_bytes()).into()
    }
}

/// Reject requests without a valid `X-Tunnel-Token` header with 401
pub async fn auth_middleware(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get(AUTH_TOKEN_HEADER)
        .and_then(|h| h.to_str().ok());

    match provided {
        Some(token) if auth_state.accepts(token) => {
            trace!("Authentication successful");
            next.run(request).await
        }
        Some(_) => {
            warn!("Authentication failed: invalid token");
            unauthorized("invalid token")
        }
        None => {
            warn!("Authentication failed: missing token");
            unauthorized("missing token")
        }
    }
}

fn unauthorized(reason: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: format!("Unauthorized: {}", reason),
            code: "unauthorized".to_string(),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, routing::get, Router};
    use tempfile::TempDir;
    use tower::ServiceExt;

    #[test]
    fn test_obfuscate_token() {
        let token = "abc123de-f456-7890-1234-567890abcdef";
        let obfuscated = obfuscate_token(token);
        assert_eq!(obfuscated, "********************************cdef");
        assert_eq!(obfuscated.len(), token.len());

        assert_eq!(obfuscate_token("1234"), "1234");
        assert_eq!(obfuscate_token("abc"), "***");
        assert_eq!(obfuscate_token(""), "");
    }

    #[test]
    fn test_generate_then_reload() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("nested").join("daemon.token");

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(was_new);
        assert!(Uuid::parse_str(&token).is_ok());

        let (loaded, was_new) = load_or_generate_token(&token_path).unwrap();
        assert_eq!(*token, *loaded);
        assert!(!was_new);
    }

    #[test]
    fn test_empty_token_file_is_regenerated() {
        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");
        fs::write(&token_path, "  \n").unwrap();

        let (token, was_new) = load_or_generate_token(&token_path).unwrap();
        assert!(was_new);
        assert_eq!(fs::read_to_string(&token_path).unwrap(), *token);
    }

    #[cfg(unix)]
    #[test]
    fn test_token_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let token_path = temp_dir.path().join("daemon.token");
        load_or_generate_token(&token_path).unwrap();

        let mode = fs::metadata(&token_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_accepts_only_exact_token() {
        let auth = AuthState::new(Zeroizing::new("secret".to_string()));
        assert!(auth.accepts("secret"));
        assert!(!auth.accepts("secreT"));
        assert!(!auth.accepts("secre"));
        assert!(!auth.accepts("secret-but-longer"));
        assert!(!auth.accepts(""));
    }

    fn protected_app() -> Router {
        Router::new()
            .route("/api/health", get(|| async { "OK" }))
            .layer(axum::middleware::from_fn_with_state(
                AuthState::new(Zeroizing::new("secret".to_string())),
                auth_middleware,
            ))
    }

    #[tokio::test]
    async fn test_middleware_accepts_valid_token() {
        let request = Request::builder()
            .uri("/api/health")
            .header(AUTH_TOKEN_HEADER, "secret")
            .body(Body::empty())
            .unwrap();
        let response = protected_app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_rejects_missing_and_wrong_tokens() {
        for token in [None, Some("secreT"), Some("secret-but-longer")] {
            let mut builder = Request::builder().uri("/api/health");
            if let Some(token) = token {
                builder = builder.header(AUTH_TOKEN_HEADER, token);
            }
            let response = protected_app()
                .oneshot(builder.body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }
}
