use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::error::AppError;

/// Shared bearer token guarding the operator routes
#[derive(Clone)]
pub struct OperatorAuth {
    digest: [u8; 32],
}

impl std::fmt::Debug for OperatorAuth {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("OperatorAuth")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl OperatorAuth {
    pub fn new(token: &str) -> Self {
        Self {
            digest: Sha256::digest(token.as_bytes()).into(),
        }
    }

    /// Compare digests so the check does not short-circuit on the first
    /// differing byte of the secret.
    pub fn verify(&self, headers: &HeaderMap) -> Result<(), AppError> {
        let token = extract_bearer_token(headers)?;
        let presented: [u8; 32] = Sha256::digest(token.as_bytes()).into();
        let difference = presented
            .iter()
            .zip(self.digest.iter())
            .fold(0u8, |acc, (left, right)| acc | (left ^ right));
        if difference != 0 {
            return Err(AppError::unauthorized("Invalid operator token"));
        }
        Ok(())
    }
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let header = headers
        .get("authorization")
        .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("Authorization header is not valid UTF-8"))?;

    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AppError::unauthorized("Authorization header must be `Bearer <token>`"))?;

    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AppError::unauthorized(
            "Authorization scheme must be `Bearer`",
        ));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AppError::unauthorized("Bearer token is empty"));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn bearer_token_is_required() {
        let auth = OperatorAuth::new("ops-token");
        assert!(auth.verify(&HeaderMap::new()).is_err());
        assert!(auth.verify(&headers("Basic ops-token")).is_err());
        assert!(auth.verify(&headers("Bearer ")).is_err());
        assert!(auth.verify(&headers("Bearer wrong")).is_err());
        auth.verify(&headers("bearer ops-token")).unwrap();
    }

    #[test]
    fn debug_hides_the_token() {
        let auth = OperatorAuth::new("ops-token");
        assert!(!format!("{auth:?}").contains("ops-token"));
    }
}
