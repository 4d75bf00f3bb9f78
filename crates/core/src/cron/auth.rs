use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// Header carrying the shared secret when no bearer token is sent.
pub const SECRET_HEADER: &str = "x-cron-secret";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronAuthError {
    /// No secret configured; the endpoint is off.
    #[error("cron endpoint disabled")]
    Disabled,
    #[error("unauthorized")]
    Unauthorized,
}

impl CronAuthError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Disabled => 503,
            Self::Unauthorized => 401,
        }
    }
}

/// Credentials presented by a cron caller.
#[derive(Debug, Clone, Default)]
pub struct CronCredentials {
    /// Raw `Authorization` header value.
    pub authorization: Option<String>,
    /// Raw value of [`SECRET_HEADER`].
    pub secret_header: Option<String>,
}

impl CronCredentials {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self { authorization: Some(format!("Bearer {}", token.into())), secret_header: None }
    }

    pub fn header(secret: impl Into<String>) -> Self {
        Self { authorization: None, secret_header: Some(secret.into()) }
    }

    fn presented(&self) -> Option<&str> {
        let bearer = self.authorization.as_deref().and_then(|v| {
            let (scheme, token) = v.trim().split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
        });
        bearer
            .or_else(|| self.secret_header.as_deref().map(str::trim))
            .filter(|s| !s.is_empty())
    }
}

/// Shared-secret check run before any cron work.
#[derive(Debug, Clone)]
pub struct CronAuth {
    secret: Option<String>,
}

impl CronAuth {
    pub fn new(secret: Option<String>) -> Self {
        Self { secret: secret.filter(|s| !s.trim().is_empty()) }
    }

    /// Reads `CRON_SECRET`.
    pub fn from_env() -> Self {
        Self::new(std::env::var("CRON_SECRET").ok())
    }

    pub fn authorize(&self, creds: &CronCredentials) -> Result<(), CronAuthError> {
        let secret = self.secret.as_deref().ok_or(CronAuthError::Disabled)?;
        match creds.presented() {
            Some(given) if secrets_match(given, secret) => Ok(()),
            _ => Err(CronAuthError::Unauthorized),
        }
    }
}

/// Compares digests in constant time, so timing reveals neither content nor length.
fn secrets_match(given: &str, secret: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let secret = Sha256::digest(secret.as_bytes());
    given.as_slice().ct_eq(secret.as_slice()).into()
}
