//! Bearer-token access control consulted before any handler runs.

use subtle::ConstantTimeEq;

use crate::config::GuardSettings;

/// Paths reachable without credentials.
pub const PUBLIC_PATHS: &[&str] = &["/health"];

/// What the guard sees of a request.
#[derive(Debug, Clone, Copy)]
pub struct AccessRequest<'a> {
    /// HTTP method.
    pub method: &'a str,
    /// Request path without query string.
    pub path: &'a str,
    /// Token from `Authorization: Bearer ...`, if any.
    pub bearer: Option<&'a str>,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Proceed to the handler.
    Allowed,
    /// Reject with 401.
    Denied,
}

/// Decides whether a request may proceed.
pub trait AccessGuard: Send + Sync {
    /// Checks one request.
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision;
}

/// Allows everything; local development only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessGuard for AllowAll {
    fn authorize(&self, _request: &AccessRequest<'_>) -> Decision {
        Decision::Allowed
    }
}

/// Accepts a fixed set of bearer tokens, compared in constant time.
#[derive(Debug, Clone)]
pub struct StaticTokenGuard {
    tokens: Vec<Vec<u8>>,
}

impl StaticTokenGuard {
    /// Builds a guard from accepted tokens; blank entries are ignored.
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(|t| t.as_ref().trim().as_bytes().to_vec())
                .filter(|t| !t.is_empty())
                .collect(),
        }
    }

    fn accepts(&self, presented: &str) -> bool {
        let presented = presented.as_bytes();
        // Check every token so timing does not reveal which one matched.
        self.tokens
            .iter()
            .fold(0u8, |hit, token| hit | token.as_slice().ct_eq(presented).unwrap_u8())
            == 1
    }
}

impl AccessGuard for StaticTokenGuard {
    fn authorize(&self, request: &AccessRequest<'_>) -> Decision {
        if request.method.eq_ignore_ascii_case("OPTIONS") || PUBLIC_PATHS.contains(&request.path) {
            return Decision::Allowed;
        }
        match request.bearer {
            Some(token) if !token.is_empty() && self.accepts(token) => Decision::Allowed,
            _ => Decision::Denied,
        }
    }
}

/// Guard for the configured tokens; [`AllowAll`] when none are configured.
pub fn from_settings(settings: &GuardSettings) -> Box<dyn AccessGuard> {
    if settings.tokens.is_empty() {
        Box::new(AllowAll)
    } else {
        Box::new(StaticTokenGuard::new(&settings.tokens))
    }
}

/// Extracts the token from an `Authorization` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then(|| token.trim())
        .filter(|t| !t.is_empty())
}
