//! Credential verification.
//!
//! Subjects are produced here and nowhere else. Verification is local: JWTs
//! are checked against keys loaded at startup and API keys against the
//! configured table, so the hot path never calls out to an auth service.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, anyhow};
use chrono::Utc;
use http::{HeaderMap, header};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    errors::ErrorKind,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::{ApiKeyConfig, IdentityConfig},
    error::{GatewayError, GatewayResult},
};

pub const API_KEY_HEADER: &str = "x-api-key";
pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Free,
    Pro,
    Enterprise,
    /// Missing or unrecognised tier. Always treated as the most restrictive plan.
    Unknown,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Pro => "pro",
            Self::Enterprise => "enterprise",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_claim(raw: Option<&str>) -> Self {
        raw.and_then(|p| p.parse().ok()).unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "pro" => Ok(Self::Pro),
            "enterprise" => Ok(Self::Enterprise),
            other => Err(anyhow!("unknown plan: {other}")),
        }
    }
}

/// The authenticated caller of a single request.
#[derive(Debug, Clone)]
pub struct Subject {
    pub id: String,
    pub plan: Plan,
    pub roles: Vec<String>,
    pub claims: Map<String, Value>,
}

impl Subject {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    plan: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    roles: Vec<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_in: u64,
}

struct ApiKeyEntry {
    key: Vec<u8>,
    subject: String,
    plan: Plan,
    roles: Vec<String>,
}

pub struct IdentityVerifier {
    decoding_key: Option<DecodingKey>,
    /// `None` in verify-only deployments.
    encoding_key: Option<EncodingKey>,
    algorithm: Algorithm,
    issuer: Option<String>,
    token_ttl_secs: u64,
    api_keys: Vec<ApiKeyEntry>,
}

impl IdentityVerifier {
    pub fn from_config(cfg: &IdentityConfig) -> anyhow::Result<Self> {
        let (algorithm, decoding_key, encoding_key) = if let Some(pem) = &cfg.jwt_public_key {
            tracing::info!("verifying RS256 tokens with configured public key (verify-only)");
            let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                .context("failed to parse JWT_PUBLIC_KEY as RSA PEM")?;
            (Algorithm::RS256, Some(key), None)
        } else if let Some(secret) = &cfg.jwt_secret {
            (
                Algorithm::HS256,
                Some(DecodingKey::from_secret(secret.as_bytes())),
                Some(EncodingKey::from_secret(secret.as_bytes())),
            )
        } else {
            tracing::warn!("no JWT key configured; only API key credentials will verify");
            (Algorithm::HS256, None, None)
        };

        Ok(Self {
            decoding_key,
            encoding_key,
            algorithm,
            issuer: cfg.jwt_issuer.clone(),
            token_ttl_secs: cfg.token_ttl_secs,
            api_keys: cfg.api_keys.iter().map(ApiKeyEntry::from).collect(),
        })
    }

    pub fn verify(&self, headers: &HeaderMap) -> GatewayResult<Subject> {
        if let Some(value) = headers.get(header::AUTHORIZATION) {
            let raw = value.to_str().map_err(|_| GatewayError::Unauthenticated)?;
            let token = bearer_token(raw).ok_or(GatewayError::Unauthenticated)?;
            return self.verify_jwt(token);
        }

        if let Some(value) = headers.get(API_KEY_HEADER) {
            let key = value
                .to_str()
                .ok()
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .ok_or(GatewayError::Unauthenticated)?;
            return self.verify_api_key(key.as_bytes());
        }

        Err(GatewayError::Unauthenticated)
    }

    fn verify_jwt(&self, token: &str) -> GatewayResult<Subject> {
        let key = self
            .decoding_key
            .as_ref()
            .ok_or(GatewayError::InvalidCredential)?;

        let mut validation = Validation::new(self.algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        validation.leeway = 0;
        if let Some(issuer) = &self.issuer {
            validation.set_issuer(&[issuer]);
        }

        let data = decode::<Claims>(token, key, &validation).map_err(|err| match err.kind() {
            ErrorKind::InvalidToken
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => GatewayError::Unauthenticated,
            _ => {
                tracing::debug!(error = %err, "jwt rejected");
                GatewayError::InvalidCredential
            }
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(GatewayError::InvalidCredential);
        }

        Ok(Subject {
            plan: Plan::from_claim(claims.plan.as_deref()),
            id: claims.sub,
            roles: claims.roles,
            claims: claims.extra,
        })
    }

    fn verify_api_key(&self, provided: &[u8]) -> GatewayResult<Subject> {
        let entry = self
            .api_keys
            .iter()
            .find(|entry| timing_safe_eq(&entry.key, provided))
            .ok_or(GatewayError::InvalidCredential)?;

        Ok(Subject {
            id: entry.subject.clone(),
            plan: entry.plan,
            roles: entry.roles.clone(),
            claims: Map::new(),
        })
    }

    pub fn can_issue(&self) -> bool {
        self.encoding_key.is_some()
    }

    pub fn issue(&self, subject_id: &str, plan: Plan, roles: &[String]) -> GatewayResult<IssuedToken> {
        let key = self
            .encoding_key
            .as_ref()
            .ok_or_else(|| GatewayError::Internal("token issuance unavailable".to_string()))?;

        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject_id.to_string(),
            exp: now + self.token_ttl_secs as i64,
            iat: Some(now),
            iss: self.issuer.clone(),
            plan: Some(plan.as_str().to_string()),
            roles: roles.to_vec(),
            extra: Map::new(),
        };

        let token = encode(&Header::new(self.algorithm), &claims, key)
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(IssuedToken {
            token,
            expires_in: self.token_ttl_secs,
        })
    }
}

impl From<&ApiKeyConfig> for ApiKeyEntry {
    fn from(cfg: &ApiKeyConfig) -> Self {
        Self {
            key: cfg.key.as_bytes().to_vec(),
            subject: cfg.subject.clone(),
            plan: cfg.plan,
            roles: cfg.roles.clone(),
        }
    }
}

fn bearer_token(raw: &str) -> Option<&str> {
    let (scheme, token) = raw.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = u8::from(a.len() != b.len());

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}
