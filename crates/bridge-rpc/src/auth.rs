//! Token authentication
//!
//! The caller's signed token travels in call metadata under a fixed key
//! (`token` by default). [`TokenAuthenticator`] pulls it out, hands it to a
//! [`CredentialVerifier`] and turns the outcome into a [`Credential`] or an
//! authentication error. [`AuthInterceptor`] runs it before the handler for
//! every call shape and attaches the credential to the call context.
//!
//! The bundled verifier and issuer use HS256 JWTs via `jsonwebtoken`.

use crate::interceptor::{StreamInterceptor, StreamNext, UnaryInterceptor, UnaryNext};
use crate::handler::ServerStream;
use crate::observe::{CallEvent, EventSink, TracingSink};
use async_trait::async_trait;
use bridge_core::{CallContext, Credential, DynMessage, Error, Result, Violation};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Default metadata key carrying the token
pub const TOKEN_KEY: &str = "token";

/// Default metadata key carrying the caller's claimed subject id
pub const SUBJECT_KEY: &str = "uid";

/// `Bearer <jwt>` → `<jwt>`; any other value is returned trimmed.
fn strip_bearer(value: &str) -> &str {
    let value = value.trim();
    match value.split_once(' ') {
        Some((scheme, rest)) if scheme.eq_ignore_ascii_case("bearer") => rest.trim(),
        None if value.eq_ignore_ascii_case("bearer") => "",
        _ => value,
    }
}

/// Why a token was refused by a verifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VerifyError {
    #[error("token expired")]
    Expired,

    #[error("token rejected: {0}")]
    Rejected(String),
}

/// Verifies a raw token and extracts the caller's identity
pub trait CredentialVerifier: Send + Sync + 'static {
    fn verify(&self, token: &str) -> std::result::Result<Credential, VerifyError>;
}

/// JWT claims understood by [`JwtVerifier`] and produced by [`JwtIssuer`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

fn timestamp(secs: i64) -> std::result::Result<DateTime<Utc>, VerifyError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| VerifyError::Rejected(format!("timestamp out of range: {}", secs)))
}

/// HS256 JWT verifier with zero leeway
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    /// Only accept tokens from this issuer
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }
}

impl CredentialVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> std::result::Result<Credential, VerifyError> {
        let data = decode::<Claims>(token, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => VerifyError::Expired,
                _ => VerifyError::Rejected(e.to_string()),
            }
        })?;
        let claims = data.claims;

        Ok(Credential {
            subject: claims.sub,
            username: claims.username,
            issuer: claims.iss,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
        })
    }
}

/// Issues HS256 JWTs for the demo client and tests
#[derive(Clone)]
pub struct JwtIssuer {
    key: EncodingKey,
    issuer: Option<String>,
    ttl: Duration,
}

impl JwtIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            key: EncodingKey::from_secret(secret),
            issuer: None,
            ttl: Duration::hours(24),
        }
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = Some(issuer.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sign a token for `subject`, valid from now for the configured TTL
    pub fn issue(&self, subject: &str, username: Option<&str>) -> Result<String> {
        let now = Utc::now();
        self.issue_at(subject, username, now)
    }

    /// Sign a token as if issued at `issued_at`
    pub fn issue_at(
        &self,
        subject: &str,
        username: Option<&str>,
        issued_at: DateTime<Utc>,
    ) -> Result<String> {
        let claims = Claims {
            sub: subject.to_string(),
            iat: issued_at.timestamp(),
            exp: (issued_at + self.ttl).timestamp(),
            username: username.map(str::to_string),
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.key)
            .map_err(|e| Error::internal(format!("failed to sign token: {}", e)))
    }
}

/// How the claimed subject id in metadata is checked against the token
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SubjectPolicy {
    /// Subject metadata is not inspected
    #[default]
    Ignore,
    /// Metadata `key` must be present and equal to the token subject
    RequireMatch { key: String },
}

impl SubjectPolicy {
    pub fn require_match() -> Self {
        SubjectPolicy::RequireMatch {
            key: SUBJECT_KEY.to_string(),
        }
    }
}

/// Extracts and verifies the bearer token of a call
#[derive(Clone)]
pub struct TokenAuthenticator {
    key: String,
    verifier: Arc<dyn CredentialVerifier>,
    subject_policy: SubjectPolicy,
}

fn rejected(reason: impl Into<String>) -> Error {
    let reason = reason.into();
    Error::invalid_token(
        reason.clone(),
        vec![Violation::new(reason, "please use a new token")],
    )
}

impl TokenAuthenticator {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self {
            key: TOKEN_KEY.to_string(),
            verifier,
            subject_policy: SubjectPolicy::Ignore,
        }
    }

    /// Read the token from a different metadata key
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into().to_ascii_lowercase();
        self
    }

    pub fn with_subject_policy(mut self, policy: SubjectPolicy) -> Self {
        self.subject_policy = policy;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Authenticate a call from its inbound metadata. Never looks at the body.
    pub fn authenticate(&self, ctx: &CallContext) -> Result<Credential> {
        let metadata = ctx.inbound().ok_or(Error::MissingMetadata)?;

        let token = metadata
            .get_first(&self.key)
            .map(strip_bearer)
            .filter(|t| !t.is_empty())
            .ok_or(Error::MissingToken)?;

        let credential = self.verifier.verify(token).map_err(|e| match e {
            VerifyError::Expired => rejected("token expired"),
            VerifyError::Rejected(reason) => rejected(reason),
        })?;

        if credential.is_expired() {
            return Err(rejected("token expired"));
        }

        if let SubjectPolicy::RequireMatch { key } = &self.subject_policy {
            match metadata.get_first(key) {
                Some(claimed) if claimed == credential.subject => {}
                Some(_) => {
                    return Err(Error::invalid_token(
                        "subject mismatch",
                        vec![Violation::new(key.clone(), "does not match token subject")],
                    ))
                }
                None => {
                    return Err(Error::invalid_token(
                        "subject missing",
                        vec![Violation::new(key.clone(), "subject metadata required")],
                    ))
                }
            }
        }

        Ok(credential)
    }
}

/// Runs the [`TokenAuthenticator`] before the handler for every call shape
#[derive(Clone)]
pub struct AuthInterceptor {
    authenticator: TokenAuthenticator,
    sink: Arc<dyn EventSink>,
}

impl AuthInterceptor {
    pub fn new(authenticator: TokenAuthenticator) -> Self {
        Self {
            authenticator,
            sink: Arc::new(TracingSink),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    fn check(&self, ctx: &mut CallContext) -> Result<()> {
        match self.authenticator.authenticate(ctx) {
            Ok(credential) => {
                debug!(method = %ctx.method(), subject = %credential.subject, "Authenticated");
                ctx.set_credential(credential);
                Ok(())
            }
            Err(err) => {
                self.sink.record(&CallEvent::AuthRejected {
                    method: ctx.method().to_string(),
                    reason: err.to_string(),
                });
                Err(err)
            }
        }
    }
}

#[async_trait]
impl UnaryInterceptor for AuthInterceptor {
    async fn intercept(
        &self,
        ctx: &mut CallContext,
        request: DynMessage,
        next: UnaryNext<'_>,
    ) -> Result<DynMessage> {
        self.check(ctx)?;
        next.run(ctx, request).await
    }
}

#[async_trait]
impl StreamInterceptor for AuthInterceptor {
    async fn intercept(&self, stream: &mut dyn ServerStream, next: StreamNext<'_>) -> Result<()> {
        self.check(stream.context_mut())?;
        next.run(stream).await
    }
}
