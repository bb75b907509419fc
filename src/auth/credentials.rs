//! Cached credential validation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::password::verify_secret;
use super::AuthFailure;
use crate::metrics::MetricsCollector;
use crate::storage::CredentialStore;
use crate::store::{with_deadline, QueueStore, StoreError};

/// Cache value recording a rejected secret.
const INVALID_SENTINEL: &str = "invalid";

/// What to do when the verdict cache cannot be read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheFailurePolicy {
    /// Skip the cache and check the durable store.
    #[default]
    FailOpen,
    /// Refuse the request as unavailable.
    FailClosed,
}

/// Settings of the credential validator.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthConfig {
    /// Prefix the public part of every secret carries. Empty disables it.
    pub secret_prefix: String,
    pub min_secret_length: usize,
    pub cache_ttl: Duration,
    pub negative_cache_ttl: Duration,
    pub cache_policy: CacheFailurePolicy,
    /// Deadline for each cache round trip.
    pub operation_timeout: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_prefix: "my_".to_string(),
            min_secret_length: 32,
            cache_ttl: Duration::from_secs(300),
            negative_cache_ttl: Duration::from_secs(60),
            cache_policy: CacheFailurePolicy::FailOpen,
            operation_timeout: Duration::from_secs(2),
        }
    }
}

/// A system whose credentials were accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthenticatedSystem {
    pub system_id: String,
    pub system_key: String,
}

pub type AuthOutcome = Result<AuthenticatedSystem, AuthFailure>;

/// The two halves of a system secret.
struct SecretParts<'a> {
    public: &'a str,
    secret: &'a str,
}

/// Validates system credentials against the durable store, caching verdicts.
pub struct CredentialValidator {
    cache: Arc<dyn QueueStore>,
    store: Arc<dyn CredentialStore>,
    config: AuthConfig,
    metrics: MetricsCollector,
}

impl CredentialValidator {
    pub fn new(
        cache: Arc<dyn QueueStore>,
        store: Arc<dyn CredentialStore>,
        config: AuthConfig,
    ) -> Self {
        Self {
            cache,
            store,
            config,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Checks `secret` for the system registered under `system_key`.
    pub async fn validate(&self, system_key: &str, secret: &str) -> AuthOutcome {
        let outcome = self.check(system_key, secret).await;

        match &outcome {
            Ok(system) => {
                self.metrics.record_auth("success");
                debug!(system_key = %system_key, system_id = %system.system_id, "System authenticated");
            }
            Err(failure @ (AuthFailure::CachedInvalid | AuthFailure::SecretTooShort)) => {
                self.metrics.record_auth(failure.reason());
                debug!(system_key = %system_key, reason = failure.reason(), "Authentication refused");
            }
            Err(failure) => {
                self.metrics.record_auth(failure.reason());
                warn!(system_key = %system_key, reason = failure.reason(), error = %failure, "Authentication failed");
            }
        }

        outcome
    }

    async fn check(&self, system_key: &str, secret: &str) -> AuthOutcome {
        let parts = self.split_secret(secret)?;
        if parts.secret.len() < self.config.min_secret_length {
            return Err(AuthFailure::SecretTooShort);
        }

        let cache_key = cache_key(system_key, secret);
        let mut cache_usable = true;

        match self.cache_get(&cache_key).await {
            Ok(Some(cached)) if cached == INVALID_SENTINEL => {
                return Err(AuthFailure::CachedInvalid);
            }
            Ok(Some(system_id)) => {
                let system = AuthenticatedSystem {
                    system_id,
                    system_key: system_key.to_string(),
                };
                self.touch(&system).await;
                return Ok(system);
            }
            Ok(None) => {}
            Err(e) => match self.config.cache_policy {
                CacheFailurePolicy::FailOpen => {
                    warn!(error = %e, "Credential cache unreachable, checking durable store");
                    cache_usable = false;
                }
                CacheFailurePolicy::FailClosed => {
                    return Err(AuthFailure::Unavailable(format!("credential cache: {}", e)));
                }
            },
        }

        let verdict = self.check_durable(system_key, &parts).await;

        if cache_usable {
            match &verdict {
                Ok(system) => {
                    self.cache_put(&cache_key, &system.system_id, self.config.cache_ttl)
                        .await;
                }
                Err(AuthFailure::Unavailable(_)) => {}
                Err(_) => {
                    self.cache_put(&cache_key, INVALID_SENTINEL, self.config.negative_cache_ttl)
                        .await;
                }
            }
        }

        if let Ok(system) = &verdict {
            self.touch(system).await;
        }
        verdict
    }

    fn split_secret<'a>(&self, secret: &'a str) -> Result<SecretParts<'a>, AuthFailure> {
        let (marker, secret_part) = secret.split_once('.').ok_or(AuthFailure::BadFormat)?;
        if secret_part.contains('.') {
            return Err(AuthFailure::BadFormat);
        }

        let public = if self.config.secret_prefix.is_empty() {
            marker
        } else {
            marker
                .strip_prefix(self.config.secret_prefix.as_str())
                .ok_or(AuthFailure::BadFormat)?
        };
        if public.is_empty() {
            return Err(AuthFailure::BadFormat);
        }

        Ok(SecretParts {
            public,
            secret: secret_part,
        })
    }

    async fn check_durable(&self, system_key: &str, parts: &SecretParts<'_>) -> AuthOutcome {
        let credentials = self
            .store
            .find_by_key(system_key)
            .await
            .map_err(|e| AuthFailure::Unavailable(e.to_string()))?
            .ok_or(AuthFailure::NotFound)?;

        if !credentials.active {
            return Err(AuthFailure::Inactive);
        }
        if credentials.secret_public != parts.public {
            return Err(AuthFailure::PublicMismatch);
        }

        // CPU-bound; runs on the blocking pool.
        let secret = parts.secret.to_string();
        let hash = credentials.secret_hash.clone();
        let verified = tokio::task::spawn_blocking(move || verify_secret(&secret, &hash))
            .await
            .map_err(|e| AuthFailure::Unavailable(format!("verification task: {}", e)))?;

        match verified {
            Ok(true) => Ok(AuthenticatedSystem {
                system_id: credentials.system_id,
                system_key: system_key.to_string(),
            }),
            Ok(false) => Err(AuthFailure::SecretMismatch),
            Err(e) => {
                warn!(system_id = %credentials.system_id, error = %e, "Stored secret hash is unusable");
                Err(AuthFailure::SecretMismatch)
            }
        }
    }

    async fn cache_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        with_deadline(self.config.operation_timeout, self.cache.get(key)).await
    }

    async fn cache_put(&self, key: &str, value: &str, ttl: Duration) {
        if let Err(e) = with_deadline(
            self.config.operation_timeout,
            self.cache.set_ex(key, value, ttl),
        )
        .await
        {
            warn!(error = %e, "Failed to cache authentication verdict");
        }
    }

    async fn touch(&self, system: &AuthenticatedSystem) {
        if let Err(e) = self.store.mark_used(&system.system_id).await {
            debug!(system_id = %system.system_id, error = %e, "Failed to update last_used_at");
        }
    }
}

/// `auth:system:<key>:<sha256 of the full secret>`.
fn cache_key(system_key: &str, secret: &str) -> String {
    format!(
        "auth:system:{}:{}",
        system_key,
        hex::encode(Sha256::digest(secret.as_bytes()))
    )
}
