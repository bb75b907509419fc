//! HTTP interface of the collector.
//!
//! | Route | Auth | Purpose |
//! |-------|------|---------|
//! | `POST /api/systems/heartbeat` | Basic | record liveness |
//! | `POST /api/systems/inventory` | Basic | queue an inventory snapshot |
//! | `GET /api/health` | none | queue statistics |
//! | `GET /metrics` | none | Prometheus exposition |

pub mod error;
pub mod extract;
pub mod routes;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use axum::Router;

use crate::auth::CredentialValidator;
use crate::config::ApiConfig;
use crate::metrics::metrics_handler;
use crate::scheduler::QueueManager;
use crate::storage::InventoryRepository;

pub use error::ApiError;
pub use extract::SystemAuth;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    pub validator: Arc<CredentialValidator>,
    pub queue: Arc<QueueManager>,
    pub repository: Arc<dyn InventoryRepository>,
    pub config: ApiConfig,
}

/// Builds the router with body limit and request deadline applied.
pub fn build_router(state: AppState) -> Router {
    let max_body = state.config.max_request_size;
    let deadline = state.config.request_timeout;

    Router::new()
        .route("/api/systems/heartbeat", post(routes::heartbeat))
        .route("/api/systems/inventory", post(routes::submit_inventory))
        .route("/api/health", get(routes::health))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(max_body))
        .layer(middleware::from_fn_with_state(
            deadline,
            routes::request_deadline,
        ))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthConfig;
    use crate::scheduler::{QueueConfig, QueueKind};
    use crate::storage::{MemoryRepository, SystemCredentials};
    use crate::store::MemoryStore;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::password_hash::{PasswordHasher, SaltString};
    use argon2::{Algorithm, Argon2, Params, Version};
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use chrono::Utc;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    const KEY: &str = "NETH-0042";
    const SECRET_PART: &str = "fedcba9876543210fedcba9876543210";

    fn secret() -> String {
        format!("my_pub42.{}", SECRET_PART)
    }

    fn cheap_hash(secret: &str) -> String {
        let params = Params::new(1024, 1, 1, None).unwrap();
        let salt = SaltString::generate(&mut OsRng);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password(secret.as_bytes(), &salt)
            .unwrap()
            .to_string()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        repo: Arc<MemoryRepository>,
        queue: Arc<QueueManager>,
        router: Router,
    }

    fn fixture_with(api: ApiConfig, queue_config: QueueConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let repo = Arc::new(MemoryRepository::new());
        repo.add_system(SystemCredentials {
            system_id: "sys-42".to_string(),
            system_key: KEY.to_string(),
            secret_public: "pub42".to_string(),
            secret_hash: cheap_hash(SECRET_PART),
            active: true,
            last_used_at: None,
        });

        let queue = Arc::new(QueueManager::new(store.clone(), queue_config));
        let validator = Arc::new(CredentialValidator::new(
            store.clone(),
            repo.clone(),
            AuthConfig::default(),
        ));
        let router = build_router(AppState {
            validator,
            queue: queue.clone(),
            repository: repo.clone(),
            config: api,
        });
        Fixture {
            store,
            repo,
            queue,
            router,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ApiConfig::default(), QueueConfig::default())
    }

    fn basic(key: &str, secret: &str) -> String {
        format!("Basic {}", STANDARD.encode(format!("{}:{}", key, secret)))
    }

    fn inventory() -> Value {
        json!({
            "fqdn": "node42.example.com",
            "ipv4_address": "192.168.1.42",
            "os": {"name": "NethServer", "type": "linux", "family": "rhel", "release": "8.2"}
        })
    }

    fn post(uri: &str, auth: Option<String>, body: String) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body)).unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_inventory_is_queued() {
        let f = fixture();
        let body = inventory().to_string();
        let size = body.len();

        let response = f
            .router
            .oneshot(post(
                "/api/systems/inventory",
                Some(basic(KEY, &secret())),
                body,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = json_body(response).await;
        assert_eq!(json["system_id"], "sys-42");
        assert_eq!(json["queue_status"], "queued");
        assert_eq!(json["data_size"], size);

        let msg = f
            .queue
            .dequeue_message(QueueKind::Inventory, Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.system_id, "sys-42");
        assert_eq!(msg.data["data"]["fqdn"], "node42.example.com");
    }

    #[tokio::test]
    async fn test_missing_credentials_get_challenge() {
        let f = fixture();
        let response = f
            .router
            .oneshot(post("/api/systems/inventory", None, inventory().to_string()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=\"System Authentication\""
        );
    }

    #[tokio::test]
    async fn test_wrong_secret_is_unauthorized() {
        let f = fixture();
        let wrong = format!("my_pub42.{}", "0".repeat(32));
        let response = f
            .router
            .oneshot(post(
                "/api/systems/inventory",
                Some(basic(KEY, &wrong)),
                inventory().to_string(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(f.queue.get_queue_stats().await.unwrap().pending_jobs, 0);
    }

    #[tokio::test]
    async fn test_invalid_inventory_is_bad_request() {
        let f = fixture();
        let mut data = inventory();
        data["ipv4_address"] = json!("not-an-ip");

        let response = f
            .router
            .clone()
            .oneshot(post(
                "/api/systems/inventory",
                Some(basic(KEY, &secret())),
                data.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = f
            .router
            .oneshot(post(
                "/api/systems/inventory",
                Some(basic(KEY, &secret())),
                "{not json".to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(f.queue.get_queue_stats().await.unwrap().pending_jobs, 0);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let f = fixture_with(
            ApiConfig {
                max_request_size: 64,
                ..ApiConfig::default()
            },
            QueueConfig::default(),
        );
        let mut data = inventory();
        data["custom"] = json!({"blob": "x".repeat(256)});

        let response = f
            .router
            .oneshot(post(
                "/api/systems/inventory",
                Some(basic(KEY, &secret())),
                data.to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_backpressure_returns_retry_after() {
        let f = fixture_with(
            ApiConfig::default(),
            QueueConfig {
                max_queue_depth: 1,
                backpressure_threshold: 1.0,
                ..QueueConfig::default()
            },
        );
        let send = || {
            post(
                "/api/systems/inventory",
                Some(basic(KEY, &secret())),
                inventory().to_string(),
            )
        };

        let first = f.router.clone().oneshot(send()).await.unwrap();
        assert_eq!(first.status(), StatusCode::ACCEPTED);

        let second = f.router.oneshot(send()).await.unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_store_outage_is_service_unavailable() {
        let f = fixture();
        f.store.set_unavailable(true);

        let response = f
            .router
            .oneshot(post(
                "/api/systems/inventory",
                Some(basic(KEY, &secret())),
                inventory().to_string(),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_heartbeat_is_acknowledged() {
        let f = fixture();
        let response = f
            .router
            .oneshot(post(
                "/api/systems/heartbeat",
                Some(basic(KEY, &secret())),
                String::new(),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["system_key"], KEY);
        assert_eq!(json["acknowledged"], true);

        let stale = f
            .repo
            .stale_heartbeats(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].system_id, "sys-42");
    }

    #[tokio::test]
    async fn test_health_reports_queue_stats() {
        let f = fixture();
        f.queue
            .enqueue_processing("sys-42", &json!({"record_id": 1}))
            .await
            .unwrap();

        let response = f
            .router
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["pending_jobs"], 1);
        assert_eq!(json["queue_health"], "healthy");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let f = fixture();
        let response = f
            .router
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
