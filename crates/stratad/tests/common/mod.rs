//! Common test utilities for stratad integration tests

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use tower::ServiceExt;

use strata_core::Keypair;
use stratad::api::create_router;
use stratad::config::{Config, RateLimitConfig};
use stratad::log_buffer::LogBuffer;
use stratad::state::AppState;

/// In-process daemon driven through the router.
pub struct TestDaemon {
    pub state: AppState,
    pub router: Router,
}

impl TestDaemon {
    pub fn new() -> Self {
        Self::with_config(Config {
            cors_enabled: false,
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            ..Default::default()
        })
    }

    pub fn with_config(config: Config) -> Self {
        let state = AppState::new(config, Arc::new(LogBuffer::new(64, 16)))
            .expect("Failed to build application state");
        let router = create_router(state.clone());
        Self { state, router }
    }

    /// Issue one RPC; `method` is `Service/Method` under `strata.v1`.
    pub async fn rpc(&self, method: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        self.rpc_from(method, token, body, "127.0.0.1:40000").await
    }

    pub async fn rpc_from(
        &self,
        method: &str,
        token: Option<&str>,
        body: Value,
        peer: &str,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(format!("/rpc/strata.v1.{method}"))
            .header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let mut request = builder
            .body(Body::from(body.to_string()))
            .expect("Failed to build request");
        let peer: SocketAddr = peer.parse().expect("Invalid peer address");
        request.extensions_mut().insert(ConnectInfo(peer));

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).expect("Response is not JSON")
        };
        (status, value)
    }

    pub async fn get(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder()
            .uri(path)
            .body(Body::empty())
            .expect("Failed to build request");
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("Router failed");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("Failed to read body");
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Challenge plus VerifyChallenge for `key`; returns the verify response.
    pub async fn login(&self, key: &Keypair) -> Value {
        let (status, challenge) = self
            .rpc(
                "AuthService/Challenge",
                None,
                json!({ "public_key": key.public_key_ssh() }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "challenge failed: {challenge}");

        let nonce = STANDARD
            .decode(challenge["nonce"].as_str().expect("nonce"))
            .expect("nonce is base64");
        let (status, verified) = self
            .rpc(
                "AuthService/VerifyChallenge",
                None,
                json!({
                    "challenge_id": challenge["challenge_id"],
                    "signature": key.sign_base64(&nonce),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "verify failed: {verified}");
        verified
    }

    /// Log in a fresh key and return its session token.
    pub async fn token(&self) -> String {
        let verified = self.login(&Keypair::generate()).await;
        verified["session_token"]
            .as_str()
            .expect("session token")
            .to_string()
    }
}
