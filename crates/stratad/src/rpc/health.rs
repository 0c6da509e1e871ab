//! HealthService handler

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::{to_value, Services};
use crate::pipeline::{CallContext, CallResult};

#[derive(Clone, Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub uptime_secs: u64,
}

pub async fn check(services: Arc<Services>, _ctx: CallContext, _request: Value) -> CallResult {
    to_value(&HealthResponse {
        status: "serving".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        node_id: services.config.node_id.clone(),
        uptime_secs: services.started_at.elapsed().as_secs(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::methods;
    use crate::rpc::testing;

    #[tokio::test]
    async fn reports_serving() {
        let response = check(
            testing::services(),
            CallContext::new(methods::HEALTH_CHECK, Default::default()),
            Value::Null,
        )
        .await
        .unwrap();
        assert_eq!(response["status"], "serving");
        assert_eq!(response["version"], env!("CARGO_PKG_VERSION"));
    }
}
