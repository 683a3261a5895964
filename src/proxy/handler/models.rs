use std::sync::Arc;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppContext;

/// `GET /v1/models`: the fixed catalog in Anthropic list shape.
pub async fn handle_list_models(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let data: Vec<Value> = ctx
        .catalog
        .list()
        .iter()
        .map(|model| {
            json!({
                "type": "model",
                "id": model.id,
                "display_name": model.display_name,
                "created_at": model.created_at,
            })
        })
        .collect();

    let first_id = data.first().and_then(|m| m["id"].as_str().map(String::from));
    let last_id = data.last().and_then(|m| m["id"].as_str().map(String::from));

    Json(json!({
        "data": data,
        "has_more": false,
        "first_id": first_id,
        "last_id": last_id,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;
    use crate::session::{SessionConfig, SessionDriver, SessionError, SessionHandle};
    use async_trait::async_trait;

    struct NoSessionDriver;

    #[async_trait]
    impl SessionDriver for NoSessionDriver {
        async fn open(
            &self,
            _config: SessionConfig,
            _prompt: String,
        ) -> Result<SessionHandle, SessionError> {
            Err(SessionError::Start("not under test".to_string()))
        }
    }

    #[tokio::test]
    async fn test_model_list_shape() {
        let ctx = Arc::new(
            AppContext::new(ProxyConfig::default(), Arc::new(NoSessionDriver), 50505).unwrap(),
        );
        let Json(body) = handle_list_models(State(ctx)).await;

        assert_eq!(body["has_more"], false);
        let data = body["data"].as_array().unwrap();
        assert!(!data.is_empty());
        assert_eq!(data[0]["type"], "model");
        assert!(data[0]["id"].is_string());
        assert_eq!(body["first_id"], data[0]["id"]);
    }
}
