//! Remote control API surface.
//!
//! spec.md scopes the HTTP/JSON frontend out as an external collaborator;
//! `RemoteApi` is the seam such a frontend is built against, and `dispatch`
//! is the generic method-name-to-call router it would sit behind. No
//! transport is implemented here.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::experiment::ExperimentId;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),
    #[error("bad arguments for '{0}': {1}")]
    BadArgs(String, String),
    #[error("experiment error: {0}")]
    Experiment(#[from] crate::experiment::ExperimentError),
}

/// Station-level control surface named by spec.md §6.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn start(&self) -> Result<(), ApiError>;
    async fn stop(&self) -> Result<(), ApiError>;
    async fn pause(&self) -> Result<(), ApiError>;
    async fn shutdown(&self) -> Result<(), ApiError>;
    async fn add_experiment(&self, experiment_type: &str, kwargs: JsonValue) -> Result<ExperimentId, ApiError>;
    async fn insert_experiment_after(
        &self,
        after: ExperimentId,
        experiment_type: &str,
        kwargs: JsonValue,
    ) -> Result<ExperimentId, ApiError>;
    async fn station_overview(&self) -> Result<JsonValue, ApiError>;
    async fn station_run_tables(&self) -> Result<JsonValue, ApiError>;
    async fn station_components(&self) -> Result<JsonValue, ApiError>;
    async fn get_experiment_types(&self) -> Result<Vec<String>, ApiError>;
    async fn get_updates(
        &self,
        producer: &str,
        name: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<JsonValue>, ApiError>;
}

/// Routes a bare `(method, args)` pair — the shape a JSON-RPC-style frontend
/// would receive off the wire — onto the matching `RemoteApi` call.
pub async fn dispatch(api: &dyn RemoteApi, method: &str, args: JsonValue) -> Result<JsonValue, ApiError> {
    match method {
        "start" => api.start().await.map(|()| JsonValue::Null),
        "stop" => api.stop().await.map(|()| JsonValue::Null),
        "pause" => api.pause().await.map(|()| JsonValue::Null),
        "shutdown" => api.shutdown().await.map(|()| JsonValue::Null),
        "add_experiment" => {
            let experiment_type = args
                .get("experiment_type")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| ApiError::BadArgs(method.into(), "missing 'experiment_type'".into()))?;
            let kwargs = args.get("kwargs").cloned().unwrap_or(JsonValue::Null);
            api.add_experiment(experiment_type, kwargs)
                .await
                .map(|id| serde_json::json!(id.to_string()))
        }
        "insert_experiment_after" => {
            let after = args
                .get("after")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| ApiError::BadArgs(method.into(), "missing 'after'".into()))?;
            let after: ExperimentId = after
                .parse::<uuid::Uuid>()
                .map(ExperimentId::from)
                .map_err(|e| ApiError::BadArgs(method.into(), e.to_string()))?;
            let experiment_type = args
                .get("experiment_type")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| ApiError::BadArgs(method.into(), "missing 'experiment_type'".into()))?;
            let kwargs = args.get("kwargs").cloned().unwrap_or(JsonValue::Null);
            api.insert_experiment_after(after, experiment_type, kwargs)
                .await
                .map(|id| serde_json::json!(id.to_string()))
        }
        "station_overview" => api.station_overview().await,
        "station_run_tables" => api.station_run_tables().await,
        "station_components" => api.station_components().await,
        "get_experiment_types" => api.get_experiment_types().await.map(|types| serde_json::json!(types)),
        "get_updates" => {
            let producer = args
                .get("producer")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| ApiError::BadArgs(method.into(), "missing 'producer'".into()))?;
            let name = args
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| ApiError::BadArgs(method.into(), "missing 'name'".into()))?;
            let since = args
                .get("since")
                .and_then(JsonValue::as_str)
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&Utc));
            api.get_updates(producer, name, since).await.map(|v| serde_json::json!(v))
        }
        other => Err(ApiError::UnknownMethod(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeApi {
        started: Mutex<bool>,
    }

    #[async_trait]
    impl RemoteApi for FakeApi {
        async fn start(&self) -> Result<(), ApiError> {
            *self.started.lock().unwrap() = true;
            Ok(())
        }
        async fn stop(&self) -> Result<(), ApiError> {
            Ok(())
        }
        async fn pause(&self) -> Result<(), ApiError> {
            Ok(())
        }
        async fn shutdown(&self) -> Result<(), ApiError> {
            Ok(())
        }
        async fn add_experiment(&self, _experiment_type: &str, _kwargs: JsonValue) -> Result<ExperimentId, ApiError> {
            Ok(ExperimentId::new())
        }
        async fn insert_experiment_after(
            &self,
            _after: ExperimentId,
            _experiment_type: &str,
            _kwargs: JsonValue,
        ) -> Result<ExperimentId, ApiError> {
            Ok(ExperimentId::new())
        }
        async fn station_overview(&self) -> Result<JsonValue, ApiError> {
            Ok(serde_json::json!({"devices": []}))
        }
        async fn station_run_tables(&self) -> Result<JsonValue, ApiError> {
            Ok(JsonValue::Null)
        }
        async fn station_components(&self) -> Result<JsonValue, ApiError> {
            Ok(JsonValue::Null)
        }
        async fn get_experiment_types(&self) -> Result<Vec<String>, ApiError> {
            Ok(vec!["titration".into()])
        }
        async fn get_updates(
            &self,
            _producer: &str,
            _name: &str,
            _since: Option<DateTime<Utc>>,
        ) -> Result<Vec<JsonValue>, ApiError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn dispatch_routes_start_and_mutates_state() {
        let api = FakeApi::default();
        dispatch(&api, "start", JsonValue::Null).await.unwrap();
        assert!(*api.started.lock().unwrap());
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_method() {
        let api = FakeApi::default();
        let result = dispatch(&api, "reticulate_splines", JsonValue::Null).await;
        assert!(matches!(result, Err(ApiError::UnknownMethod(_))));
    }

    #[tokio::test]
    async fn dispatch_requires_experiment_type_for_add_experiment() {
        let api = FakeApi::default();
        let result = dispatch(&api, "add_experiment", serde_json::json!({})).await;
        assert!(matches!(result, Err(ApiError::BadArgs(_, _))));
    }

    #[tokio::test]
    async fn dispatch_routes_get_experiment_types() {
        let api = FakeApi::default();
        let result = dispatch(&api, "get_experiment_types", JsonValue::Null).await.unwrap();
        assert_eq!(result, serde_json::json!(["titration"]));
    }
}
