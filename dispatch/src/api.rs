use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Body of a `GET /tests` response. `class` and `methods` are only present
/// when a test is being handed out.
#[derive(Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct TestsResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub methods: Option<Vec<String>>,
    pub finished: bool,
}

impl TestsResponse {
    pub fn finished() -> Self {
        TestsResponse {
            class: None,
            methods: None,
            finished: true,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TestsQuery {
    pub runner: String,
    pub revision: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResultsQuery {
    pub runner: String,
}

/// Rejections surfaced to runners. Every variant leaves server state
/// unchanged.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Class {0} not checked out.")]
    ClassNotCheckedOut(String),
    #[error("Class {class_path} checked out by runner {owner}, not {runner}.")]
    WrongRunner {
        class_path: String,
        owner: String,
        runner: String,
    },
    #[error("Method {method} not checked out by runner {runner}.")]
    MethodNotCheckedOut { method: String, runner: String },

    #[error("Incorrect revision {client} -- server is running revision {server}")]
    RevisionMismatch { client: String, server: String },
    #[error("missing required parameter: revision")]
    MissingRevision,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        match self {
            DispatchError::ClassNotCheckedOut(_)
            | DispatchError::WrongRunner { .. }
            | DispatchError::MethodNotCheckedOut { .. }
            | DispatchError::RevisionMismatch { .. } => (StatusCode::CONFLICT, self.to_string()),

            DispatchError::MissingRevision => (StatusCode::BAD_REQUEST, self.to_string()),
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_response_omits_test_fields() {
        let body = serde_json::to_value(TestsResponse::finished()).unwrap();
        assert_eq!(body, serde_json::json!({"finished": true}));
    }

    #[test]
    fn revision_mismatch_reason_text() {
        let err = DispatchError::RevisionMismatch {
            client: "B".to_string(),
            server: "A".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Incorrect revision B -- server is running revision A"
        );
    }

    #[test]
    fn protocol_violations_map_to_conflict() {
        let resp = DispatchError::ClassNotCheckedOut("m C".to_string()).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = DispatchError::MissingRevision.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
