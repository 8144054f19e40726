use thiserror::Error;

use crate::workspace::WorkspaceAction;

/// Errors surfaced by the orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error("no free port among {window} candidates starting at {base}")]
    PortExhaustion { base: u16, window: u16 },

    #[error("port forwarding failed: {0}")]
    Forwarding(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("routing failed: {0}")]
    Routing(String),

    #[error("store error: {0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("a {action} job for workspace {workspace_id} is already queued or running")]
    Duplicate {
        workspace_id: u64,
        action: WorkspaceAction,
    },

    #[error("job queue unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{program}` exited with {status}")]
    Exit { program: String, status: String },

    #[error("provisioning run was cancelled")]
    Cancelled,

    #[error("provisioning run aborted: {0}")]
    Aborted(String),
}

impl OrchestratorError {
    /// HTTP status the control server and proxy answer with.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            OrchestratorError::Dispatch(DispatchError::Duplicate { .. }) => StatusCode::CONFLICT,
            OrchestratorError::Dispatch(DispatchError::Unavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Routing(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::PortExhaustion { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Provisioning(_)
            | OrchestratorError::Forwarding(_)
            | OrchestratorError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

pub type Result<T, E = OrchestratorError> = std::result::Result<T, E>;

impl axum::response::IntoResponse for OrchestratorError {
    fn into_response(self) -> axum::response::Response {
        let body = axum::Json(serde_json::json!({ "error": self.to_string() }));
        (self.status_code(), body).into_response()
    }
}
