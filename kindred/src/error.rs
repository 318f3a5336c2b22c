use thiserror::Error;

#[derive(Error, Debug)]
pub enum KindredError {
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Validation error at {path}: {message}")]
    Validation { path: String, message: String },

    #[error(
        "Document not found: {model}/{id}{}",
        .path.as_ref().map(|p| format!(" (referenced by {p})")).unwrap_or_default()
    )]
    NotFound {
        model: String,
        id: String,
        /// Field holding the missing reference, when there is one.
        path: Option<String>,
    },

    #[error("Referential integrity violation: {0}")]
    ReferentialIntegrity(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Not authorized: {0}")]
    Authorization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid identifier: {0}")]
    Decode(#[from] base64::DecodeError),
}

/// Boundary classification of an error, independent of which layer raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    StoreFailure,
    AuthorizationFailure,
    Schema,
    Query,
}

impl KindredError {
    pub fn validation(path: impl Into<String>, message: impl Into<String>) -> Self {
        KindredError::Validation {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn not_found(model: impl Into<String>, id: &serde_json::Value) -> Self {
        let id = match id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        KindredError::NotFound {
            model: model.into(),
            id,
            path: None,
        }
    }

    /// A missing document reached through the reference at `path`.
    pub fn not_found_at(path: impl Into<String>, model: impl Into<String>, id: &serde_json::Value) -> Self {
        match Self::not_found(model, id) {
            KindredError::NotFound { model, id, .. } => KindredError::NotFound {
                model,
                id,
                path: Some(path.into()),
            },
            other => other,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            KindredError::NotFound { .. } => ErrorKind::NotFound,
            KindredError::Validation { .. } | KindredError::ReferentialIntegrity(_) => {
                ErrorKind::Validation
            }
            KindredError::Store(_) | KindredError::Io(_) | KindredError::Sqlite(_) => {
                ErrorKind::StoreFailure
            }
            KindredError::Authorization(_) => ErrorKind::AuthorizationFailure,
            KindredError::Schema(_) | KindredError::Yaml(_) => ErrorKind::Schema,
            KindredError::Query(_) | KindredError::Json(_) | KindredError::Decode(_) => {
                ErrorKind::Query
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, KindredError>;
