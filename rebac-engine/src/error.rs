use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    #[error("Schema error at {location}: {message}")]
    Schema { message: String, location: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Undefined action '{action}' on entity type '{entity_type}'")]
    UndefinedAction { entity_type: String, action: String },

    #[error("Maximum recursion depth exceeded (budget {depth})")]
    DepthExceeded { depth: u32 },

    #[error("Evaluation canceled")]
    Canceled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    pub fn schema(message: impl Into<String>, location: impl Into<String>) -> Self {
        Self::Schema {
            message: message.into(),
            location: location.into(),
        }
    }

    pub fn undefined_action(entity_type: impl Into<String>, action: impl Into<String>) -> Self {
        Self::UndefinedAction {
            entity_type: entity_type.into(),
            action: action.into(),
        }
    }

    /// Stable machine-readable code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Schema { .. } => "SCHEMA_ERROR",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::UndefinedAction { .. } => "UNDEFINED_ACTION",
            Self::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            Self::Canceled => "CANCELED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<::config::ConfigError> for RebacError {
    fn from(err: ::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct_per_kind() {
        let depth = RebacError::DepthExceeded { depth: 3 };
        let undefined = RebacError::undefined_action("document", "share");

        assert_eq!(depth.error_code(), "DEPTH_EXCEEDED");
        assert_eq!(undefined.error_code(), "UNDEFINED_ACTION");
        assert_eq!(
            undefined.to_string(),
            "Undefined action 'share' on entity type 'document'"
        );
    }

    #[test]
    fn test_schema_error_carries_location() {
        let err = RebacError::schema("undefined relation 'owner'", "3:22");
        assert_eq!(err.to_string(), "Schema error at 3:22: undefined relation 'owner'");
    }
}
