use thiserror::Error;

/// Listener and socket failures surfaced at startup
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum NetworkError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },
}

/// Bad settings file contents or CLI flags.
///
/// The server refuses to start on any of these; the backfill job exits
/// before touching storage.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigurationError {
    #[error("Settings file not found: {0}")]
    FileNotFound(String),

    #[error("Unable to parse settings: {0}")]
    Parse(String),

    #[error("Required setting '{0}' is empty")]
    MissingField(String),

    #[error("Setting '{field}' is invalid: {reason}")]
    InvalidValue { field: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigurationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_names_field() {
        let err = ConfigurationError::invalid("stop_grace_period", "unknown unit 'x'");
        assert_eq!(
            err.to_string(),
            "Setting 'stop_grace_period' is invalid: unknown unit 'x'"
        );
    }

    #[test]
    fn test_bind_names_address() {
        let err = NetworkError::Bind {
            addr: "0.0.0.0:5993".into(),
            reason: "address in use".into(),
        };
        assert_eq!(err.to_string(), "Failed to bind 0.0.0.0:5993: address in use");
    }
}
