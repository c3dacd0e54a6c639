//! Typed error kinds for the harvest pipeline.
//!
//! Orchestration code works with [`anyhow::Error`]; the variants below are
//! raised where the kind matters to a caller (retry decisions, batch aborts,
//! the `exception_type` column of an error log).
//!
//! | Kind | Raised when | Handling |
//! |------|-------------|----------|
//! | `Transient` | network error, timeout, 429, 5xx | retried with backoff, then logged on the record |
//! | `Permanent` | other 4xx | logged on the record, no retry |
//! | `InvalidUrl` | a URL cannot be built | logged on the record, no retry |
//! | `Parse` | a field cannot be extracted | logged per field, record continues |
//! | `Config` | missing base URL, missing index | the batch aborts |
//! | `Projection` | the search engine rejects a document | `index_status = FAILED` |

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("transient failure fetching {url}: {message}")]
    Transient {
        url: String,
        status: Option<u16>,
        message: String,
    },

    #[error("permanent failure fetching {url} (HTTP {status}): {message}")]
    Permanent {
        url: String,
        status: u16,
        message: String,
    },

    #[error("invalid URL '{0}'")]
    InvalidUrl(String),

    #[error("could not parse field '{field}': {message}")]
    Parse { field: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("search engine rejected {index}/{id}: {message}")]
    Projection {
        index: String,
        id: String,
        message: String,
    },
}

impl HarvestError {
    /// Short name written to `harvest_error_logs.exception_type`.
    pub fn kind(&self) -> &'static str {
        match self {
            HarvestError::Transient { .. } => "TransientError",
            HarvestError::Permanent { .. } => "PermanentError",
            HarvestError::InvalidUrl(_) => "InvalidUrl",
            HarvestError::Parse { .. } => "ParseError",
            HarvestError::Config(_) => "ConfigError",
            HarvestError::Projection { .. } => "ProjectionError",
        }
    }

    pub fn parse(field: impl Into<String>, message: impl Into<String>) -> Self {
        HarvestError::Parse {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        HarvestError::Config(message.into())
    }
}

/// Client mistakes in gateway, indicator and admin requests.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("unknown data source: {0}")]
    UnknownDataSource(String),

    #[error("unknown field '{field}' in data source '{data_source}'")]
    UnknownField { data_source: String, field: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Invalid(String),
}

/// Best-effort kind name for any error in the pipeline.
pub fn error_kind(err: &anyhow::Error) -> String {
    if let Some(e) = err.downcast_ref::<HarvestError>() {
        return e.kind().to_string();
    }
    if err.downcast_ref::<serde_json::Error>().is_some() {
        return "JsonError".to_string();
    }
    if err.downcast_ref::<sqlx::Error>().is_some() {
        return "DatabaseError".to_string();
    }
    if err.downcast_ref::<quick_xml::Error>().is_some() {
        return "XmlError".to_string();
    }
    if err.downcast_ref::<reqwest::Error>().is_some() {
        return "HttpError".to_string();
    }
    "Error".to_string()
}

/// True when the error (or anything in its chain) is a configuration error.
pub fn is_config_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<HarvestError>(),
            Some(HarvestError::Config(_))
        )
    })
}

/// The request error somewhere in the chain, if any.
pub fn request_error(err: &anyhow::Error) -> Option<&RequestError> {
    err.chain().find_map(|cause| cause.downcast_ref::<RequestError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        let e = HarvestError::parse("date", "Invalid date");
        assert_eq!(e.kind(), "ParseError");
        assert_eq!(e.to_string(), "could not parse field 'date': Invalid date");
    }

    #[test]
    fn test_error_kind_downcasts_through_anyhow() {
        let err = anyhow::Error::new(HarvestError::config("missing base_url"));
        assert_eq!(error_kind(&err), "ConfigError");
        assert!(is_config_error(&err));

        let plain = anyhow::anyhow!("boom");
        assert_eq!(error_kind(&plain), "Error");
        assert!(!is_config_error(&plain));
    }

    #[test]
    fn test_config_error_found_behind_context() {
        let err = anyhow::Error::new(HarvestError::config("no url"))
            .context("harvesting preprints");
        assert!(is_config_error(&err));
    }

    #[test]
    fn test_request_error_found_in_chain() {
        let err = anyhow::Error::new(RequestError::UnknownDataSource("x".to_string()))
            .context("faceted search");
        assert!(matches!(request_error(&err), Some(RequestError::UnknownDataSource(_))));
        assert!(request_error(&anyhow::anyhow!("boom")).is_none());
    }
}
