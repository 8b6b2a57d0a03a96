use crate::template::TemplateError;

/// Enum for different error generated from crates
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// error raised when layer is built without any rule
    #[error("rules cannot be empty")]
    EmptyRules,
    /// error when rule pattern is not a valid regular expression
    #[error("invalid regex pattern {pattern}: {source}")]
    InvalidPattern {
        /// pattern as written in rule
        pattern: String,
        /// error reported by regex compiler
        source: regex::Error,
    },
    /// error when rule template fails to parse or execute
    #[error(transparent)]
    Template(#[from] TemplateError),
    /// error when incoming host header is not visible ascii
    #[error("invalid host header")]
    InvalidHostHeader,
    /// error when rewritten host cannot be used as host
    #[error("invalid rewritten host {0}")]
    InvalidHost(String),
}
