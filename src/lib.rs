//! Crate which provides a tower layer rewriting the request host from an
//! ordered list of regex rules, using either capture substitution (`$1`) or
//! bracket delimited templates (`[[ .Host ]]`)
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

/// module for error
pub mod error;

/// module for rewrite rules and rule set
pub mod rule;

/// module for layer, service and future
pub mod service;

/// module for bracket delimited templates
pub mod template;


/// Extension to store host value before it was rewritten.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginalHost(pub String);

#[doc(inline)]
pub use error::Error;
#[doc(inline)]
pub use rule::{RewriteHostConfig, RewriteRule, RuleMode};
#[doc(inline)]
pub use service::RewriteHostLayer;
