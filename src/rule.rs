use http::Request;
use regex::Regex;

use crate::error::Error;
use crate::template::{RequestContext, Template, TemplateEngine, TemplateError};

/// Name of the only field rules can rewrite today
pub const HOST_FIELD: &str = "Host";

/// How replacement of a rule is interpreted
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
#[non_exhaustive]
pub enum RuleMode {
    /// every match is replaced, expanding `$1`, `${name}` capture references
    Substitute,
    /// whole host is replaced with template output when pattern matches
    Template,
}

/// Single rewrite rule as written in configuration
///
/// # Examples
///
/// ```rust
/// use tower_dynamic_host::{RewriteRule, RuleMode};
/// let rule = RewriteRule::host(r"^([^.]+)\.localhost$", "$1.example.com");
/// let templated = RewriteRule::host(r"^sub\.localhost$", "[[ .Host ]].example.com")
///     .with_mode(RuleMode::Template);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct RewriteRule {
    /// field rewritten by rule, only `Host` has an effect
    pub name: String,
    /// regular expression tested against current host
    pub regex_pattern: String,
    /// replacement or template producing new host
    pub new_host: String,
    /// explicit mode, inferred from `new_host` when missing
    #[cfg_attr(feature = "serde", serde(default))]
    pub mode: Option<RuleMode>,
}

impl RewriteRule {
    /// Create rule for provided field
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        regex_pattern: impl Into<String>,
        new_host: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            regex_pattern: regex_pattern.into(),
            new_host: new_host.into(),
            mode: None,
        }
    }

    /// Create rule targeting `Host`
    #[must_use]
    pub fn host(regex_pattern: impl Into<String>, new_host: impl Into<String>) -> Self {
        Self::new(HOST_FIELD, regex_pattern, new_host)
    }

    /// Set explicit mode
    #[must_use]
    pub fn with_mode(mut self, mode: RuleMode) -> Self {
        self.mode = Some(mode);
        self
    }
}

/// Configuration payload consumed by
/// [`RewriteHostLayer::from_config`](crate::RewriteHostLayer::from_config)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize))]
pub struct RewriteHostConfig {
    /// ordered rules
    #[cfg_attr(feature = "serde", serde(default, alias = "headers"))]
    pub rules: Vec<RewriteRule>,
}

#[derive(Clone, Debug)]
enum Replacement {
    Substitute(String),
    Template(Result<Template, TemplateError>),
}

/// Rule with pattern compiled and template parsed. Failures are kept and
/// only reported when a request reaches the rule.
#[derive(Clone, Debug)]
pub(crate) struct CompiledRule {
    targets_host: bool,
    pattern: String,
    regex: Result<Regex, regex::Error>,
    replacement: Replacement,
}

impl CompiledRule {
    fn compile(rule: RewriteRule, engine: &TemplateEngine) -> Self {
        let mode = rule.mode.unwrap_or_else(|| {
            if engine.is_template(&rule.new_host) {
                RuleMode::Template
            } else {
                RuleMode::Substitute
            }
        });
        let replacement = match mode {
            RuleMode::Substitute => Replacement::Substitute(rule.new_host),
            RuleMode::Template => Replacement::Template(engine.parse(&rule.new_host)),
        };
        Self {
            targets_host: rule.name.eq_ignore_ascii_case(HOST_FIELD),
            regex: Regex::new(&rule.regex_pattern),
            pattern: rule.regex_pattern,
            replacement,
        }
    }

    fn regex(&self) -> Result<&Regex, Error> {
        self.regex.as_ref().map_err(|source| Error::InvalidPattern {
            pattern: self.pattern.clone(),
            source: source.clone(),
        })
    }

    fn check(&self) -> Result<(), Error> {
        if !self.targets_host {
            return Ok(());
        }
        self.regex()?;
        if let Replacement::Template(Err(error)) = &self.replacement {
            return Err(error.clone().into());
        }
        Ok(())
    }

    /// Apply rule to current host of context. `None` means host is left
    /// unchanged.
    pub(crate) fn apply(&self, context: &RequestContext<'_>) -> Result<Option<String>, Error> {
        if !self.targets_host {
            return Ok(None);
        }
        let regex = self.regex()?;
        let host = context.host();
        match &self.replacement {
            Replacement::Substitute(replacement) => {
                if !regex.is_match(host) {
                    return Ok(None);
                }
                Ok(Some(
                    regex.replace_all(host, replacement.as_str()).into_owned(),
                ))
            }
            Replacement::Template(template) => {
                if !regex.is_match(host) {
                    return Ok(None);
                }
                let template = template.as_ref().map_err(TemplateError::clone)?;
                Ok(Some(template.execute(context)?))
            }
        }
    }
}

/// Ordered, immutable list of rules. Insertion order is evaluation order.
#[derive(Clone, Debug)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules with provided template engine
    ///
    /// Invalid patterns and templates do not fail construction, they are
    /// reported for each request reaching them. Use [`RuleSet::validate`] to
    /// detect them early.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmptyRules`] when no rule is provided
    pub fn new<I>(rules: I, engine: &TemplateEngine) -> Result<Self, Error>
    where
        I: IntoIterator<Item = RewriteRule>,
    {
        let rules: Vec<CompiledRule> = rules
            .into_iter()
            .map(|rule| CompiledRule::compile(rule, engine))
            .collect();
        if rules.is_empty() {
            return Err(Error::EmptyRules);
        }
        Ok(Self { rules })
    }

    /// Check every host rule for invalid pattern or template
    ///
    /// # Errors
    ///
    /// Returns first error found in rule order
    pub fn validate(&self) -> Result<(), Error> {
        self.rules.iter().try_for_each(CompiledRule::check)
    }

    /// Whether any rule rewrites `Host`
    #[must_use]
    pub fn targets_host(&self) -> bool {
        self.rules.iter().any(|rule| rule.targets_host)
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Always false as empty rule set cannot be built
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule in order, each one receiving host produced by previous
    /// one
    ///
    /// # Errors
    ///
    /// Returns error of first rule whose pattern or template fails
    pub fn evaluate<B>(&self, request: &Request<B>, host: &str) -> Result<String, Error> {
        let mut current = host.to_string();
        for rule in &self.rules {
            let rewritten = rule.apply(&RequestContext::new(request, &current))?;
            if let Some(rewritten) = rewritten {
                current = rewritten;
            }
        }
        Ok(current)
    }
}
