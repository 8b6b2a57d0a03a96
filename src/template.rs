//! Small bracket delimited template language used by template rules.
//!
//! Templates are plain text with actions enclosed in delimiters (`[[` and
//! `]]` by default). Actions read fields of the request being rewritten:
//!
//! - `[[ .Host ]]`, `[[ .Method ]]`, `[[ .Proto ]]`, `[[ .RequestURI ]]`
//! - `[[ .URL.Path ]]`, `[[ .URL.RawQuery ]]`, `[[ .URL.Scheme ]]`,
//!   `[[ .URL.Host ]]`
//! - `[[ index .Header "X-Tenant" ]]`
//! - `[[ "literal" ]]` and `[[/* comment */]]`
//!
//! `[[- ` and ` -]]` trim whitespace from the text before or after the
//! action.

use std::borrow::Cow;
use std::fmt;
use std::iter::Peekable;
use std::str::Chars;

use http::uri::PathAndQuery;
use http::{HeaderMap, Method, Request, Uri, Version};

use crate::service::authority_host;

const DEFAULT_LEFT_DELIMITER: &str = "[[";
const DEFAULT_RIGHT_DELIMITER: &str = "]]";

/// Error raised while parsing or executing template
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TemplateError {
    /// action is opened but never closed
    #[error("template: {offset}: unclosed action")]
    UnclosedAction {
        /// byte offset of action in template
        offset: usize,
    },
    /// action without any command
    #[error("template: {offset}: missing value for command")]
    EmptyAction {
        /// byte offset of action in template
        offset: usize,
    },
    /// quoted string is never closed
    #[error("template: {offset}: unterminated quoted string")]
    UnterminatedString {
        /// byte offset of action in template
        offset: usize,
    },
    /// field path with empty segment
    #[error("template: {offset}: bad field {field}")]
    BadField {
        /// byte offset of action in template
        offset: usize,
        /// field as written
        field: String,
    },
    /// call of unknown function
    #[error("template: {offset}: function \"{name}\" not defined")]
    UndefinedFunction {
        /// byte offset of action in template
        offset: usize,
        /// function name
        name: String,
    },
    /// token which is not allowed at its position
    #[error("template: {offset}: unexpected {token} in command")]
    UnexpectedToken {
        /// byte offset of action in template
        offset: usize,
        /// offending token
        token: String,
    },
    /// `index` called with wrong number of arguments
    #[error("template: {offset}: wrong number of args for index: want 2 got {got}")]
    IndexArity {
        /// byte offset of action in template
        offset: usize,
        /// number of arguments passed
        got: usize,
    },
    /// field does not exist on request
    #[error("template: can't evaluate field {field}")]
    UnknownField {
        /// field path
        field: String,
    },
    /// field exists but is not a string
    #[error("template: can't print field {field}")]
    NotPrintable {
        /// field path
        field: String,
    },
    /// `index` used on field which is not a header map
    #[error("template: can't index item of field {field}")]
    NotIndexable {
        /// field path
        field: String,
    },
}

/// Template engine holding the delimiter configuration.
///
/// Engine is immutable and shared by every rule of a layer, parsing does not
/// keep any state between calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateEngine {
    left: String,
    right: String,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    /// Create engine using `[[` and `]]` delimiters
    #[must_use]
    pub fn new() -> Self {
        Self {
            left: DEFAULT_LEFT_DELIMITER.to_string(),
            right: DEFAULT_RIGHT_DELIMITER.to_string(),
        }
    }

    /// Create engine with custom delimiters. Empty delimiter falls back to
    /// default one.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use tower_dynamic_host::template::TemplateEngine;
    /// let engine = TemplateEngine::with_delimiters("{%", "%}");
    /// assert!(engine.is_template("{% .Host %}.example.com"));
    /// ```
    #[must_use]
    pub fn with_delimiters(left: impl Into<String>, right: impl Into<String>) -> Self {
        let mut left = left.into();
        let mut right = right.into();
        if left.is_empty() {
            DEFAULT_LEFT_DELIMITER.clone_into(&mut left);
        }
        if right.is_empty() {
            DEFAULT_RIGHT_DELIMITER.clone_into(&mut right);
        }
        Self { left, right }
    }

    /// Left delimiter
    #[must_use]
    pub fn left_delimiter(&self) -> &str {
        &self.left
    }

    /// Right delimiter
    #[must_use]
    pub fn right_delimiter(&self) -> &str {
        &self.right
    }

    /// Check whether source contains an action
    #[must_use]
    pub fn is_template(&self, source: &str) -> bool {
        source.contains(self.left.as_str())
    }

    /// Parse template source
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] when an action is malformed
    pub fn parse(&self, source: &str) -> Result<Template, TemplateError> {
        let mut nodes = Vec::new();
        let mut rest = source;
        let mut consumed = 0;
        let mut trim_leading = false;

        while let Some(start) = rest.find(self.left.as_str()) {
            let offset = consumed + start;
            let body_start = start + self.left.len();
            let tail = &rest[body_start..];
            let Some(body_len) =
                find_closing(tail, &self.right).or_else(|| tail.find(self.right.as_str()))
            else {
                return Err(TemplateError::UnclosedAction { offset });
            };

            let mut text = &rest[..start];
            if trim_leading {
                text = text.trim_start();
            }
            let mut body = &rest[body_start..body_start + body_len];
            if let Some(stripped) = body.strip_prefix("- ") {
                body = stripped;
                text = text.trim_end();
            }
            trim_leading = false;
            if let Some(stripped) = body.strip_suffix(" -") {
                body = stripped;
                trim_leading = true;
            }

            push_text(&mut nodes, text);
            let body = body.trim();
            if !is_comment(body) {
                nodes.push(Node::Action(parse_action(body, offset)?));
            }

            let next = body_start + body_len + self.right.len();
            consumed += next;
            rest = &rest[next..];
        }

        if trim_leading {
            rest = rest.trim_start();
        }
        push_text(&mut nodes, rest);

        Ok(Template {
            source: source.to_string(),
            nodes,
        })
    }
}

/// Parsed template
#[derive(Clone, Debug)]
pub struct Template {
    source: String,
    nodes: Vec<Node>,
}

impl Template {
    /// Source text the template was parsed from
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Execute template with request context as data
    ///
    /// # Errors
    ///
    /// Returns [`TemplateError`] when an action refers to a field the
    /// request does not expose
    pub fn execute(&self, context: &RequestContext<'_>) -> Result<String, TemplateError> {
        let mut output = String::new();
        for node in &self.nodes {
            match node {
                Node::Text(text) => output.push_str(text),
                Node::Action(expr) => context.write_expr(expr, &mut output)?,
            }
        }
        Ok(output)
    }
}

/// Request data visible to template actions.
///
/// `host` is the host being rewritten, which is the output of previous rules
/// rather than the value the request arrived with.
#[derive(Clone, Copy, Debug)]
pub struct RequestContext<'a> {
    host: &'a str,
    method: &'a Method,
    uri: &'a Uri,
    version: Version,
    headers: &'a HeaderMap,
}

impl<'a> RequestContext<'a> {
    /// Bind request and current host
    #[must_use]
    pub fn new<B>(request: &'a Request<B>, host: &'a str) -> Self {
        Self {
            host,
            method: request.method(),
            uri: request.uri(),
            version: request.version(),
            headers: request.headers(),
        }
    }

    /// Current host
    #[must_use]
    pub fn host(&self) -> &'a str {
        self.host
    }

    fn write_expr(&self, expr: &Expr, output: &mut String) -> Result<(), TemplateError> {
        match expr {
            Expr::Field(path) => output.push_str(&self.field(path)?),
            Expr::Literal(value) => output.push_str(value),
            Expr::Index { base, key } => {
                if !matches!(base.as_slice(), [name] if name == "Header") {
                    return Err(TemplateError::NotIndexable {
                        field: field_name(base),
                    });
                }
                let value = self
                    .headers
                    .get(key.as_str())
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or_default();
                output.push_str(value);
            }
        }
        Ok(())
    }

    fn field(&self, path: &[String]) -> Result<Cow<'a, str>, TemplateError> {
        let segments: Vec<&str> = path.iter().map(String::as_str).collect();
        let value = match segments.as_slice() {
            ["Host"] => self.host,
            ["Method"] => self.method.as_str(),
            ["Proto"] => proto(self.version),
            // absolute-form target is kept whole
            ["RequestURI"] if self.uri.scheme().is_some() => {
                return Ok(Cow::Owned(self.uri.to_string()));
            }
            ["RequestURI"] => self.uri.path_and_query().map_or("/", PathAndQuery::as_str),
            ["URL", "Path"] => self.uri.path(),
            ["URL", "RawQuery"] => self.uri.query().unwrap_or_default(),
            ["URL", "Scheme"] => self.uri.scheme_str().unwrap_or_default(),
            ["URL", "Host"] => self.uri.authority().map_or("", authority_host),
            ["Header" | "URL"] => {
                return Err(TemplateError::NotPrintable {
                    field: field_name(path),
                });
            }
            _ => {
                return Err(TemplateError::UnknownField {
                    field: field_name(path),
                });
            }
        };
        Ok(Cow::Borrowed(value))
    }
}

#[derive(Clone, Debug)]
enum Node {
    Text(String),
    Action(Expr),
}

#[derive(Clone, Debug)]
enum Expr {
    Field(Vec<String>),
    Literal(String),
    Index { base: Vec<String>, key: String },
}

enum Token {
    Field(Vec<String>),
    Str(String),
    Ident(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Field(path) => f.write_str(&field_name(path)),
            Token::Str(value) => write!(f, "\"{value}\""),
            Token::Ident(name) => f.write_str(name),
        }
    }
}

fn push_text(nodes: &mut Vec<Node>, text: &str) {
    if !text.is_empty() {
        nodes.push(Node::Text(text.to_string()));
    }
}

fn is_comment(body: &str) -> bool {
    body.len() >= 4 && body.starts_with("/*") && body.ends_with("*/")
}

fn parse_action(body: &str, offset: usize) -> Result<Expr, TemplateError> {
    let mut tokens = tokenize(body, offset)?.into_iter();
    let expr = match tokens.next() {
        None => return Err(TemplateError::EmptyAction { offset }),
        Some(Token::Field(path)) => Expr::Field(path),
        Some(Token::Str(value)) => Expr::Literal(value),
        Some(Token::Ident(name)) if name == "index" => {
            let args: Vec<Token> = tokens.collect();
            let [base, key] = <[Token; 2]>::try_from(args)
                .map_err(|args| TemplateError::IndexArity {
                    offset,
                    got: args.len(),
                })?;
            return match (base, key) {
                (Token::Field(base), Token::Str(key)) => Ok(Expr::Index { base, key }),
                (Token::Field(_), token) | (token, _) => Err(TemplateError::UnexpectedToken {
                    offset,
                    token: token.to_string(),
                }),
            };
        }
        Some(Token::Ident(name)) => return Err(TemplateError::UndefinedFunction { offset, name }),
    };

    if let Some(token) = tokens.next() {
        return Err(TemplateError::UnexpectedToken {
            offset,
            token: token.to_string(),
        });
    }
    Ok(expr)
}

fn tokenize(body: &str, offset: usize) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = body.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            tokens.push(Token::Str(read_string(&mut chars, offset)?));
        } else if c == '.' || c == '_' || c.is_alphabetic() {
            let word = read_word(&mut chars);
            let token = match word.strip_prefix('.') {
                Some(path) => Token::Field(field_path(path, &word, offset)?),
                None => Token::Ident(word),
            };
            tokens.push(token);
        } else {
            return Err(TemplateError::UnexpectedToken {
                offset,
                token: c.to_string(),
            });
        }
    }

    Ok(tokens)
}

fn read_string(chars: &mut Peekable<Chars<'_>>, offset: usize) -> Result<String, TemplateError> {
    let mut value = String::new();
    while let Some(c) = chars.next() {
        match c {
            '"' => return Ok(value),
            '\\' => match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(escaped) => value.push(escaped),
                None => break,
            },
            _ => value.push(c),
        }
    }
    Err(TemplateError::UnterminatedString { offset })
}

fn read_word(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut word = String::new();
    while let Some(&c) = chars.peek() {
        if c == '.' || c == '_' || c.is_alphanumeric() {
            word.push(c);
            chars.next();
        } else {
            break;
        }
    }
    word
}

fn field_path(path: &str, word: &str, offset: usize) -> Result<Vec<String>, TemplateError> {
    let segments: Vec<String> = path.split('.').map(str::to_string).collect();
    if segments.iter().any(String::is_empty) {
        return Err(TemplateError::BadField {
            offset,
            field: word.to_string(),
        });
    }
    Ok(segments)
}

fn field_name(path: &[String]) -> String {
    format!(".{}", path.join("."))
}

fn proto(version: Version) -> &'static str {
    if version == Version::HTTP_09 {
        "HTTP/0.9"
    } else if version == Version::HTTP_10 {
        "HTTP/1.0"
    } else if version == Version::HTTP_2 {
        "HTTP/2.0"
    } else if version == Version::HTTP_3 {
        "HTTP/3.0"
    } else {
        "HTTP/1.1"
    }
}

/// Position of right delimiter outside of quoted strings
fn find_closing(tail: &str, right: &str) -> Option<usize> {
    let mut in_quote = false;
    let mut escaped = false;
    for (index, c) in tail.char_indices() {
        if in_quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_quote = false;
            }
        } else if tail[index..].starts_with(right) {
            return Some(index);
        } else if c == '"' {
            in_quote = true;
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use http::{Request, Version};

    use crate::template::{RequestContext, TemplateEngine, TemplateError};

    fn render(source: &str, request: &Request<()>, host: &str) -> Result<String, TemplateError> {
        let template = TemplateEngine::new().parse(source)?;
        template.execute(&RequestContext::new(request, host))
    }

    #[test]
    fn host_field() {
        let request = Request::new(());
        let output = render("[[ .Host ]].example.com", &request, "sub.localhost").unwrap();
        assert_eq!(output, "sub.localhost.example.com");
    }

    #[test]
    fn plain_text_is_kept() {
        let request = Request::new(());
        let output = render("static.example.com", &request, "ignored").unwrap();
        assert_eq!(output, "static.example.com");
    }

    #[test]
    fn request_fields() {
        let request = Request::builder()
            .method("POST")
            .uri("https://api.example.com:8443/v1/items?limit=5")
            .version(Version::HTTP_2)
            .body(())
            .unwrap();
        let output = render(
            "[[.Method]] [[.Proto]] [[.URL.Scheme]] [[.URL.Host]] [[.URL.Path]] \
             [[.URL.RawQuery]] [[.RequestURI]]",
            &request,
            "",
        )
        .unwrap();
        assert_eq!(
            output,
            "POST HTTP/2.0 https api.example.com:8443 /v1/items limit=5 \
             https://api.example.com:8443/v1/items?limit=5"
        );
    }

    #[test]
    fn request_uri_of_origin_form() {
        let request = Request::builder().uri("/v1/items?limit=5").body(()).unwrap();
        assert_eq!(
            render("[[ .RequestURI ]]", &request, "").unwrap(),
            "/v1/items?limit=5"
        );
    }

    #[test]
    fn missing_uri_parts_are_empty() {
        let request = Request::builder().uri("/only/path").body(()).unwrap();
        let output = render(
            "[[.URL.Scheme]]|[[.URL.Host]]|[[.URL.RawQuery]]",
            &request,
            "",
        )
        .unwrap();
        assert_eq!(output, "||");
    }

    #[test]
    fn header_index() {
        let request = Request::builder()
            .header("X-Tenant", "acme")
            .body(())
            .unwrap();
        let output = render(
            r#"[[ index .Header "x-tenant" ]].[[ index .Header "X-Missing" ]]tenants.local"#,
            &request,
            "",
        )
        .unwrap();
        assert_eq!(output, "acme.tenants.local");
    }

    #[test]
    fn literal_comment_and_trim() {
        let request = Request::new(());
        let output = render(
            "[[ \"a\\\"b\" ]]-[[/* ignored */]]x  [[- .Host -]]  .io",
            &request,
            "host",
        )
        .unwrap();
        assert_eq!(output, "a\"b-xhost.io");
    }

    #[test]
    fn delimiter_inside_literal() {
        let request = Request::new(());
        assert_eq!(render(r#"[[ "]]" ]]x"#, &request, "").unwrap(), "]]x");
        assert_eq!(
            render(r#"[[ "a"]]b" ]].[[ .Host ]]"#, &request, "host").unwrap(),
            "a\"]]b.host"
        );
    }

    #[test]
    fn custom_delimiters() {
        let engine = TemplateEngine::with_delimiters("{{", "}}");
        let template = engine.parse("{{ .Host }}.internal [[ .Host ]]").unwrap();
        let request = Request::new(());
        let output = template
            .execute(&RequestContext::new(&request, "svc"))
            .unwrap();
        assert_eq!(output, "svc.internal [[ .Host ]]");
        assert!(!engine.is_template("[[ .Host ]]"));
    }

    #[test]
    fn empty_delimiters_fall_back_to_default() {
        let engine = TemplateEngine::with_delimiters("", "");
        assert_eq!(engine, TemplateEngine::default());
    }

    #[test]
    fn parse_errors() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine.parse("abc[[ .Host").unwrap_err(),
            TemplateError::UnclosedAction { offset: 3 }
        );
        assert_eq!(
            engine.parse("[[ ]]").unwrap_err(),
            TemplateError::EmptyAction { offset: 0 }
        );
        assert_eq!(
            engine.parse("[[ \"open ]]").unwrap_err(),
            TemplateError::UnterminatedString { offset: 0 }
        );
        assert!(matches!(
            engine.parse("[[ .URL..Path ]]").unwrap_err(),
            TemplateError::BadField { .. }
        ));
        assert!(matches!(
            engine.parse("[[ lower .Host ]]").unwrap_err(),
            TemplateError::UndefinedFunction { name, .. } if name == "lower"
        ));
        assert!(matches!(
            engine.parse("[[ .Host .Method ]]").unwrap_err(),
            TemplateError::UnexpectedToken { token, .. } if token == ".Method"
        ));
        assert!(matches!(
            engine.parse("[[ .Host | x ]]").unwrap_err(),
            TemplateError::UnexpectedToken { token, .. } if token == "|"
        ));
        assert_eq!(
            engine.parse("[[ index .Header ]]").unwrap_err(),
            TemplateError::IndexArity { offset: 0, got: 1 }
        );
        assert!(matches!(
            engine.parse("[[ index \"a\" \"b\" ]]").unwrap_err(),
            TemplateError::UnexpectedToken { .. }
        ));
    }

    #[test]
    fn execute_errors() {
        let request = Request::new(());
        assert_eq!(
            render("[[ .Nope ]]", &request, "").unwrap_err(),
            TemplateError::UnknownField {
                field: ".Nope".to_string()
            }
        );
        assert_eq!(
            render("[[ .Header ]]", &request, "").unwrap_err(),
            TemplateError::NotPrintable {
                field: ".Header".to_string()
            }
        );
        assert_eq!(
            render("[[ index .URL \"Path\" ]]", &request, "").unwrap_err(),
            TemplateError::NotIndexable {
                field: ".URL".to_string()
            }
        );
    }
}
