//! Handler normalization.
//!
//! Plugins may write a handler as a named function, an anonymous function
//! expression, or an arrow function. Each accepted form is classified once
//! at load time and rendered into a single invocable expression, so the
//! sandbox only ever evaluates one canonical shape.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

static NAMED_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(async\s+)?function\s+([A-Za-z_$][\w$]*)\s*\(").expect("invalid regex")
});
static ANONYMOUS_FUNCTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(async\s+)?function\s*\(").expect("invalid regex"));
static ARROW_FUNCTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(async\s+)?(\([^)]*\)|[A-Za-z_$][\w$]*)\s*=>").expect("invalid regex")
});

/// The textual form a handler was written in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerSource {
    /// `function name(...) { ... }` or `async function name(...) { ... }`.
    NamedFunction {
        /// Declared function name.
        name: String,
        /// Whether the function is `async`.
        is_async: bool,
    },
    /// `function (...) { ... }`.
    AnonymousFunction {
        /// Whether the function is `async`.
        is_async: bool,
    },
    /// `(a, b) => ...`, `x => ...`, `async (a) => ...`.
    Arrow {
        /// Whether the arrow is `async`.
        is_async: bool,
    },
}

impl HandlerSource {
    /// Classify handler source text.
    ///
    /// # Errors
    ///
    /// Returns a description if the text is not one of the accepted forms.
    pub fn classify(source: &str) -> Result<Self, String> {
        if let Some(caps) = NAMED_FUNCTION.captures(source) {
            return Ok(Self::NamedFunction {
                name: caps[2].to_owned(),
                is_async: caps.get(1).is_some(),
            });
        }
        if let Some(caps) = ANONYMOUS_FUNCTION.captures(source) {
            return Ok(Self::AnonymousFunction {
                is_async: caps.get(1).is_some(),
            });
        }
        if let Some(caps) = ARROW_FUNCTION.captures(source) {
            return Ok(Self::Arrow {
                is_async: caps.get(1).is_some(),
            });
        }
        Err("handler must be a function declaration, function expression, or arrow function".into())
    }

    /// Whether the handler was declared `async`.
    #[must_use]
    pub fn is_async(&self) -> bool {
        match self {
            Self::NamedFunction { is_async, .. }
            | Self::AnonymousFunction { is_async }
            | Self::Arrow { is_async } => *is_async,
        }
    }

    /// Render `source` (already classified as `self`) as one expression
    /// evaluating to the callable.
    #[must_use]
    pub fn render(&self, source: &str) -> String {
        let body = source.trim().trim_end_matches(';').trim_end();
        match self {
            Self::NamedFunction { name, .. } => {
                format!("(function () {{ {body}\n; return {name}; }})()")
            },
            Self::AnonymousFunction { .. } | Self::Arrow { .. } => format!("({body}\n)"),
        }
    }
}

impl fmt::Display for HandlerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = if self.is_async() { "async " } else { "" };
        match self {
            Self::NamedFunction { name, .. } => write!(f, "{prefix}function {name}"),
            Self::AnonymousFunction { .. } => write!(f, "{prefix}function"),
            Self::Arrow { .. } => write!(f, "{prefix}arrow"),
        }
    }
}

/// A classified handler together with its canonical invocable form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handler {
    source: HandlerSource,
    invocable: String,
}

impl Handler {
    /// Classify and render handler source text.
    ///
    /// # Errors
    ///
    /// Returns a description if the text is empty or not an accepted form.
    pub fn normalize(raw: &str) -> Result<Self, String> {
        if raw.trim().is_empty() {
            return Err("handler source is empty".into());
        }
        let source = HandlerSource::classify(raw)?;
        let invocable = source.render(raw);
        Ok(Self { source, invocable })
    }

    /// The form the handler was written in.
    #[must_use]
    pub fn source(&self) -> &HandlerSource {
        &self.source
    }

    /// Expression that evaluates to the handler function.
    #[must_use]
    pub fn invocable(&self) -> &str {
        &self.invocable
    }
}
