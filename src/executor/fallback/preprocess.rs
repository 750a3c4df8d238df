//! Source preprocessing applied before the fallback interpreter runs code
//!
//! Each transform is named and independent. A pipeline applies them in the
//! order given.

use regex::Regex;
use std::sync::OnceLock;

/// Directive the fallback interpreter needs for unqualified standard names
pub const COMPAT_SHIM: &str = "using namespace std;";

/// A single named rewrite of the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Remove zero-width and other invisible format characters
    StripInvisibleChars,
    /// Convert CRLF and lone CR line endings to LF
    NormalizeNewlines,
    /// Drop every remaining non-ASCII character
    AsciiFilter,
    /// Insert `using namespace std;` after the includes when missing
    InjectCompatShim,
    /// Remove `std::` qualifiers
    StripNamespaceQualifier,
}

impl Transform {
    pub fn name(self) -> &'static str {
        match self {
            Transform::StripInvisibleChars => "strip-invisible-chars",
            Transform::NormalizeNewlines => "normalize-newlines",
            Transform::AsciiFilter => "ascii-filter",
            Transform::InjectCompatShim => "inject-compat-shim",
            Transform::StripNamespaceQualifier => "strip-namespace-qualifier",
        }
    }

    pub fn apply(self, source: &str) -> String {
        match self {
            Transform::StripInvisibleChars => invisible_chars().replace_all(source, "").into_owned(),
            Transform::NormalizeNewlines => source.replace("\r\n", "\n").replace('\r', "\n"),
            Transform::AsciiFilter => source.chars().filter(char::is_ascii).collect(),
            Transform::InjectCompatShim => inject_compat_shim(source),
            Transform::StripNamespaceQualifier => {
                namespace_qualifier().replace_all(source, "").into_owned()
            }
        }
    }
}

/// Ordered list of transforms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    transforms: Vec<Transform>,
}

impl Pipeline {
    pub fn new(transforms: Vec<Transform>) -> Self {
        Self { transforms }
    }

    /// Pipeline run before every fallback execution
    pub fn fallback_default() -> Self {
        Self::new(vec![
            Transform::StripInvisibleChars,
            Transform::NormalizeNewlines,
            Transform::AsciiFilter,
            Transform::InjectCompatShim,
            Transform::StripNamespaceQualifier,
        ])
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn apply(&self, source: &str) -> String {
        self.transforms
            .iter()
            .fold(source.to_string(), |code, transform| transform.apply(&code))
    }
}

fn invisible_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[\x{200B}-\x{200F}\x{2028}\x{2029}\x{202A}-\x{202E}\x{2060}-\x{2064}\x{FEFF}\x{00AD}]")
            .expect("invisible character pattern is valid")
    })
}

fn namespace_qualifier() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bstd::").expect("namespace pattern is valid"))
}

fn include_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*#[ \t]*include\b.*$").expect("include pattern is valid"))
}

fn inject_compat_shim(source: &str) -> String {
    if source.contains(COMPAT_SHIM) {
        return source.to_string();
    }

    match include_line().find_iter(source).last() {
        Some(last) => {
            let (head, tail) = source.split_at(last.end());
            format!("{}\n{}{}", head, COMPAT_SHIM, tail)
        }
        None => format!("{}\n{}", COMPAT_SHIM, source),
    }
}
