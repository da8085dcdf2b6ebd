//! Filter model
//!
//! A filter is either a network filter (`[@@]pattern[$options]`) or a cosmetic
//! filter (`[hostnames]##body` / `[hostnames]#@#body`). Parsing keeps enough of
//! the original text that printing a parsed filter reproduces it, with the
//! network options kept in their original order.

use std::fmt;
use std::str::FromStr;

/// Error type for filter parsing and conversion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FilterError {
    #[error("Empty filter")]
    Empty,
    #[error("Comment line")]
    Comment,
    #[error("Cosmetic filter has an empty body")]
    EmptyCosmeticBody,
    #[error("Empty domain list in option: {0}")]
    EmptyDomainOption(String),
    #[error("Unsupported filter syntax: {0}")]
    UnsupportedSyntax(String),
    #[error("Unsupported option: {0}")]
    UnsupportedOption(String),
    #[error("Cosmetic filters cannot be converted to declarative rules")]
    CosmeticNotConvertible,
    #[error("Options exclude every resource type they include")]
    NoResourceTypes,
    #[error("No declarative rule ids left")]
    RuleIdsExhausted,
}

/// Parsed filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    Network(NetworkFilter),
    Cosmetic(CosmeticFilter),
}

/// `[@@]pattern[$option,option,...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkFilter {
    /// `@@` exception marker
    pub exception: bool,
    pub pattern: String,
    pub options: Vec<NetworkOption>,
}

/// One `$` option of a network filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkOption {
    /// `domain=a.com|~b.com`
    Domain(Vec<String>),
    /// Any other option, kept verbatim (`third-party`, `script`, `redirect=noop.js`, ...)
    Flag(String),
}

/// `[hostnames]##body` (hide) or `[hostnames]#@#body` (unhide).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmeticFilter {
    pub hostnames: Vec<String>,
    pub unhide: bool,
    pub body: String,
}

// =============================================================================
// Parsing
// =============================================================================

/// Comment and header lines of a filter list.
pub fn is_comment_line(line: &str) -> bool {
    line.starts_with('!')
        || line.starts_with('[')
        || (line.starts_with('#') && !line.starts_with("##") && !line.starts_with("#@#"))
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let line = raw.trim();
        if line.is_empty() {
            return Err(FilterError::Empty);
        }
        if is_comment_line(line) {
            return Err(FilterError::Comment);
        }

        // The first marker splits hostnames from the body; later ones belong
        // to the selector.
        for (pos, _) in line.match_indices('#') {
            let rest = &line[pos..];
            if rest.starts_with("#@#") {
                return parse_cosmetic(&line[..pos], &line[pos + 3..], true);
            }
            if rest.starts_with("##") {
                return parse_cosmetic(&line[..pos], &line[pos + 2..], false);
            }
            if UNSUPPORTED_MARKERS.iter().any(|marker| rest.starts_with(marker)) {
                return Err(FilterError::UnsupportedSyntax(line.to_string()));
            }
        }

        parse_network(line).map(Filter::Network)
    }
}

/// Extended cosmetic syntaxes (procedural, style, scriptlet injection).
const UNSUPPORTED_MARKERS: [&str; 5] = ["#?#", "#$#", "#@?#", "#@$#", "#%#"];

fn parse_cosmetic(hostnames: &str, body: &str, unhide: bool) -> Result<Filter, FilterError> {
    let body = body.trim();
    if body.is_empty() {
        return Err(FilterError::EmptyCosmeticBody);
    }

    let hostnames = hostnames
        .split(',')
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_ascii_lowercase)
        .collect();

    Ok(Filter::Cosmetic(CosmeticFilter {
        hostnames,
        unhide,
        body: body.to_string(),
    }))
}

fn parse_network(line: &str) -> Result<NetworkFilter, FilterError> {
    let (exception, line) = match line.strip_prefix("@@") {
        Some(rest) => (true, rest.trim_start()),
        None => (false, line),
    };

    let (pattern, options_text) = split_rule_options(line);
    let options = match options_text {
        Some(text) => parse_options(text)?,
        None => Vec::new(),
    };

    if pattern.is_empty() && options.is_empty() {
        return Err(FilterError::Empty);
    }

    Ok(NetworkFilter {
        exception,
        pattern: pattern.to_string(),
        options,
    })
}

/// Split at the last `$` unless what follows it is part of a path or regex.
fn split_rule_options(line: &str) -> (&str, Option<&str>) {
    match line.rfind('$') {
        Some(pos) if !line[pos + 1..].contains('/') => (&line[..pos], Some(&line[pos + 1..])),
        _ => (line, None),
    }
}

fn parse_options(text: &str) -> Result<Vec<NetworkOption>, FilterError> {
    let mut options = Vec::new();

    for raw in text.split(',') {
        let raw = raw.trim();
        if raw.is_empty() {
            continue;
        }

        match strip_prefix_ignore_case(raw, "domain=") {
            Some(value) => {
                let domains: Vec<String> = value
                    .split('|')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_ascii_lowercase)
                    .collect();
                if domains.is_empty() {
                    return Err(FilterError::EmptyDomainOption(raw.to_string()));
                }
                options.push(NetworkOption::Domain(domains));
            }
            None => options.push(NetworkOption::Flag(raw.to_string())),
        }
    }

    Ok(options)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s.is_char_boundary(prefix.len()) && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

// =============================================================================
// Accessors
// =============================================================================

impl Filter {
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    pub fn is_cosmetic(&self) -> bool {
        matches!(self, Self::Cosmetic(_))
    }

    /// Hostnames the filter is scoped to (`domain=` for network filters).
    /// Negated entries keep their `~` prefix.
    pub fn scope(&self) -> Vec<&str> {
        match self {
            Self::Network(filter) => filter.domains().map(|d| d.iter().map(String::as_str).collect()).unwrap_or_default(),
            Self::Cosmetic(filter) => filter.hostnames.iter().map(String::as_str).collect(),
        }
    }
}

impl NetworkFilter {
    /// Domains of the first `domain=` option.
    pub fn domains(&self) -> Option<&Vec<String>> {
        self.options.iter().find_map(|option| match option {
            NetworkOption::Domain(domains) => Some(domains),
            NetworkOption::Flag(_) => None,
        })
    }

    pub fn flags(&self) -> impl Iterator<Item = &str> {
        self.options.iter().filter_map(|option| match option {
            NetworkOption::Flag(flag) => Some(flag.as_str()),
            NetworkOption::Domain(_) => None,
        })
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags().any(|flag| flag.eq_ignore_ascii_case(name))
    }
}

// =============================================================================
// Printing
// =============================================================================

impl fmt::Display for NetworkOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Domain(domains) => write!(f, "domain={}", domains.join("|")),
            Self::Flag(flag) => f.write_str(flag),
        }
    }
}

impl fmt::Display for NetworkFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exception {
            f.write_str("@@")?;
        }
        f.write_str(&self.pattern)?;
        for (i, option) in self.options.iter().enumerate() {
            f.write_str(if i == 0 { "$" } else { "," })?;
            write!(f, "{option}")?;
        }
        Ok(())
    }
}

impl fmt::Display for CosmeticFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.unhide { "#@#" } else { "##" };
        write!(f, "{}{}{}", self.hostnames.join(","), marker, self.body)
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network(filter) => filter.fmt(f),
            Self::Cosmetic(filter) => filter.fmt(f),
        }
    }
}
