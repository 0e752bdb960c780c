//! Compiles rule text into [`Rule`]s.
//!
//! Grammar, one rule per string:
//!
//! ```text
//! <federated-path>[/*] => <source-path>[ $ <relative-exception>]*
//! ```
//!
//! The parser keeps an ordered list of rule-parsing functions. Each returns
//! `None` when it does not recognize the text; the first that does wins.

use once_cell::sync::Lazy;
use regex::Regex;

use weave_core::{Path, RuleSide, RuleSyntaxError};

use crate::rule::{PathRule, Rule};

const SEPARATOR: &str = "=>";
const WILDCARD_SUFFIX: &str = "/*";

static PATH_RULE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?P<federated>[^=$]*)=>(?P<source>[^$]*)(?P<exceptions>(?:\$[^$]*)*)$")
        .expect("Invalid path rule regex")
});

/// A rule-parsing function.
pub type RuleParserFn = fn(&str) -> Option<Result<Rule, RuleSyntaxError>>;

/// Ordered set of rule-parsing functions.
#[derive(Clone)]
pub struct ProjectionParser {
    parsers: Vec<RuleParserFn>,
}

impl std::fmt::Debug for ProjectionParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionParser")
            .field("parsers", &self.parsers.len())
            .finish()
    }
}

impl Default for ProjectionParser {
    fn default() -> Self {
        Self {
            parsers: vec![parse_path_rule],
        }
    }
}

impl ProjectionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parser tried after the existing ones.
    pub fn register(&mut self, parser: RuleParserFn) {
        self.parsers.push(parser);
    }

    /// Add a parser tried before the existing ones.
    pub fn register_first(&mut self, parser: RuleParserFn) {
        self.parsers.insert(0, parser);
    }

    pub fn parse(&self, text: &str) -> Result<Rule, RuleSyntaxError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RuleSyntaxError::Empty);
        }
        for parser in &self.parsers {
            if let Some(result) = parser(text) {
                return result;
            }
        }
        if !text.contains(SEPARATOR) {
            return Err(RuleSyntaxError::MissingSeparator {
                text: text.to_string(),
            });
        }
        Err(RuleSyntaxError::InvalidPath {
            text: text.to_string(),
            side: RuleSide::Federated,
            reason: "no rule parser recognised the text".to_string(),
        })
    }

    /// Compile every rule, failing on the first bad one.
    pub fn parse_all<S: AsRef<str>>(&self, texts: &[S]) -> Result<Vec<Rule>, RuleSyntaxError> {
        texts.iter().map(|t| self.parse(t.as_ref())).collect()
    }
}

fn invalid_path(text: &str, side: RuleSide, reason: impl ToString) -> RuleSyntaxError {
    RuleSyntaxError::InvalidPath {
        text: text.to_string(),
        side,
        reason: reason.to_string(),
    }
}

/// Parser for offset and wildcard rules, with optional exceptions.
pub fn parse_path_rule(text: &str) -> Option<Result<Rule, RuleSyntaxError>> {
    if !text.contains(SEPARATOR) {
        return None;
    }
    let Some(captures) = PATH_RULE_PATTERN.captures(text) else {
        return Some(Err(invalid_path(
            text,
            RuleSide::Federated,
            "expected '<federated> => <source>'",
        )));
    };
    let federated = captures.name("federated").map_or("", |m| m.as_str()).trim();
    let source = captures.name("source").map_or("", |m| m.as_str()).trim();
    let exceptions = captures.name("exceptions").map_or("", |m| m.as_str());
    Some(build_path_rule(text, federated, source, exceptions))
}

fn build_path_rule(
    text: &str,
    federated: &str,
    source: &str,
    exceptions: &str,
) -> Result<Rule, RuleSyntaxError> {
    if federated.is_empty() {
        return Err(RuleSyntaxError::EmptySide {
            text: text.to_string(),
            side: RuleSide::Federated,
        });
    }
    if source.is_empty() {
        return Err(RuleSyntaxError::EmptySide {
            text: text.to_string(),
            side: RuleSide::Source,
        });
    }

    let (federated, wildcard) = match federated.strip_suffix(WILDCARD_SUFFIX) {
        Some("") => ("/", true),
        Some(prefix) => (prefix, true),
        None => (federated, false),
    };
    if federated.contains('*') || source.contains('*') {
        return Err(RuleSyntaxError::MisplacedWildcard {
            text: text.to_string(),
        });
    }
    let federated_root =
        Path::parse(federated).map_err(|e| invalid_path(text, RuleSide::Federated, e))?;
    let source_root = Path::parse(source).map_err(|e| invalid_path(text, RuleSide::Source, e))?;

    let mut relative_exceptions = Vec::new();
    for exception in exceptions.split('$').map(str::trim).filter(|e| !e.is_empty()) {
        if exception.starts_with('/') {
            return Err(RuleSyntaxError::AbsoluteException {
                text: text.to_string(),
                exception: exception.to_string(),
            });
        }
        if exception.contains('*') {
            return Err(RuleSyntaxError::MisplacedWildcard {
                text: text.to_string(),
            });
        }
        let relative = Path::parse(&format!("/{}", exception))
            .map_err(|e| invalid_path(text, RuleSide::Source, e))?;
        relative_exceptions.push(relative);
    }

    if !wildcard && relative_exceptions.is_empty() {
        return Ok(Rule::offset(federated_root, source_root));
    }
    let mut rule = PathRule::new(federated_root, source_root);
    if !wildcard {
        rule = rule.without_wildcard();
    }
    for relative in relative_exceptions {
        rule = rule.with_exception(relative.segments());
    }
    Ok(Rule::Path(rule))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(text: &str) -> Path {
        Path::parse(text).unwrap()
    }

    fn parse(text: &str) -> Result<Rule, RuleSyntaxError> {
        ProjectionParser::new().parse(text)
    }

    #[test]
    fn test_parse_conformance_corpus() {
        let corpus = [
            ("/      => /cache/repo/A", "/", "/cache/repo/A"),
            ("/a     => /source/one/a", "/a", "/source/one/a"),
            ("/b     => /source/one/b", "/b", "/source/one/b"),
            ("/a     => /source/two/a", "/a", "/source/two/a"),
            ("/      => /", "/", "/"),
        ];
        for (text, federated, source) in corpus {
            let rule = parse(text).unwrap();
            assert!(!rule.is_path_rule(), "{} should be an offset rule", text);
            assert_eq!(rule.federated_root(), &p(federated));
            assert_eq!(rule.source_root(), &p(source));
        }
    }

    #[test]
    fn test_parse_wildcard_rule() {
        let rule = parse("/a/* => /source/one/a").unwrap();
        assert!(rule.is_path_rule());
        assert_eq!(rule.federated_root(), &p("/a"));
        assert_eq!(
            rule.translate_to_source(&p("/a/x")),
            Some(p("/source/one/a/x"))
        );

        let root = parse("/* => /mount").unwrap();
        assert_eq!(root.federated_root(), &Path::root());
    }

    #[test]
    fn test_parse_exceptions() {
        let rule = parse("/docs/* => /store/docs $ archive $ tmp/scratch").unwrap();
        match &rule {
            Rule::Path(path_rule) => {
                assert_eq!(
                    path_rule.exceptions(),
                    &[p("/store/docs/archive"), p("/store/docs/tmp/scratch")]
                );
            }
            other => panic!("expected path rule, got {:?}", other),
        }
        assert_eq!(rule.translate_to_source(&p("/docs/tmp/scratch/x")), None);
        assert_eq!(
            rule.translate_to_source(&p("/docs/tmp")),
            Some(p("/store/docs/tmp"))
        );
    }

    #[test]
    fn test_missing_separator() {
        assert_eq!(
            parse("/a /source/one/a"),
            Err(RuleSyntaxError::MissingSeparator {
                text: "/a /source/one/a".to_string()
            })
        );
    }

    #[test]
    fn test_empty_sides() {
        assert!(matches!(
            parse("=> /source"),
            Err(RuleSyntaxError::EmptySide {
                side: RuleSide::Federated,
                ..
            })
        ));
        assert!(matches!(
            parse("/a =>"),
            Err(RuleSyntaxError::EmptySide {
                side: RuleSide::Source,
                ..
            })
        ));
        assert_eq!(parse("   "), Err(RuleSyntaxError::Empty));
    }

    #[test]
    fn test_relative_paths_are_rejected() {
        assert!(matches!(
            parse("a => /s"),
            Err(RuleSyntaxError::InvalidPath {
                side: RuleSide::Federated,
                ..
            })
        ));
        assert!(matches!(
            parse("/a => s"),
            Err(RuleSyntaxError::InvalidPath {
                side: RuleSide::Source,
                ..
            })
        ));
    }

    #[test]
    fn test_absolute_exception_is_rejected() {
        assert!(matches!(
            parse("/a/* => /s $ /abs"),
            Err(RuleSyntaxError::AbsoluteException { .. })
        ));
    }

    #[test]
    fn test_misplaced_wildcard() {
        assert!(matches!(
            parse("/a/*/b => /s"),
            Err(RuleSyntaxError::MisplacedWildcard { .. })
        ));
        assert!(matches!(
            parse("/a => /s/*"),
            Err(RuleSyntaxError::MisplacedWildcard { .. })
        ));
    }

    #[test]
    fn test_display_parses_back() {
        let parser = ProjectionParser::new();
        for text in ["/a => /source/one/a", "/a/* => /s", "/x/* => /y $ z", "/* => /"] {
            let rule = parser.parse(text).unwrap();
            assert_eq!(rule.to_string(), text);
            assert_eq!(parser.parse(&rule.to_string()).unwrap(), rule);
        }
    }

    #[test]
    fn test_registered_parser_is_consulted() {
        fn parse_mirror(text: &str) -> Option<Result<Rule, RuleSyntaxError>> {
            let rest = text.strip_prefix("mirror ")?;
            Some(
                Path::parse(rest)
                    .map(|path| Rule::offset(path.clone(), path))
                    .map_err(|e| RuleSyntaxError::InvalidPath {
                        text: text.to_string(),
                        side: RuleSide::Federated,
                        reason: e.to_string(),
                    }),
            )
        }

        let mut parser = ProjectionParser::new();
        assert!(parser.parse("mirror /m").is_err());
        parser.register(parse_mirror);
        let rule = parser.parse("mirror /m").unwrap();
        assert_eq!(rule.source_root(), &p("/m"));
    }

    #[test]
    fn test_parse_all_stops_at_first_error() {
        let parser = ProjectionParser::new();
        assert_eq!(parser.parse_all(&["/a => /b", "/c => /d"]).unwrap().len(), 2);
        assert!(parser.parse_all(&["/a => /b", "broken"]).is_err());
    }
}
