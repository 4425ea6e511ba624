//! Template rendering
//!
//! A template is literal text with `{name}` tokens. `{{` and `}}` produce
//! literal braces, and brace text that is not a valid token is kept as is.
//! Rendering never fails and never performs I/O: unknown tokens become the
//! configured fallback.

use once_cell::sync::Lazy;
use regex::Regex;

use super::result::{ Placeholders, PluginResult };
use crate::config::GeneralConfig;

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\{\{|\}\}|\{([A-Za-z0-9_.:\-]+)\}").expect("token pattern is valid")
});

/// What to substitute for tokens no plugin produced
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Fallback {
    pub text: String,
    /// Render the literal `{token}` instead of `text`
    pub keep_unmatched: bool,
}

impl Fallback {
    pub fn from_general(general: &GeneralConfig) -> Self {
        Self {
            text: general.fallback.clone(),
            keep_unmatched: general.keep_unmatched,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Token(String),
}

/// A parsed template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for captures in TOKEN.captures_iter(source) {
            let Some(whole) = captures.get(0) else {
                continue;
            };
            literal.push_str(&source[last..whole.start()]);
            last = whole.end();

            match captures.get(1) {
                Some(name) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Token(name.as_str().to_string()));
                }
                None => literal.push_str(&whole.as_str()[..1]),
            }
        }

        literal.push_str(&source[last..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    pub fn render(&self, placeholders: &Placeholders, fallback: &Fallback) -> String {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Token(name) =>
                    match placeholders.get(name) {
                        Some(value) => out.push_str(value),
                        None if fallback.keep_unmatched => {
                            out.push('{');
                            out.push_str(name);
                            out.push('}');
                        }
                        None => out.push_str(&fallback.text),
                    }
            }
        }
        out
    }
}

/// Merge results in order; a later result's key overrides an earlier one
pub fn merge<'a>(results: impl IntoIterator<Item = &'a PluginResult>) -> Placeholders {
    let mut merged = Placeholders::new();
    for result in results {
        for (key, value) in &result.placeholders {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Merged placeholders and the templates to render against them
#[derive(Debug, Clone)]
pub struct RenderContext {
    pub placeholders: Placeholders,
    pub templates: Vec<Template>,
    pub fallback: Fallback,
}

impl RenderContext {
    pub fn new(placeholders: Placeholders, templates: &[String], fallback: Fallback) -> Self {
        Self {
            placeholders,
            templates: templates
                .iter()
                .map(|t| Template::parse(t))
                .collect(),
            fallback,
        }
    }

    /// One line per template
    pub fn render(&self) -> Vec<String> {
        self.templates
            .iter()
            .map(|template| template.render(&self.placeholders, &self.fallback))
            .collect()
    }
}

/// Render `template` against `placeholders` in one call
pub fn render(template: &str, placeholders: &Placeholders, fallback: &Fallback) -> String {
    Template::parse(template).render(placeholders, fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> Placeholders {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_missing_placeholder_uses_empty_fallback() {
        let out = render("CPU:{cpu} MEM:{mem}", &map(&[("cpu", "42%")]), &Fallback::default());
        assert_eq!(out, "CPU:42% MEM:");
    }

    #[test]
    fn test_keep_unmatched_marker() {
        let fallback = Fallback { text: "?".into(), keep_unmatched: true };
        assert_eq!(render("{cpu} {mem}", &map(&[("cpu", "1%")]), &fallback), "1% {mem}");

        let fallback = Fallback { text: "?".into(), keep_unmatched: false };
        assert_eq!(render("{cpu} {mem}", &map(&[("cpu", "1%")]), &fallback), "1% ?");
    }

    #[test]
    fn test_escapes_and_literal_braces() {
        let values = map(&[("x", "1")]);
        assert_eq!(render("{{x}} = {x}", &values, &Fallback::default()), "{x} = 1");
        assert_eq!(render("{ not a token } {}", &values, &Fallback::default()), "{ not a token } {}");
        assert_eq!(render("tail {", &values, &Fallback::default()), "tail {");
    }

    #[test]
    fn test_values_are_verbatim() {
        let values = map(&[("git", "\x1b[32mmain\x1b[0m"), ("braces", "{cpu}")]);
        let out = render("{git} {braces}", &values, &Fallback::default());
        assert_eq!(out, "\x1b[32mmain\x1b[0m {cpu}");
    }

    #[test]
    fn test_token_charset() {
        let values = map(&[("net_speed", "1"), ("disk.root", "2"), ("ping:8.8.8.8", "3"), ("a-b", "4")]);
        let out = render("{net_speed} {disk.root} {ping:8.8.8.8} {a-b} {a b}", &values, &Fallback::default());
        assert_eq!(out, "1 2 3 4 {a b}");
    }

    #[test]
    fn test_merge_later_wins() {
        let first = PluginResult::success("a", map(&[("temp", "40C"), ("a", "1")]));
        let second = PluginResult::success("b", map(&[("temp", "41C")]));
        let failed = PluginResult::failed("c", "boom");

        let merged = merge([&first, &second, &failed]);
        assert_eq!(merged, map(&[("temp", "41C"), ("a", "1")]));
    }

    #[test]
    fn test_context_renders_each_template() {
        let ctx = RenderContext::new(
            map(&[("cpu", "5%")]),
            &["CPU:{cpu}".to_string(), "MEM:{mem}".to_string()],
            Fallback::default()
        );
        assert_eq!(ctx.render(), vec!["CPU:5%".to_string(), "MEM:".to_string()]);
    }
}
