//! Root-relative URL rewriting for pages served under `/<relay>/`.
//!
//! The proxied application assumes it owns `/`. Browsers resolve its absolute
//! paths against the relay host, so `href="/app.js"` must become
//! `href="/<relay>/app.js"`.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)((?:href|src|action|data|content)=['"])(/[^'"]*)"#)
        .expect("valid attribute pattern")
});

static SCHEME_AFTER_SLASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^/[a-z]+:").expect("valid scheme pattern"));

/// Prefix root-relative attribute values with `/<relay_name>`.
///
/// Values already under `/<relay_name>/`, protocol-relative `//host` values and
/// `/scheme:` values are left alone, which makes the rewrite idempotent.
/// Returns the input borrowed when nothing changed.
pub fn rewrite_root_relative_paths<'a>(html: &'a str, relay_name: &str) -> Cow<'a, str> {
    let relay_prefix = format!("/{relay_name}/");
    ATTRIBUTE.replace_all(html, |caps: &Captures<'_>| {
        let attribute = &caps[1];
        let value = &caps[2];
        if needs_prefix(value, &relay_prefix) {
            format!("{attribute}/{relay_name}{value}")
        } else {
            format!("{attribute}{value}")
        }
    })
}

fn needs_prefix(value: &str, relay_prefix: &str) -> bool {
    if value.starts_with("//") || SCHEME_AFTER_SLASH.is_match(value) {
        return false;
    }
    !value
        .get(..relay_prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(relay_prefix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewrites_root_relative_attributes() {
        let html = r#"<link href="/app.css"><script src='/app.js'></script><form action="/submit">"#;
        let out = rewrite_root_relative_paths(html, "docs");
        assert_eq!(
            out,
            r#"<link href="/docs/app.css"><script src='/docs/app.js'></script><form action="/docs/submit">"#
        );
    }

    #[test]
    fn test_attribute_match_is_case_insensitive() {
        let out = rewrite_root_relative_paths(r#"<IMG SRC="/logo.png">"#, "docs");
        assert_eq!(out, r#"<IMG SRC="/docs/logo.png">"#);
    }

    #[test]
    fn test_leaves_full_and_protocol_relative_urls() {
        let html = r#"<a href="https://x.example/a"><img src="//cdn.example/x.png"><a href="relative/path">"#;
        let out = rewrite_root_relative_paths(html, "docs");
        assert_eq!(out, html);
    }

    #[test]
    fn test_leaves_already_prefixed_values() {
        let html = r#"<a href="/docs/index.html"><a href="/DOCS/x">"#;
        assert_eq!(rewrite_root_relative_paths(html, "docs"), html);
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let html = r#"<a href="/">home</a><img src="/img/a.png"><meta content="/x">"#;
        let once = rewrite_root_relative_paths(html, "docs").into_owned();
        let twice = rewrite_root_relative_paths(&once, "docs").into_owned();
        assert_eq!(once, twice);
        assert!(once.contains(r#"href="/docs/""#));
    }

    #[test]
    fn test_unchanged_html_is_borrowed() {
        let html = "<p>no links</p>";
        assert!(matches!(
            rewrite_root_relative_paths(html, "docs"),
            Cow::Borrowed(_)
        ));
    }
}
