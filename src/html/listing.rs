//! Directory index page → structured entries.
//!
//! Two passes:
//!
//! - **primary** - the `serve-index` layout
//!   (`<a href class="icon icon-*" title><span class="name">`)
//! - **fallback** - any anchor, only used when the primary pass matched nothing.
//!   Covers `npx serve`, IIS, nginx autoindex and similar.
//!
//! Regex iteration cannot fail, so a page that only partly matches yields the
//! entries found so far.

use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::Serialize;

static PRIMARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)<a\s+href="([^"]+)"\s+class="[^"]*icon[^"]*icon-([^"]*)"\s+title="([^"]+)"[^>]*>.*?<span\s+class="name">([^<]+)</span>"#,
    )
    .expect("valid primary listing pattern")
});

static FALLBACK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s+(?:[^>]*?\s+)?href="([^"]+)"[^>]*>(.*?)</a>"#)
        .expect("valid fallback listing pattern")
});

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<.*?>").expect("valid tag pattern"));

/// Entry type as serialized into the listing JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// One row of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub href: String,
    pub title: String,
}

/// Parse an upstream directory index page. Order follows the source HTML.
pub fn parse_directory_listing(html: &str) -> Vec<DirectoryEntry> {
    let entries = parse_primary(html);
    if entries.matched == 0 {
        parse_fallback(html)
    } else {
        entries.items
    }
}

struct PrimaryEntries {
    /// Raw match count, including skipped rows.
    matched: usize,
    items: Vec<DirectoryEntry>,
}

fn parse_primary(html: &str) -> PrimaryEntries {
    let mut matched = 0;
    let mut items = Vec::new();
    for caps in PRIMARY.captures_iter(html) {
        matched += 1;
        let (Some(href), Some(icon), Some(title), Some(name)) =
            (caps.get(1), caps.get(2), caps.get(3), caps.get(4))
        else {
            continue;
        };
        let name = name.as_str();
        if name.starts_with('.') || name.starts_with("Parent Directory") {
            continue;
        }
        let kind = if icon.as_str().contains("directory") {
            EntryKind::Directory
        } else {
            EntryKind::File
        };
        items.push(DirectoryEntry {
            name: name.to_string(),
            kind,
            href: href.as_str().to_string(),
            title: title.as_str().to_string(),
        });
    }
    PrimaryEntries { matched, items }
}

fn parse_fallback(html: &str) -> Vec<DirectoryEntry> {
    let mut items = Vec::new();
    for caps in FALLBACK.captures_iter(html) {
        let (Some(whole), Some(href_raw), Some(inner)) = (caps.get(0), caps.get(1), caps.get(2))
        else {
            continue;
        };
        let href_raw = href_raw.as_str();
        let href = percent_decode_str(href_raw).decode_utf8_lossy();
        let stripped = TAG.replace_all(inner.as_str(), "");
        let mut name = decode_entities(&stripped).trim().to_string();

        if name.is_empty() || name == ".." || name == "." || name.starts_with("Parent Directory") {
            continue;
        }

        let tag = whole.as_str();
        let is_directory = ends_with_separator(&href)
            || ends_with_separator(&name)
            || tag.contains("class=\"directory\"")
            || tag.contains("class='directory'");
        let kind = if is_directory {
            name = name.trim_end_matches(['/', '\\']).to_string();
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        items.push(DirectoryEntry {
            title: name.clone(),
            name,
            kind,
            href: href_raw.to_string(),
        });
    }
    items
}

fn ends_with_separator(value: &str) -> bool {
    value.ends_with('/') || value.ends_with('\\')
}

/// Decodes the named entities index pages emit plus numeric references.
/// Unknown entities are kept verbatim.
fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let candidate = &rest[start..];
        let decoded = candidate
            .find(';')
            .filter(|&end| end <= 10)
            .and_then(|end| decode_entity(&candidate[1..end]).map(|c| (c, end)));
        match decoded {
            Some((c, end)) => {
                out.push(c);
                rest = &candidate[end + 1..];
            }
            None => {
                out.push('&');
                rest = &candidate[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some('\u{a0}'),
        _ => {
            let number = entity.strip_prefix('#')?;
            let code = match number.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_directory_entry() {
        let html = r#"<a href="sub/" class="icon icon-directory" title="sub"><span class="name">sub</span></a>"#;
        let entries = parse_directory_listing(html);
        assert_eq!(
            entries,
            vec![DirectoryEntry {
                name: "sub".into(),
                kind: EntryKind::Directory,
                href: "sub/".into(),
                title: "sub".into(),
            }]
        );
    }

    #[test]
    fn test_primary_skips_parent_and_dotfiles() {
        let html = r#"
<ul>
<li><a href="../" class="icon icon-directory" title=".."><span class="name">..</span></a></li>
<li><a href=".hidden" class="icon icon-file" title=".hidden"><span class="name">.hidden</span></a></li>
<li><a href="../" class="icon icon-directory" title="Parent Directory"><span class="name">Parent Directory</span></a></li>
<li><a href="readme.md" class="icon icon-file icon-text" title="readme.md"><span class="name">readme.md</span></a></li>
</ul>"#;
        let entries = parse_directory_listing(html);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "readme.md");
        assert_eq!(entries[0].kind, EntryKind::File);
    }

    #[test]
    fn test_no_anchors_is_empty() {
        assert!(parse_directory_listing("<html><body>Nothing here</body></html>").is_empty());
        assert!(parse_directory_listing("").is_empty());
    }

    #[test]
    fn test_fallback_generic_anchors() {
        let html = r#"<html><body>
<a href="../">Parent Directory</a>
<a href="docs/">docs/</a>
<a class="file" href="notes%20v2.txt"><span>notes &amp; v2.txt</span></a>
<a href="misc" class='directory'>misc</a>
</body></html>"#;
        let entries = parse_directory_listing(html);
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].name, "docs");
        assert_eq!(entries[0].kind, EntryKind::Directory);
        assert_eq!(entries[0].href, "docs/");

        assert_eq!(entries[1].name, "notes & v2.txt");
        assert_eq!(entries[1].title, "notes & v2.txt");
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].href, "notes%20v2.txt");

        assert_eq!(entries[2].name, "misc");
        assert_eq!(entries[2].kind, EntryKind::Directory);
    }

    #[test]
    fn test_fallback_multiline_anchor() {
        let html = "<a href=\"a.txt\">\n  <b>a.txt</b>\n</a><a href=\"./\">.</a>";
        let entries = parse_directory_listing(html);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a.txt");
    }

    #[test]
    fn test_fallback_not_used_when_primary_matched() {
        let html = r#"<a href="../" class="icon icon-directory" title=".."><span class="name">..</span></a>
<a href="other.txt">other.txt</a>"#;
        assert!(parse_directory_listing(html).is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let entry = DirectoryEntry {
            name: "a".into(),
            kind: EntryKind::File,
            href: "a".into(),
            title: "a".into(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["name"], "a");
    }

    #[test]
    fn test_decode_entities() {
        assert_eq!(decode_entities("a &lt;b&gt; &#39;c&#x27;"), "a <b> 'c'");
        assert_eq!(decode_entities("fish & chips"), "fish & chips");
        assert_eq!(decode_entities("&bogus;"), "&bogus;");
    }
}
