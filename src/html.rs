//! Just enough HTML to find an image in a fetched page.
//!
//! Pages are scanned into a flat list of elements, each remembering the chain
//! of open elements around it, and matched against descendant selectors of the
//! form `tag.class[attr][attr*="value"] img`.

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static RAW_TEXT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>")
        .expect("raw text pattern")
});

static TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<(/?)([A-Za-z][A-Za-z0-9-]*)((?:[^>"']|"[^"]*"|'[^']*')*)>"#)
        .expect("tag pattern")
});

static ATTR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([^\s"'>/=]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'=<>`]+)))?"#)
        .expect("attribute pattern")
});

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param",
    "source", "track", "wbr",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    /// Indices of enclosing elements, outermost first.
    pub ancestors: Vec<usize>,
}

impl Element {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.attr("class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Document {
    elements: Vec<Element>,
}

impl Document {
    pub fn parse(html: &str) -> Self {
        let cleaned = RAW_TEXT.replace_all(html, "");
        let mut elements: Vec<Element> = Vec::new();
        let mut open: Vec<usize> = Vec::new();

        for caps in TAG.captures_iter(&cleaned) {
            let closing = !caps[1].is_empty();
            let tag = caps[2].to_ascii_lowercase();

            if closing {
                if let Some(pos) = open.iter().rposition(|&idx| elements[idx].tag == tag) {
                    open.truncate(pos);
                }
                continue;
            }

            let raw_attrs = caps.get(3).map(|m| m.as_str()).unwrap_or("");
            let self_closing = raw_attrs.trim_end().ends_with('/');
            elements.push(Element {
                attrs: parse_attrs(raw_attrs),
                ancestors: open.clone(),
                tag,
            });
            let idx = elements.len() - 1;
            if !self_closing && !VOID_ELEMENTS.contains(&elements[idx].tag.as_str()) {
                open.push(idx);
            }
        }

        Self { elements }
    }

    pub fn select<'a>(&'a self, selector: &'a Selector) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements
            .iter()
            .filter(move |element| selector.matches(self, element))
    }

    pub fn images(&self) -> impl Iterator<Item = &Element> {
        self.elements.iter().filter(|element| element.tag == "img")
    }
}

fn parse_attrs(raw: &str) -> Vec<(String, String)> {
    ATTR.captures_iter(raw)
        .map(|caps| {
            let name = caps[1].to_ascii_lowercase();
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .or_else(|| caps.get(4))
                .map(|m| html_escape::decode_html_entities(m.as_str()).into_owned())
                .unwrap_or_default();
            (name, value)
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrTest {
    Present(String),
    Equals(String, String),
    Contains(String, String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrTest>,
}

impl Compound {
    fn matches(&self, element: &Element) -> bool {
        if let Some(tag) = &self.tag {
            if &element.tag != tag {
                return false;
            }
        }
        if !self.classes.iter().all(|class| element.has_class(class)) {
            return false;
        }
        self.attrs.iter().all(|test| match test {
            AttrTest::Present(name) => element.attr(name).is_some(),
            AttrTest::Equals(name, value) => element.attr(name) == Some(value.as_str()),
            AttrTest::Contains(name, value) => element
                .attr(name)
                .map(|actual| actual.contains(value.as_str()))
                .unwrap_or(false),
        })
    }
}

/// A chain of compound selectors joined by the descendant combinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    chain: Vec<Compound>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let mut chain = Vec::new();
        for part in split_compounds(source)? {
            chain.push(parse_compound(&part)?);
        }
        if chain.is_empty() {
            bail!("html: empty selector");
        }
        Ok(Self {
            source: source.trim().to_string(),
            chain,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    fn matches(&self, doc: &Document, element: &Element) -> bool {
        let Some((subject, rest)) = self.chain.split_last() else {
            return false;
        };
        if !subject.matches(element) {
            return false;
        }

        let mut pending = rest.iter().rev().peekable();
        for &idx in element.ancestors.iter().rev() {
            match pending.peek() {
                Some(compound) if compound.matches(&doc.elements[idx]) => {
                    pending.next();
                }
                Some(_) => {}
                None => break,
            }
        }
        pending.peek().is_none()
    }
}

fn split_compounds(source: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;
    let mut quote: Option<char> = None;

    for ch in source.chars() {
        match (ch, quote) {
            ('"' | '\'', None) if in_brackets => {
                quote = Some(ch);
                current.push(ch);
            }
            (c, Some(q)) if c == q => {
                quote = None;
                current.push(ch);
            }
            (_, Some(_)) => current.push(ch),
            ('[', None) => {
                in_brackets = true;
                current.push(ch);
            }
            (']', None) => {
                in_brackets = false;
                current.push(ch);
            }
            (c, None) if c.is_whitespace() && !in_brackets => {
                if !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(ch),
        }
    }
    if in_brackets || quote.is_some() {
        bail!("html: unterminated attribute test in {source:?}");
    }
    if !current.is_empty() {
        parts.push(current);
    }
    Ok(parts)
}

fn parse_compound(part: &str) -> Result<Compound> {
    let mut compound = Compound::default();
    let mut rest = part;

    let tag_len = rest
        .find(|c: char| c == '.' || c == '[')
        .unwrap_or(rest.len());
    let tag = &rest[..tag_len];
    if !tag.is_empty() && tag != "*" {
        if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            bail!("html: unsupported selector syntax {part:?}");
        }
        compound.tag = Some(tag.to_ascii_lowercase());
    }
    rest = &rest[tag_len..];

    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(after.len());
            if end == 0 {
                bail!("html: empty class in {part:?}");
            }
            compound.classes.push(after[..end].to_string());
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let end = after
                .find(']')
                .ok_or_else(|| anyhow::anyhow!("html: missing ']' in {part:?}"))?;
            compound.attrs.push(parse_attr_test(&after[..end])?);
            rest = &after[end + 1..];
        } else {
            bail!("html: unsupported selector syntax {part:?}");
        }
    }
    Ok(compound)
}

fn parse_attr_test(body: &str) -> Result<AttrTest> {
    let unquote = |value: &str| {
        value
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .to_string()
    };
    if let Some((name, value)) = body.split_once("*=") {
        return Ok(AttrTest::Contains(name.trim().to_ascii_lowercase(), unquote(value)));
    }
    if let Some((name, value)) = body.split_once('=') {
        return Ok(AttrTest::Equals(name.trim().to_ascii_lowercase(), unquote(value)));
    }
    let name = body.trim();
    if name.is_empty() {
        bail!("html: empty attribute test");
    }
    Ok(AttrTest::Present(name.to_ascii_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"
<html><head><script>var s = "<img src='nope.png'>";</script></head>
<body>
  <div class="comic-wrap" data-feature-name="comics">
    <picture class="item-comic-image">
      <source srcset="a.webp">
      <img src="https://assets.example/strip.gif" alt="Garfield Comic Strip">
    </picture>
  </div>
  <!-- <img src="commented.png"> -->
  <img class="lazyload other" data-src="https://x/lazy.png?a=1&amp;b=2"/>
</body></html>"#;

    #[test]
    fn scans_images_outside_raw_text() {
        let doc = Document::parse(PAGE);
        let srcs: Vec<_> = doc.images().filter_map(|img| img.attr("src")).collect();
        assert_eq!(srcs, vec!["https://assets.example/strip.gif"]);
        assert_eq!(doc.images().count(), 2);
    }

    #[test]
    fn descendant_selector_uses_ancestors() {
        let doc = Document::parse(PAGE);
        let selector = Selector::parse("picture.item-comic-image img").unwrap();
        let hits: Vec<_> = doc.select(&selector).collect();
        assert_eq!(hits.len(), 1);

        let nested = Selector::parse(r#"div[data-feature-name="comics"] picture img"#).unwrap();
        assert_eq!(doc.select(&nested).count(), 1);

        let wrong = Selector::parse(".comic__image img").unwrap();
        assert_eq!(doc.select(&wrong).count(), 0);
    }

    #[test]
    fn attribute_tests_and_entities() {
        let doc = Document::parse(PAGE);
        let lazy = Selector::parse("img.lazyload").unwrap();
        let hit = doc.select(&lazy).next().unwrap();
        assert_eq!(hit.attr("data-src"), Some("https://x/lazy.png?a=1&b=2"));

        let alt = Selector::parse(r#"img[alt*="Garfield"]"#).unwrap();
        assert_eq!(doc.select(&alt).count(), 1);
        let srcset = Selector::parse("img.lazyload[data-srcset]").unwrap();
        assert_eq!(doc.select(&srcset).count(), 0);
    }

    #[test]
    fn rejects_broken_selectors() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("img[alt").is_err());
        assert!(Selector::parse("img > a").is_err());
    }
}
