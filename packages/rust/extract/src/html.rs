//! HTML-to-text conversion and structured-markup harvesting.
//!
//! Pages are flattened to line-oriented plain text: block elements start a
//! new line, inline elements stay on the line they belong to. Contact data
//! frequently lives in headers and footers, so only non-content elements
//! (scripts, styles, templates) are dropped.

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};

/// Elements whose subtree never contributes text.
const SKIPPED: &[&str] = &["script", "style", "noscript", "template", "svg", "iframe", "head"];

/// Elements rendered on their own line.
const BLOCK: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "footer",
    "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol",
    "p", "pre", "section", "table", "tbody", "td", "th", "thead", "tr", "ul",
];

/// Values found in machine-readable markup rather than in visible text.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StructuredMarkup {
    /// `tel:` link targets and `itemprop="telephone"` values.
    pub phones: Vec<String>,
    /// `mailto:` link targets and `itemprop="email"` values.
    pub emails: Vec<String>,
    /// `itemprop="postalCode"` values.
    pub postal_codes: Vec<String>,
}

impl StructuredMarkup {
    pub fn is_empty(&self) -> bool {
        self.phones.is_empty() && self.emails.is_empty() && self.postal_codes.is_empty()
    }
}

/// Flatten an HTML document to plain text, one block per line.
pub fn page_text(html: &str) -> String {
    let doc = Html::parse_document(html);
    let mut raw = String::with_capacity(html.len() / 4);
    collect_text(doc.root_element(), &mut raw);

    raw.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(&text.text),
            Node::Element(_) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = child_el.value().name();
                if SKIPPED.contains(&name) {
                    continue;
                }
                let block = BLOCK.contains(&name);
                if block {
                    out.push('\n');
                } else {
                    out.push(' ');
                }
                collect_text(child_el, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

/// Harvest `tel:`/`mailto:` links and schema.org item properties.
pub fn structured_markup(html: &str) -> StructuredMarkup {
    let doc = Html::parse_document(html);
    let mut markup = StructuredMarkup::default();

    if let Ok(sel) = Selector::parse("a[href]") {
        for link in doc.select(&sel) {
            let Some(href) = link.value().attr("href") else {
                continue;
            };
            let href = href.trim();
            if let Some(number) = strip_scheme(href, "tel:") {
                push_unique(&mut markup.phones, number);
            } else if let Some(address) = strip_scheme(href, "mailto:") {
                let address = address.split('?').next().unwrap_or_default();
                push_unique(&mut markup.emails, address);
            }
        }
    }

    for (prop, target) in [
        ("telephone", &mut markup.phones),
        ("email", &mut markup.emails),
        ("postalCode", &mut markup.postal_codes),
    ] {
        let Ok(sel) = Selector::parse(&format!("[itemprop=\"{prop}\"]")) else {
            continue;
        };
        for el in doc.select(&sel) {
            let value = el
                .value()
                .attr("content")
                .map(str::to_string)
                .unwrap_or_else(|| el.text().collect::<String>());
            push_unique(target, value.trim());
        }
    }

    markup
}

/// Page `<title>`, if any.
pub fn page_title(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let sel = Selector::parse("title").ok()?;
    let title = doc.select(&sel).next()?.text().collect::<String>();
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    (!title.is_empty()).then_some(title)
}

fn strip_scheme<'a>(href: &'a str, scheme: &str) -> Option<&'a str> {
    if href.len() >= scheme.len() && href[..scheme.len()].eq_ignore_ascii_case(scheme) {
        Some(href[scheme.len()..].trim())
    } else {
        None
    }
}

fn push_unique(list: &mut Vec<String>, value: &str) {
    if !value.is_empty() && !list.iter().any(|v| v == value) {
        list.push(value.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_text_keeps_blocks_on_lines() {
        let html = r#"<html><head><title>Dr. Jane</title><style>p{}</style></head><body>
            <nav><a href="/">Início</a></nav>
            <p>Rua <b>Augusta</b>, 100</p>
            <script>var x = "Rua Falsa, 1";</script>
            <footer><p>Tel: (11) 3333-4444</p></footer>
        </body></html>"#;
        let text = page_text(html);
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines.contains(&"Rua Augusta, 100"));
        assert!(lines.contains(&"Início"));
        assert!(lines.contains(&"Tel: (11) 3333-4444"));
        assert!(!text.contains("Falsa"));
        assert!(!text.contains("Dr. Jane"));
    }

    #[test]
    fn structured_markup_reads_links_and_itemprops() {
        let html = r#"<body>
            <a href="tel:+55-11-3333-4444">Ligue</a>
            <a href="TEL:+55-11-3333-4444">Ligue de novo</a>
            <a href="mailto:contato@clinica.com.br?subject=Oi">Email</a>
            <span itemprop="postalCode">01310-200</span>
            <meta itemprop="telephone" content="(11) 98888-7777">
        </body>"#;
        let markup = structured_markup(html);
        assert_eq!(markup.phones, vec!["+55-11-3333-4444", "(11) 98888-7777"]);
        assert_eq!(markup.emails, vec!["contato@clinica.com.br"]);
        assert_eq!(markup.postal_codes, vec!["01310-200"]);
        assert!(!markup.is_empty());
    }

    #[test]
    fn page_title_is_collapsed() {
        assert_eq!(
            page_title("<html><head><title>  Clínica \n Central </title></head></html>"),
            Some("Clínica Central".to_string())
        );
        assert_eq!(page_title("<p>no title</p>"), None);
    }
}
