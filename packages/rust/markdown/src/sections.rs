//! HTML to section chunks.
//!
//! Walks the content root of a document in order, splitting it at headings.
//! Each run of blocks between two headings becomes one [`SectionChunk`];
//! tables always get a chunk of their own. Images and embedded objects become
//! [`Asset`]s owned by the chunk they appear in.

use std::sync::LazyLock;

use scraper::node::Node;
use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument, warn};

use html2doc_shared::{Asset, AssetKind, DocumentMetadata, Html2DocError, Result, SectionChunk};

use crate::tables::table_to_markdown;

/// Content containers tried in order before falling back to the whole body.
const CONTENT_ROOTS: &[&str] = &["main", "article", "[role=\"main\"]", "body"];

/// Elements never rendered.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "nav", "svg", "iframe", "head",
];

/// Block elements converted as a whole.
const BLOCK_TAGS: &[&str] = &[
    "p",
    "ul",
    "ol",
    "dl",
    "pre",
    "blockquote",
    "figure",
    "address",
    "details",
];

/// Elements whose text joins the surrounding inline run.
const INLINE_TAGS: &[&str] = &[
    "a", "abbr", "b", "br", "code", "em", "i", "kbd", "label", "mark", "q", "s", "samp",
    "small", "span", "strong", "sub", "sup", "time", "u", "var",
];

static TABLE_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").unwrap());
static ASSET_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("img, object, embed").unwrap());

/// Parse `html` into ordered sections and the assets they own.
///
/// Fails with a parse error when the input is blank or yields neither text
/// nor assets. A block the Markdown converter rejects is skipped.
#[instrument(skip_all, fields(stem = %metadata.stem))]
pub fn parse_sections(
    html: &str,
    metadata: &DocumentMetadata,
) -> Result<(Vec<SectionChunk>, Vec<Asset>)> {
    if html.trim().is_empty() {
        return Err(Html2DocError::parse(format!(
            "{} is empty",
            metadata.input_path.display()
        )));
    }

    let doc = Html::parse_document(html);
    let root = content_root(&doc);

    let mut builder = SectionBuilder::new();
    builder.walk(root);
    builder.end_inline();
    builder.flush();

    if builder.skipped > 0 {
        warn!(skipped = builder.skipped, "skipped blocks that could not be converted");
    }

    let SectionBuilder {
        mut sections,
        assets,
        ..
    } = builder;

    if sections.is_empty() {
        let text = collapse_whitespace(&root.text().collect::<String>());
        if text.is_empty() {
            return Err(Html2DocError::parse(format!(
                "{} contains no text or assets",
                metadata.input_path.display()
            )));
        }
        sections.push(SectionChunk {
            id: "sec-1".into(),
            heading_path: vec![metadata.display_title().to_string()],
            text,
            html_fragment: root.inner_html(),
            order_index: 0,
        });
    }

    debug!(
        sections = sections.len(),
        assets = assets.len(),
        "parsed document"
    );
    Ok((sections, assets))
}

fn content_root(doc: &Html) -> ElementRef<'_> {
    CONTENT_ROOTS
        .iter()
        .filter_map(|s| Selector::parse(s).ok())
        .find_map(|sel| doc.select(&sel).next())
        .unwrap_or_else(|| doc.root_element())
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

struct SectionBuilder {
    converter: htmd::HtmlToMarkdown,
    /// Open headings as `(level, text)`, outermost first.
    headings: Vec<(u8, String)>,
    /// Inline text not yet closed into a block.
    inline: String,
    /// Markdown of the blocks in the current section.
    blocks: Vec<String>,
    /// Source HTML of the blocks in the current section.
    fragments: Vec<String>,
    /// Assets waiting for the current section to get an id.
    pending_assets: Vec<Asset>,
    sections: Vec<SectionChunk>,
    assets: Vec<Asset>,
    asset_counter: usize,
    skipped: usize,
}

impl SectionBuilder {
    fn new() -> Self {
        Self {
            converter: htmd::HtmlToMarkdown::builder()
                .skip_tags(SKIPPED_TAGS.to_vec())
                .build(),
            headings: Vec::new(),
            inline: String::new(),
            blocks: Vec::new(),
            fragments: Vec::new(),
            pending_assets: Vec::new(),
            sections: Vec::new(),
            assets: Vec::new(),
            asset_counter: 0,
            skipped: 0,
        }
    }

    fn walk(&mut self, el: ElementRef) {
        for child in el.children() {
            match child.value() {
                Node::Text(text) => self.push_inline(text),
                Node::Element(_) => {
                    if let Some(child_el) = ElementRef::wrap(child) {
                        self.visit(child_el);
                    }
                }
                _ => {}
            }
        }
    }

    fn visit(&mut self, el: ElementRef) {
        let name = el.value().name();

        if SKIPPED_TAGS.contains(&name) {
            return;
        }
        if INLINE_TAGS.contains(&name) {
            self.collect_assets(&el);
            let text: String = el.text().collect();
            self.push_inline(&text);
            return;
        }

        self.end_inline();

        if let Some(level) = heading_level(name) {
            self.open_heading(level, &el);
        } else if name == "table" {
            self.push_table(&el);
        } else if matches!(name, "img" | "object" | "embed") {
            self.push_asset(&el);
        } else if BLOCK_TAGS.contains(&name) && el.select(&TABLE_SEL).next().is_none() {
            self.push_block(&el);
        } else {
            self.walk(el);
            self.end_inline();
        }
    }

    fn open_heading(&mut self, level: u8, el: &ElementRef) {
        let text = collapse_whitespace(&el.text().collect::<String>());
        if text.is_empty() {
            self.collect_assets(el);
            return;
        }
        self.flush();
        while self.headings.last().is_some_and(|(l, _)| *l >= level) {
            self.headings.pop();
        }
        self.headings.push((level, text));
        self.collect_assets(el);
    }

    fn push_table(&mut self, el: &ElementRef) {
        self.flush();
        self.collect_assets(el);
        let text = table_to_markdown(el);
        if !text.is_empty() {
            self.blocks.push(text);
        }
        self.fragments.push(el.html());
        self.flush();
    }

    fn push_block(&mut self, el: &ElementRef) {
        let html = el.html();
        let markdown = match self.converter.convert(&html) {
            Ok(md) => md,
            Err(e) => {
                debug!(tag = el.value().name(), error = %e, "block conversion failed");
                self.skipped += 1;
                return;
            }
        };
        self.collect_assets(el);
        let markdown = markdown.trim();
        if !markdown.is_empty() {
            self.blocks.push(markdown.to_string());
        }
        self.fragments.push(html);
    }

    fn push_asset(&mut self, el: &ElementRef) {
        if self.record_asset(el) {
            self.fragments.push(el.html());
        }
    }

    fn push_inline(&mut self, text: &str) {
        let text = collapse_whitespace(text);
        if text.is_empty() {
            return;
        }
        if !self.inline.is_empty() {
            self.inline.push(' ');
        }
        self.inline.push_str(&text);
    }

    /// Close the current inline run into a block.
    fn end_inline(&mut self) {
        if self.inline.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.inline);
        self.fragments.push(text.clone());
        self.blocks.push(text);
    }

    fn collect_assets(&mut self, el: &ElementRef) {
        for nested in el.select(&ASSET_SEL) {
            if nested.id() != el.id() {
                self.record_asset(&nested);
            }
        }
    }

    /// Queue an asset for the current section. Returns false when the
    /// element has no source reference.
    fn record_asset(&mut self, el: &ElementRef) -> bool {
        let element = el.value();
        let (kind, source) = match element.name() {
            "img" => (AssetKind::Image, element.attr("src")),
            "object" => (AssetKind::Attachment, element.attr("data")),
            "embed" => (AssetKind::Attachment, element.attr("src")),
            _ => return false,
        };
        let Some(source_ref) = source.map(str::trim).filter(|s| !s.is_empty()) else {
            return false;
        };

        self.asset_counter += 1;
        let alt = element
            .attr("alt")
            .or_else(|| element.attr("title"))
            .map(collapse_whitespace)
            .filter(|a| !a.is_empty());
        self.pending_assets.push(Asset {
            id: format!("asset-{}", self.asset_counter),
            kind,
            source_ref: source_ref.to_string(),
            alt,
            description: None,
            owning_section_id: String::new(),
        });
        true
    }

    /// Close the current section, if it has any content.
    fn flush(&mut self) {
        let text = self.blocks.join("\n\n").trim().to_string();
        if text.is_empty() && self.pending_assets.is_empty() {
            self.blocks.clear();
            self.fragments.clear();
            return;
        }

        let order_index = self.sections.len();
        let id = format!("sec-{}", order_index + 1);
        for mut asset in self.pending_assets.drain(..) {
            asset.owning_section_id = id.clone();
            self.assets.push(asset);
        }
        self.sections.push(SectionChunk {
            id,
            heading_path: self.headings.iter().map(|(_, t)| t.clone()).collect(),
            text,
            html_fragment: self.fragments.join("\n"),
            order_index,
        });
        self.blocks.clear();
        self.fragments.clear();
    }
}

fn heading_level(name: &str) -> Option<u8> {
    let level: u8 = name.strip_prefix('h')?.parse().ok()?;
    (1..=6).contains(&level).then_some(level)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> DocumentMetadata {
        DocumentMetadata::new("/docs/manual.html").with_title("Operator Manual")
    }

    fn parse(html: &str) -> (Vec<SectionChunk>, Vec<Asset>) {
        parse_sections(html, &meta()).expect("parse")
    }

    #[test]
    fn splits_on_headings_with_paths() {
        let (sections, _) = parse(
            "<html><body><main>\
             <h1>Accounts</h1><p>Overview text.</p>\
             <h2>Reset</h2><p>Open settings.</p><ul><li>Click reset</li></ul>\
             <h2>Delete</h2><p>Contact support.</p>\
             <h1>Billing</h1><p>Invoices.</p>\
             </main></body></html>",
        );

        let paths: Vec<Vec<String>> = sections.iter().map(|s| s.heading_path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                vec!["Accounts".to_string()],
                vec!["Accounts".to_string(), "Reset".to_string()],
                vec!["Accounts".to_string(), "Delete".to_string()],
                vec!["Billing".to_string()],
            ]
        );
        assert!(sections[1].text.contains("Open settings."));
        assert!(sections[1].text.contains("Click reset"));
        assert_eq!(sections[3].id, "sec-4");
        assert!(sections.iter().enumerate().all(|(i, s)| s.order_index == i));
    }

    #[test]
    fn preamble_has_empty_heading_path() {
        let (sections, _) = parse("<body><p>Intro.</p><h1>First</h1><p>Body.</p></body>");
        assert!(sections[0].heading_path.is_empty());
        assert_eq!(sections[1].root(), Some("First"));
    }

    #[test]
    fn table_gets_its_own_section() {
        let (sections, _) = parse(
            "<main><h2>Limits</h2><p>See below.</p>\
             <table><tr><th>Plan</th><th>Seats</th></tr><tr><td>Team</td><td>10</td></tr></table>\
             <p>After table.</p></main>",
        );
        assert_eq!(sections.len(), 3);
        assert_eq!(
            sections[1].text,
            "| Plan | Seats |\n| --- | --- |\n| Team | 10 |"
        );
        assert!(sections[1].html_fragment.starts_with("<table"));
        assert_eq!(sections[2].text, "After table.");
        assert!(sections.iter().all(|s| s.heading_path == vec!["Limits".to_string()]));
    }

    #[test]
    fn images_become_assets_of_enclosing_section() {
        let (sections, assets) = parse(
            "<main><h1>Login</h1><p>Enter your name.</p>\
             <img src=\"img/login.png\" alt=\"Login screen\">\
             <h1>Logout</h1><p>Click <img src=\"icon.svg\"> to leave.</p>\
             <object data=\"guide.pdf\"></object></main>",
        );

        assert_eq!(assets.len(), 3);
        assert_eq!(assets[0].id, "asset-1");
        assert_eq!(assets[0].owning_section_id, sections[0].id);
        assert_eq!(assets[0].alt.as_deref(), Some("Login screen"));
        assert!(assets[0].description.is_none());
        assert_eq!(assets[1].owning_section_id, sections[1].id);
        assert_eq!(assets[2].kind, AssetKind::Attachment);
        assert_eq!(assets[2].source_ref, "guide.pdf");
    }

    #[test]
    fn image_inside_heading_belongs_to_that_heading() {
        let (sections, assets) = parse(
            "<main><p>Intro</p><h2><img src=\"icon.png\" alt=\"gear\"> Settings</h2>\
             <p>Open settings.</p></main>",
        );
        assert_eq!(sections.len(), 2);
        assert_eq!(sections[1].heading_path, vec!["Settings"]);
        assert_eq!(assets.len(), 1);
        assert_eq!(assets[0].source_ref, "icon.png");
        assert_eq!(assets[0].owning_section_id, sections[1].id);
    }

    #[test]
    fn image_only_section_is_kept() {
        let (sections, assets) = parse("<main><h1>Diagram</h1><img src=\"d.png\"></main>");
        assert_eq!(sections.len(), 1);
        assert!(sections[0].text.is_empty());
        assert_eq!(assets[0].owning_section_id, "sec-1");
    }

    #[test]
    fn prefers_main_over_chrome() {
        let (sections, _) = parse(
            "<body><nav><a href=\"/\">Home</a></nav>\
             <main><h1>Content</h1><p>Important.</p></main>\
             <footer><p>Copyright</p></footer></body>",
        );
        let all: String = sections.iter().map(|s| s.text.as_str()).collect();
        assert!(all.contains("Important."));
        assert!(!all.contains("Copyright"));
        assert!(!all.contains("Home"));
    }

    #[test]
    fn nested_blocks_are_not_duplicated() {
        let (sections, _) = parse(
            "<main><h1>Steps</h1><div><div><ul><li><p>Nested para</p></li></ul></div></div></main>",
        );
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].text.matches("Nested para").count(), 1);
    }

    #[test]
    fn inline_text_in_containers_is_captured() {
        let (sections, _) = parse("<body><h1>Note</h1><div>Press <b>Save</b> now.</div></body>");
        assert_eq!(sections[0].text, "Press Save now.");
    }

    #[test]
    fn empty_input_is_a_parse_error() {
        let err = parse_sections("   ", &meta()).unwrap_err();
        assert!(matches!(err, Html2DocError::Parse { .. }));
    }

    #[test]
    fn document_without_content_is_a_parse_error() {
        let err = parse_sections("<html><body>   </body></html>", &meta()).unwrap_err();
        assert!(err.to_string().contains("no text or assets"));
    }

    #[test]
    fn heading_only_document_falls_back_to_whole_text() {
        let (sections, _) = parse("<body><h1>Just a title</h1></body>");
        assert_eq!(sections.len(), 1);
        assert_eq!(sections[0].heading_path, vec!["Operator Manual".to_string()]);
        assert_eq!(sections[0].text, "Just a title");
    }

    #[test]
    fn heading_level_parsing() {
        assert_eq!(heading_level("h3"), Some(3));
        assert_eq!(heading_level("h7"), None);
        assert_eq!(heading_level("header"), None);
    }
}
