use crate::fetcher::{fetch_document, FetchError, PageSource};
use scraper::{ElementRef, Html, Selector};
use crate::text::FlattenText;
use tracing::debug;

/// Returned by `extract_link` when the subtree holds no usable anchor.
pub const LINK_NOT_FOUND: &str = "404";

lazy_static! {
    static ref LATEST_CHAPTER_SELECTOR: Selector =
        Selector::parse("#latest-chapter-display").unwrap();
    static ref LINK_SELECTOR: Selector = Selector::parse("a").unwrap();
    static ref TITLE_SELECTOR: Selector = Selector::parse(".entry-title").unwrap();
    static ref CONTENT_SELECTOR: Selector = Selector::parse(".entry-content").unwrap();
}

/// One chapter as extracted from its page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chapter {
    pub title: String,
    pub paragraphs: Vec<String>,
    pub source_url: String,
}

/// Fetches the homepage and returns the document it parsed.
/// Use `latest_chapter_nodes` to scope it to the "latest chapter" marker.
pub fn fetch_homepage(source: &dyn PageSource, homepage: &str) -> Result<Html, FetchError> {
    fetch_document(source, homepage)
}

/// Every element carrying the "latest chapter" marker, in document order.
/// Empty when the site's markup changed.
pub fn latest_chapter_nodes(doc: &Html) -> Vec<ElementRef<'_>> {
    doc.select(&LATEST_CHAPTER_SELECTOR).collect()
}

/// Returns the `href` of the first anchor inside `nodes`, or `LINK_NOT_FOUND`.
pub fn extract_link(nodes: &[ElementRef<'_>]) -> String {
    nodes
        .iter()
        .flat_map(|node| node.select(&LINK_SELECTOR))
        .next()
        .and_then(|anchor| anchor.value().attr("href"))
        .map(|href| href.to_string())
        .unwrap_or_else(|| LINK_NOT_FOUND.to_string())
}

/// Runs the Chapter Locator and Link Extractor against the homepage.
pub fn find_latest_chapter_link(
    source: &dyn PageSource,
    homepage: &str,
) -> Result<String, FetchError> {
    let doc = fetch_homepage(source, homepage)?;
    Ok(extract_link(&latest_chapter_nodes(&doc)))
}

/// Fetches a chapter page and pulls out its title and paragraphs.
pub fn extract_chapter(source: &dyn PageSource, url: &str) -> Result<Chapter, FetchError> {
    let doc = fetch_document(source, url)?;
    let chapter = chapter_from_document(&doc, url);
    debug!(
        url,
        title = %chapter.title,
        paragraphs = chapter.paragraphs.len(),
        "extracted chapter"
    );
    for (i, paragraph) in chapter.paragraphs.iter().take(50).enumerate() {
        debug!(i, %paragraph);
    }
    Ok(chapter)
}

/// Title is the text of every title element joined together; paragraphs are
/// the direct child elements of every content container, in document order.
pub fn chapter_from_document(doc: &Html, source_url: &str) -> Chapter {
    let title = doc
        .select(&TITLE_SELECTOR)
        .map(|elem| elem.flattened_text())
        .collect();
    let paragraphs = doc
        .select(&CONTENT_SELECTOR)
        .flat_map(|container| container.children().filter_map(ElementRef::wrap))
        .map(|child| child.flattened_text())
        .collect();

    Chapter {
        title,
        paragraphs,
        source_url: source_url.to_string(),
    }
}

#[cfg(test)]
use crate::fetcher::stub::StubSource;

#[test]
fn test_extract_link() {
    let doc = Html::parse_document(
        r#"<div id="latest-chapter-display"><span>Latest:</span> <a href="https://example.com/ch1">Ch 1</a> <a href="https://example.com/ch0">Ch 0</a></div>"#,
    );
    assert_eq!("https://example.com/ch1", extract_link(&latest_chapter_nodes(&doc)));
}

#[test]
fn test_missing_anchor_returns_sentinel() {
    let doc = Html::parse_document(r#"<div id="latest-chapter-display"><p>Nothing here</p></div>"#);
    assert_eq!(LINK_NOT_FOUND, extract_link(&latest_chapter_nodes(&doc)));

    let doc = Html::parse_document(
        r#"<div id="latest-chapter-display"><a name="top">No href</a></div>"#,
    );
    assert_eq!(LINK_NOT_FOUND, extract_link(&latest_chapter_nodes(&doc)));

    let doc = Html::parse_document(
        r#"<div id="elsewhere"><a href="https://example.com/">x</a></div>"#,
    );
    assert!(latest_chapter_nodes(&doc).is_empty());
    assert_eq!(LINK_NOT_FOUND, extract_link(&[]));
}

#[test]
fn test_paragraph_order_is_preserved() {
    let doc = Html::parse_document(
        r#"<h1 class="entry-title">1.00</h1>
        <div class="entry-content">
            <p>P0</p>
            text between children is ignored
            <p><em>P</em>1</p>
            <hr>
            <p>P2</p>
        </div>"#,
    );
    let chapter = chapter_from_document(&doc, "https://example.com/1-00");
    assert_eq!("1.00", chapter.title);
    assert_eq!(vec!["P0", "P1", "", "P2"], chapter.paragraphs);
    assert_eq!("https://example.com/1-00", chapter.source_url);
}

#[test]
fn test_title_joins_every_title_element() {
    let doc = Html::parse_document(
        r#"<h1 class="entry-title">Chapter </h1><span class="entry-title">1.5</span>"#,
    );
    assert_eq!("Chapter 1.5", chapter_from_document(&doc, "https://example.com/").title);
}

#[test]
fn test_empty_page_is_not_an_error() {
    let doc = Html::parse_document("<html><body><p>unrelated</p></body></html>");
    let chapter = chapter_from_document(&doc, "https://example.com/");
    assert_eq!("", chapter.title);
    assert!(chapter.paragraphs.is_empty());
}

#[test]
fn test_find_latest_chapter_link() {
    let source = StubSource::default().with_page(
        "https://example.com/",
        r#"<div id="latest-chapter-display"><a href="https://example.com/ch1">Ch 1</a></div>"#,
    );
    assert_eq!(
        "https://example.com/ch1",
        find_latest_chapter_link(&source, "https://example.com/").unwrap()
    );
}

#[test]
fn test_extract_chapter_propagates_fetch_errors() {
    let source = StubSource::default();
    let err = extract_chapter(&source, "https://example.com/missing").unwrap_err();
    assert!(matches!(err, FetchError::Status { .. }));
}
