use ego_tree::iter::{Edge, Traverse};
use scraper::node::Element;
use scraper::{ElementRef, Node};
use std::borrow::Cow;
#[cfg(test)]
use scraper::{Html, Selector};

/// Elements whose text never belongs to the chapter.
const SKIPPED_ELEMENTS: [&str; 2] = ["script", "style"];

/// Helper trait that will allow us to call `flattened_text` on `ElementRef`.
pub(crate) trait FlattenText<'a> {
    /// Text content of the element and all its descendants, tags stripped.
    fn flattened_text(&self) -> String;

    fn text_pieces(&self) -> TextPieces<'a>;
}

impl<'a> FlattenText<'a> for ElementRef<'a> {
    fn flattened_text(&self) -> String {
        self.text_pieces().collect()
    }

    fn text_pieces(&self) -> TextPieces<'a> {
        TextPieces {
            inner: self.traverse(),
            skip_depth: 0,
        }
    }
}

/// Iterator over descendant text nodes.
///
/// Cloudflare replaces anything resembling an e-mail address with an element
/// carrying the XOR-encoded address in `data-cfemail` and `[email protected]`
/// as its text. Such elements yield the decoded address instead of their text.
pub struct TextPieces<'a> {
    inner: Traverse<'a, Node>,
    /// How deeply we are inside an element whose text is not yielded.
    skip_depth: usize,
}

impl<'a> Iterator for TextPieces<'a> {
    type Item = Cow<'a, str>;

    fn next(&mut self) -> Option<Self::Item> {
        for edge in &mut self.inner {
            match edge {
                Edge::Open(node) => match node.value() {
                    Node::Element(ref element) => {
                        if self.skip_depth > 0 {
                            self.skip_depth += 1;
                        } else if SKIPPED_ELEMENTS.contains(&element.name()) {
                            self.skip_depth = 1;
                        } else if let Some(email) = cloudflare_email(element) {
                            self.skip_depth = 1;
                            return Some(Cow::Owned(email));
                        }
                    }
                    Node::Text(ref text) => {
                        if self.skip_depth == 0 {
                            return Some(Cow::Borrowed(&**text));
                        }
                    }
                    _ => {}
                },
                Edge::Close(node) => {
                    if let (Node::Element(_), true) = (node.value(), self.skip_depth > 0) {
                        self.skip_depth -= 1;
                    }
                }
            }
        }
        None
    }
}

/// Decodes the address hidden in a Cloudflare `data-cfemail` attribute.
/// The first byte is the XOR key for the rest.
fn cloudflare_email(element: &Element) -> Option<String> {
    let data = element.attr("data-cfemail")?;
    let bytes = hex::decode(data).ok()?;
    let (key, encoded) = bytes.split_first()?;
    if encoded.is_empty() {
        return None;
    }
    let decoded = encoded.iter().map(|byte| byte ^ key).collect::<Vec<u8>>();
    String::from_utf8(decoded).ok()
}

#[test]
fn test_flattened_text_strips_tags() {
    let doc = Html::parse_fragment(
        "<p>hullo <a href='prev'>Prev <strong>chap</strong></a> <em>foo</em></p>",
    );
    let p = doc.select(&Selector::parse("p").unwrap()).next().unwrap();
    assert_eq!("hullo Prev chap foo", p.flattened_text());
}

#[test]
fn test_flattened_text_skips_scripts() {
    let doc = Html::parse_fragment(
        "<div>before<script>var x = 1;</script><style>p {}</style> after</div>",
    );
    let div = doc.select(&Selector::parse("div").unwrap()).next().unwrap();
    assert_eq!("before after", div.flattened_text());
}

#[test]
fn test_cloudflare_email_is_decoded() {
    // "a@b.c" XOR 0x42, prefixed by the key.
    let encoded: String = std::iter::once(0x42u8)
        .chain("a@b.c".bytes().map(|byte| byte ^ 0x42))
        .map(|byte| format!("{:02x}", byte))
        .collect();
    let html = format!(
        r#"<p>Write to <a href="/cdn-cgi/l/email-protection" class="__cf_email__" data-cfemail="{}">[email&#160;protected]</a> now</p>"#,
        encoded
    );
    let doc = Html::parse_fragment(&html);
    let p = doc.select(&Selector::parse("p").unwrap()).next().unwrap();
    assert_eq!("Write to a@b.c now", p.flattened_text());
}

#[test]
fn test_broken_cloudflare_data_keeps_text() {
    let doc = Html::parse_fragment(r#"<p><span data-cfemail="zz">[email protected]</span></p>"#);
    let p = doc.select(&Selector::parse("p").unwrap()).next().unwrap();
    assert_eq!("[email protected]", p.flattened_text());
}
