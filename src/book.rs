use epub_builder::{EpubBuilder, EpubContent, EpubVersion, ReferenceType, ZipLibrary};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Prefix identifying the series, put in front of every book title and file name.
pub const SERIES_TAG: &str = "TWI";
pub const AUTHOR: &str = "Pirateaba";

#[derive(Debug, thiserror::Error)]
pub enum BookError {
    #[error("Could not assemble e-book: {0}")]
    Epub(String),
    #[error("Could not write {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

fn epub_err<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> BookError + '_ {
    move |err| BookError::Epub(format!("{context}: {err}"))
}

/// A chapter title made safe for metadata and file names.
///
/// Dots become dashes first ("Ch. 1.2" would otherwise collide with the
/// extension); spaces become underscores only in `stem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterTitle {
    normalized: String,
    stem: String,
}

impl ChapterTitle {
    pub fn new(raw: &str) -> Self {
        let normalized = raw.trim().replace('.', "-").replace(['/', '\\'], "-");
        let stem = normalized.replace(' ', "_");
        Self { normalized, stem }
    }

    /// Title with dots replaced.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Title with dots and spaces replaced, used for the file name and as the
    /// recorded version of the last build.
    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn book_title(&self) -> String {
        format!("{}{}", SERIES_TAG, self.normalized)
    }

    pub fn file_name(&self) -> String {
        format!("{}{}.epub", SERIES_TAG, self.stem)
    }
}

/// Wraps every paragraph in `<p>` and concatenates them in order.
/// Angle brackets in the text become square brackets so nothing in a paragraph
/// can be read as markup.
pub fn section_body<S: AsRef<str>>(paragraphs: &[S]) -> String {
    let capacity = paragraphs.iter().map(|p| p.as_ref().len() + 8).sum();
    let mut body = String::with_capacity(capacity);
    for paragraph in paragraphs {
        let bracketed = paragraph.as_ref().replace('<', "[").replace('>', "]");
        body.push_str("<p>");
        body.push_str(&html_escape::encode_text(&bracketed));
        body.push_str("</p>\n");
    }
    body
}

/// An EPUB being put together in memory.
pub struct Ebook {
    builder: EpubBuilder<ZipLibrary>,
    title: String,
    sections: usize,
}

impl Ebook {
    pub fn new(title: &str, author: &str) -> Result<Self, BookError> {
        let library = ZipLibrary::new().map_err(epub_err("Could not create ZipLibrary"))?;
        let mut builder =
            EpubBuilder::new(library).map_err(epub_err("Could not create EpubBuilder"))?;
        builder.epub_version(EpubVersion::V30);
        builder
            .metadata("author", author)
            .map_err(epub_err("Could not set author metadata"))?
            .metadata("title", title)
            .map_err(epub_err("Could not set title metadata"))?
            .metadata("lang", "en")
            .map_err(epub_err("Could not set language metadata"))?
            .metadata("generator", env!("CARGO_PKG_NAME"))
            .map_err(epub_err("Could not set generator metadata"))?;

        Ok(Self {
            builder,
            title: title.to_string(),
            sections: 0,
        })
    }

    /// Adds `body` (XHTML body markup) as the next section of the book.
    pub fn add_section(&mut self, body: &str) -> Result<(), BookError> {
        self.sections += 1;
        let escaped_title = html_escape::encode_text(&self.title);
        let content = format!(
            "<?xml version='1.0' encoding='utf-8' ?>\
             <html xmlns='http://www.w3.org/1999/xhtml'><head><title>{escaped_title}</title>\
             <meta http-equiv='Content-Type' content='text/html; charset=utf-8' />\n\
             </head><body>\n{body}</body></html>"
        );

        // nav.xhtml would otherwise carry an unescaped ampersand.
        let toc_title = self.title.replace('&', "﹠");
        self.builder
            .add_content(
                EpubContent::new(format!("section_{}.xhtml", self.sections), content.as_bytes())
                    .title(toc_title)
                    .reftype(ReferenceType::Text),
            )
            .map_err(epub_err("Could not add section"))?;
        Ok(())
    }

    /// Generates the book next to `path` and moves it into place once complete,
    /// so a reader of `path` never sees a partial file.
    pub fn write(&mut self, path: &Path) -> Result<(), BookError> {
        let partial = path.with_extension("epub.part");
        let result = self.write_to(&partial).and_then(|()| {
            fs::rename(&partial, path).map_err(|source| BookError::Io {
                path: path.to_path_buf(),
                source,
            })
        });
        if result.is_err() {
            let _ = fs::remove_file(&partial);
        }
        result
    }

    fn write_to(&mut self, path: &Path) -> Result<(), BookError> {
        let io_err = |source| BookError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::create(path).map_err(io_err)?;
        self.builder
            .generate(&mut file)
            .map_err(epub_err("Could not generate ebook"))?;
        file.flush().map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
use tempfile::tempdir;

#[test]
fn test_title_normalization_order() {
    let title = ChapterTitle::new("Chapter 1.5");
    assert_eq!("Chapter 1-5", title.normalized());
    assert_eq!("Chapter_1-5", title.stem());
    assert_eq!("TWIChapter 1-5", title.book_title());
    assert_eq!("TWIChapter_1-5.epub", title.file_name());

    let title = ChapterTitle::new("  Interlude – Ch. 9.10 (Pt. 2)\n");
    assert_eq!("Interlude – Ch- 9-10 (Pt- 2)", title.normalized());
    assert_eq!("Interlude_–_Ch-_9-10_(Pt-_2)", title.stem());
}

#[test]
fn test_title_cannot_escape_directory() {
    let title = ChapterTitle::new("../etc/passwd");
    assert_eq!("TWI---etc-passwd.epub", title.file_name());
}

#[test]
fn test_paragraph_escaping() {
    let body = section_body(&["<script>alert(1)</script>", "Tom & Jerry", "plain"]);
    assert!(body.contains("[script]alert(1)[/script]"));
    assert!(body.contains("Tom &amp; Jerry"));

    let stripped = body.replace("<p>", "").replace("</p>", "");
    assert!(!stripped.contains('<'));
    assert!(!stripped.contains('>'));
}

#[test]
fn test_section_body_keeps_order() {
    let body = section_body(&["Hello".to_string(), "World <3".to_string()]);
    assert_eq!("<p>Hello</p>\n<p>World [3</p>\n", body);
}

#[test]
fn test_section_body_empty() {
    let paragraphs: [&str; 0] = [];
    assert_eq!("", section_body(&paragraphs));
}

#[test]
fn test_write_ebook() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("TWIChapter_1-5.epub");

    let mut book = Ebook::new("TWIChapter 1-5", AUTHOR).unwrap();
    book.add_section(&section_body(&["Hello", "World <3"])).unwrap();
    book.write(&path).unwrap();

    let bytes = fs::read(&path).unwrap();
    // EPUB files are zip archives.
    assert_eq!(b"PK", &bytes[..2]);
    assert!(!path.with_extension("epub.part").exists());
}

#[test]
fn test_write_into_missing_directory_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("missing").join("book.epub");

    let mut book = Ebook::new("TWIbook", AUTHOR).unwrap();
    book.add_section("<p>x</p>").unwrap();
    let err = book.write(&path).unwrap_err();
    assert!(matches!(err, BookError::Io { .. }));
}
