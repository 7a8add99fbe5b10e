use crate::book::{section_body, BookError, ChapterTitle, Ebook, AUTHOR};
use crate::fetcher::{FetchError, PageSource};
use crate::scrape::{extract_chapter, find_latest_chapter_link, LINK_NOT_FOUND};
use crate::state::BuildState;
use reqwest::Url;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("No latest chapter link found on {0}")]
    LinkNotFound(Url),
    #[error(transparent)]
    Book(#[from] BookError),
    #[error("Another build is already in progress")]
    Busy,
}

impl BuildError {
    /// Pipeline stage the error came from, for logs.
    pub fn stage(&self) -> &'static str {
        match self {
            BuildError::Fetch(_) => "fetch",
            BuildError::LinkNotFound(_) => "locate",
            BuildError::Book(_) => "assemble",
            BuildError::Busy => "lock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    /// A new book was written to the asset directory.
    Built { file_name: String },
    /// The chapter matches the last book built; nothing was written.
    Unchanged { title: String },
}

/// Turns chapters into books in the asset directory and remembers the last one.
pub struct Publisher {
    source: Arc<dyn PageSource>,
    homepage: Url,
    assets_dir: PathBuf,
    state: Mutex<BuildState>,
    /// Held for the whole of a build so only one runs at a time.
    build_lock: Mutex<()>,
}

impl Publisher {
    pub fn new(source: Arc<dyn PageSource>, homepage: Url, assets_dir: PathBuf) -> Self {
        Self {
            source,
            homepage,
            assets_dir,
            state: Mutex::new(BuildState::default()),
            build_lock: Mutex::new(()),
        }
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    pub fn state(&self) -> BuildState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, BuildState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock_build(&self) -> Result<MutexGuard<'_, ()>, BuildError> {
        match self.build_lock.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(poisoned)) => Ok(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => Err(BuildError::Busy),
        }
    }

    /// Finds the latest chapter on the homepage and builds it.
    pub fn build_latest(&self) -> Result<BuildOutcome, BuildError> {
        let _guard = self.try_lock_build()?;

        let href = find_latest_chapter_link(&*self.source, self.homepage.as_str())?;
        if href == LINK_NOT_FOUND {
            return Err(BuildError::LinkNotFound(self.homepage.clone()));
        }
        let chapter_url = self.homepage.join(&href).map_err(|err| {
            warn!(%href, "latest chapter link is not a url: {err}");
            BuildError::LinkNotFound(self.homepage.clone())
        })?;
        if !matches!(chapter_url.scheme(), "http" | "https") {
            warn!(url = %chapter_url, "latest chapter link is not a web page");
            return Err(BuildError::LinkNotFound(self.homepage.clone()));
        }
        info!(url = %chapter_url, "found latest chapter");

        self.assemble(chapter_url.as_str())
    }

    /// Builds the chapter at `chapter_url`.
    pub fn build_from(&self, chapter_url: &str) -> Result<BuildOutcome, BuildError> {
        let _guard = self.try_lock_build()?;
        self.assemble(chapter_url)
    }

    /// Caller must hold the build lock.
    fn assemble(&self, chapter_url: &str) -> Result<BuildOutcome, BuildError> {
        let chapter = extract_chapter(&*self.source, chapter_url)?;
        let title = ChapterTitle::new(&chapter.title);

        if self.lock_state().is_current(title.stem()) {
            info!(
                url = %chapter.source_url,
                title = title.normalized(),
                "Same version of book, skipping"
            );
            return Ok(BuildOutcome::Unchanged {
                title: title.stem().to_string(),
            });
        }
        if chapter.paragraphs.is_empty() {
            warn!(url = %chapter.source_url, "chapter has no paragraphs, building an empty book");
        }

        let mut book = Ebook::new(&title.book_title(), AUTHOR)?;
        book.add_section(&section_body(&chapter.paragraphs))?;

        let file_name = title.file_name();
        book.write(&self.assets_dir.join(&file_name))?;

        self.lock_state().record(title.stem(), &file_name);
        info!(url = %chapter.source_url, file = %file_name, "built book");
        Ok(BuildOutcome::Built { file_name })
    }
}
