use chrono::{DateTime, Utc};

/// Placeholder for a version that has not been built since startup.
pub const NOT_RECEIVED: &str = "NotRecievedYet";
/// Placeholder for a book link that does not exist yet.
pub const NOT_UPDATED: &str = "Not Updated Yet";

/// What the last successful build produced. Lives only as long as the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildState {
    /// Sanitized title of the last book written.
    pub last_built_title: String,
    /// File name of the last book written, relative to the asset directory.
    pub latest_link_path: String,
    pub built_at: Option<DateTime<Utc>>,
}

impl Default for BuildState {
    fn default() -> Self {
        Self {
            last_built_title: NOT_RECEIVED.to_string(),
            latest_link_path: NOT_UPDATED.to_string(),
            built_at: None,
        }
    }
}

impl BuildState {
    pub fn is_current(&self, stem: &str) -> bool {
        self.last_built_title == stem
    }

    pub fn record(&mut self, stem: &str, file_name: &str) {
        self.last_built_title = stem.to_string();
        self.latest_link_path = file_name.to_string();
        self.built_at = Some(Utc::now());
    }
}

/// Values shown on the status page.
#[derive(Debug, Clone)]
pub struct StatusData {
    pub service: String,
    pub revision: String,
    /// Only refreshed when a client asks for the latest link.
    pub latest_chapter: String,
}

impl StatusData {
    pub fn new(service: String, revision: String) -> Self {
        Self {
            service,
            revision,
            latest_chapter: NOT_RECEIVED.to_string(),
        }
    }

    pub fn has_book(&self) -> bool {
        self.latest_chapter != NOT_RECEIVED && self.latest_chapter != NOT_UPDATED
    }
}

#[test]
fn test_initial_state_uses_sentinels() {
    let state = BuildState::default();
    assert_eq!(NOT_RECEIVED, state.last_built_title);
    assert_eq!(NOT_UPDATED, state.latest_link_path);
    assert!(state.built_at.is_none());
    assert!(!state.is_current("Chapter_1-5"));
}

#[test]
fn test_record_build() {
    let mut state = BuildState::default();
    state.record("Chapter_1-5", "TWIChapter_1-5.epub");
    assert!(state.is_current("Chapter_1-5"));
    assert_eq!("TWIChapter_1-5.epub", state.latest_link_path);
    assert!(state.built_at.is_some());
}

#[test]
fn test_status_has_book() {
    let mut status = StatusData::new("svc".into(), "1".into());
    assert!(!status.has_book());
    status.latest_chapter = NOT_UPDATED.to_string();
    assert!(!status.has_book());
    status.latest_chapter = "TWIChapter_1-5.epub".to_string();
    assert!(status.has_book());
}
