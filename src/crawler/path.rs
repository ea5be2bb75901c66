use std::fmt;

/// Ordered breadcrumb of where in the site the crawler currently is.
///
/// Rendered as slash-joined segments, e.g. `Home/Acts in force/vic-acts`,
/// optionally suffixed with `Page/N`. The rendered string is stored with each
/// record and its leading segments scope the duplicate check, so two journeys
/// through different sections never dedup against each other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationPath {
    segments: Vec<String>,
}

impl NavigationPath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns a new path with one segment appended. The original is
    /// untouched, so loop iterations cannot leak segments into each other.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    pub fn render(&self) -> String {
        self.segments.join("/")
    }

    /// Renders the path with the current page number appended.
    pub fn render_with_page(&self, page: u32) -> String {
        format!("{}/Page/{}", self.render(), page)
    }

    /// The first `depth` segments, joined. Used as the LIKE prefix when
    /// looking up already-collected records for this part of the site.
    pub fn prefix(&self, depth: usize) -> String {
        self.segments
            .iter()
            .take(depth)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("/")
    }
}

impl fmt::Display for NavigationPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
