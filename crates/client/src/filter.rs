use std::collections::BTreeSet;
use std::path::Path;

/// Decides which vault files have their content pushed to the learn
/// endpoint.  Matching is on the file extension only, case-insensitively.
#[derive(Debug, Clone)]
pub struct ContentFilter {
    extensions: BTreeSet<String>,
}

impl ContentFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let extensions = extensions
            .into_iter()
            .map(|ext| ext.as_ref().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
            .collect();
        Self { extensions }
    }

    pub fn accepts(&self, path: &str) -> bool {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| self.extensions.contains(&ext.to_ascii_lowercase()))
    }
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self::new(["md"])
    }
}
