//! Cheap path predicates consulted before any hashing or extraction

use std::collections::HashSet;
use std::path::Path;

use crate::extract::{ExtractorRegistry, extension_of};

/// Office lock files (`~$report.docx`), macOS resource forks (`._notes.txt`)
/// and editor scratch files (`*.tmp`)
pub fn is_temporary_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    name.starts_with("~$") || name.starts_with("._") || name.to_lowercase().ends_with(".tmp")
}

pub fn is_supported_file(path: &Path, supported_extensions: &HashSet<String>) -> bool {
    extension_of(path).is_some_and(|ext| supported_extensions.contains(&ext))
}

/// Extension allow-list plus the temporary-file rule
#[derive(Debug, Clone)]
pub struct FileFilter {
    supported_extensions: HashSet<String>,
}

impl FileFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            supported_extensions: extensions
                .into_iter()
                .map(|ext| ext.as_ref().trim_start_matches('.').to_lowercase())
                .collect(),
        }
    }

    pub fn from_registry(registry: &ExtractorRegistry) -> Self {
        Self::new(registry.extensions())
    }

    pub fn is_supported_file(&self, path: &Path) -> bool {
        is_supported_file(path, &self.supported_extensions)
    }

    /// True for files worth handing to the debouncer. Paths that are not
    /// valid UTF-8 cannot be keyed in the change store and are left out.
    pub fn is_candidate(&self, path: &Path) -> bool {
        path.to_str().is_some() && !is_temporary_file(path) && self.is_supported_file(path)
    }

    pub fn supported_extensions(&self) -> &HashSet<String> {
        &self.supported_extensions
    }
}
