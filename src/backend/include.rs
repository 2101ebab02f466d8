//! Include resolution for backend compilers.

use std::path::{Path, PathBuf};

use tracing::trace;

use crate::job::IncludeFile;

/// Resolves `#include` names for a compiler.
pub trait IncludeResolver {
    /// Return the contents of `name`, or `None` if it cannot be found.
    fn open(&self, name: &str) -> Option<String>;
}

/// Include callback for one job: embedded includes first, then the search path.
#[derive(Debug, Clone, Copy)]
pub struct IncludeEnvironment<'a> {
    embedded: &'a [IncludeFile],
    search_path: Option<&'a Path>,
}

impl<'a> IncludeEnvironment<'a> {
    pub fn new(embedded: &'a [IncludeFile], search_path: Option<&'a Path>) -> Self {
        Self {
            embedded,
            search_path,
        }
    }

    fn disk_path(&self, name: &str) -> Option<PathBuf> {
        self.search_path.map(|dir| dir.join(name))
    }
}

impl IncludeResolver for IncludeEnvironment<'_> {
    fn open(&self, name: &str) -> Option<String> {
        if let Some(include) = self.embedded.iter().find(|i| i.name == name) {
            trace!(include = name, "resolved embedded include");
            return Some(include.contents.clone());
        }

        let path = self.disk_path(name)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                trace!(include = name, path = %path.display(), "resolved include from disk");
                Some(contents)
            }
            Err(_) => None,
        }
    }
}
