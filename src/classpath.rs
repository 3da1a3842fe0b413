//! The run's class table: application classes parsed in full plus library
//! classes parsed for structure only.
//!
//! Libraries are loaded in command-line order and the last archive to define
//! a name wins. Application classes are inserted after all libraries, so they
//! always shadow a library class of the same name.

use anyhow::{Context, Result};
use memmap2::Mmap;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::classfile::{ClassDocument, ParseMode, parse};
use crate::scan::library_archives;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Library,
    Application,
}

#[derive(Debug, Clone)]
pub struct ClassPathEntry {
    pub document: ClassDocument,
    pub origin: Origin,
}

#[derive(Debug, Default)]
pub struct ClassPath {
    entries: HashMap<String, ClassPathEntry>,
}

impl ClassPath {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts under the document's own name, returning the entry it shadowed.
    pub fn insert(&mut self, document: ClassDocument, origin: Origin) -> Option<ClassPathEntry> {
        self.entries
            .insert(document.name.clone(), ClassPathEntry { document, origin })
    }

    pub fn get(&self, name: &str) -> Option<&ClassPathEntry> {
        self.entries.get(name)
    }

    pub fn document(&self, name: &str) -> Option<&ClassDocument> {
        self.entries.get(name).map(|e| &e.document)
    }

    pub fn document_mut(&mut self, name: &str) -> Option<&mut ClassDocument> {
        self.entries.get_mut(name).map(|e| &mut e.document)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ClassPathEntry)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    pub fn count(&self, origin: Origin) -> usize {
        self.entries.values().filter(|e| e.origin == origin).count()
    }

    /// Application class names in sorted order.
    pub fn application_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.origin == Origin::Application)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn application_mut(&mut self) -> impl Iterator<Item = &mut ClassDocument> {
        self.entries
            .values_mut()
            .filter(|e| e.origin == Origin::Application)
            .map(|e| &mut e.document)
    }

    /// Re-keys every entry by its document's current name. Whole-program
    /// passes may rename documents in place.
    pub fn reindex(&mut self) {
        let entries = std::mem::take(&mut self.entries);
        let mut renamed = 0usize;
        for (key, entry) in entries {
            if key != entry.document.name {
                renamed += 1;
            }
            if let Some(previous) = self.entries.insert(entry.document.name.clone(), entry) {
                warn!(class = %previous.document.name, "two classes share a name after renaming; keeping one");
            }
        }
        if renamed > 0 {
            debug!(renamed, "classpath re-keyed");
        }
    }

    /// Removes and returns the application documents, sorted by name.
    pub fn take_application(&mut self) -> Vec<ClassDocument> {
        let names = self.application_names();
        names
            .iter()
            .filter_map(|name| self.entries.remove(name))
            .map(|e| e.document)
            .collect()
    }

    /// Loads every class of one library archive, structure only. Classes
    /// that fail to parse are skipped.
    pub fn load_library(&mut self, path: &Path) -> Result<usize> {
        let file = File::open(path).with_context(|| format!("Failed to open library: {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).with_context(|| format!("Failed to mmap library: {}", path.display()))? };
        let mut archive = ZipArchive::new(Cursor::new(&mmap[..]))
            .with_context(|| format!("Failed to read zip structure: {}", path.display()))?;

        let mut loaded = 0usize;
        let mut buf = Vec::new();
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() || !entry.name().ends_with(".class") {
                continue;
            }
            buf.clear();
            entry
                .read_to_end(&mut buf)
                .with_context(|| format!("Failed to read {} in {}", entry.name(), path.display()))?;
            match parse(&buf, ParseMode::StructureOnly) {
                Ok(document) => {
                    self.insert(document, Origin::Library);
                    loaded += 1;
                }
                Err(e) => debug!(entry = entry.name(), error = %e, "skipping malformed library class"),
            }
        }
        Ok(loaded)
    }

    /// Loads all library locations in order. Unreadable archives are logged
    /// and skipped.
    pub fn load_libraries(&mut self, locations: &[PathBuf]) -> usize {
        let mut total = 0usize;
        for archive in library_archives(locations) {
            match self.load_library(&archive) {
                Ok(count) => {
                    debug!(path = %archive.display(), classes = count, "library loaded");
                    total += count;
                }
                Err(e) => warn!(path = %archive.display(), error = %format!("{e:#}"), "skipping unreadable library"),
            }
        }
        if total > 0 {
            info!(classes = total, "library classes loaded");
        }
        total
    }
}
