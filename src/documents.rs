//! Document store: the ingestion boundary of the knowledge base.
//!
//! A [`DocumentSource`] lists the documents currently available and hands
//! over their plain text. Two implementations are provided:
//!
//! - [`DirectoryDocuments`] walks a directory with `walkdir`, filters by
//!   include/exclude globs, and extracts text with [`crate::extract`].
//! - [`MemoryDocuments`] holds text in memory for embedding the core in
//!   other programs and for tests.
//!
//! Documents are identified by their normalized name (see
//! [`normalize_name`]): the trimmed file basename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::DocumentsConfig;
use crate::error::{KbError, KbResult};
use crate::extract;

/// Plain text of one document as handed to the indexer.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedDocument {
    pub name: String,
    pub source_path: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Names of all documents currently present, sorted.
    async fn list(&self) -> KbResult<Vec<String>>;

    /// Load the plain text of one document.
    async fn load(&self, name: &str) -> KbResult<LoadedDocument>;
}

/// Normalize a document name to its trimmed basename.
///
/// Both `/` and `\` are treated as separators so names uploaded from any
/// platform map to the same key.
pub fn normalize_name(name: &str) -> KbResult<String> {
    let base = name
        .trim()
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if base.is_empty() {
        return Err(KbError::EmptyInput);
    }
    Ok(base.to_string())
}

fn build_globset(patterns: &[String]) -> KbResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| KbError::Source(format!("invalid glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| KbError::Source(e.to_string()))
}

// ============ Directory ============

/// Documents stored as files under a root directory.
///
/// The name-to-path map from the latest walk is kept, so a `list` followed
/// by one `load` per document walks the root once. `load` only walks again
/// when the name is unknown or its file has gone away.
pub struct DirectoryDocuments {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    resolved: RwLock<BTreeMap<String, PathBuf>>,
    #[cfg(test)]
    walks: std::sync::atomic::AtomicUsize,
}

impl DirectoryDocuments {
    pub fn new(config: &DocumentsConfig) -> KbResult<Self> {
        let mut excludes = vec!["**/.git/**".to_string(), "**/.*".to_string()];
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            resolved: RwLock::new(BTreeMap::new()),
            #[cfg(test)]
            walks: std::sync::atomic::AtomicUsize::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map of normalized name to path for every matching file. When two
    /// files share a basename the first one in walk order wins.
    fn scan(&self) -> KbResult<BTreeMap<String, PathBuf>> {
        #[cfg(test)]
        self.walks.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let mut found = BTreeMap::new();
        if !self.root.exists() {
            return Ok(found);
        }

        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| KbError::Source(e.to_string()))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(&self.root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();
            if self.exclude.is_match(rel_str.as_ref()) || !self.include.is_match(rel_str.as_ref()) {
                continue;
            }
            let name = normalize_name(&entry.file_name().to_string_lossy())?;
            found.entry(name).or_insert_with(|| path.to_path_buf());
        }
        Ok(found)
    }

    /// Walk the root and remember the result.
    fn refresh(&self) -> KbResult<BTreeMap<String, PathBuf>> {
        let found = self.scan()?;
        *self.resolved.write().unwrap_or_else(|p| p.into_inner()) = found.clone();
        Ok(found)
    }

    fn resolve(&self, name: &str) -> KbResult<Option<PathBuf>> {
        let cached = self
            .resolved
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(name)
            .cloned();
        match cached {
            Some(path) if path.is_file() => Ok(Some(path)),
            _ => Ok(self.refresh()?.remove(name)),
        }
    }

    /// Copy an external file into the document root and return its
    /// normalized name. An existing document with the same name is
    /// overwritten.
    pub fn import(&self, file: &Path) -> KbResult<String> {
        let name = normalize_name(&file.to_string_lossy())?;
        extract::DocumentFormat::from_path(file).map_err(|e| KbError::Source(e.to_string()))?;
        std::fs::create_dir_all(&self.root)?;
        let dest = self.root.join(&name);
        if dest != file {
            std::fs::copy(file, &dest)?;
        }
        self.resolved
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&name);
        tracing::info!(document = %name, "imported into document root");
        Ok(name)
    }
}

#[async_trait]
impl DocumentSource for DirectoryDocuments {
    async fn list(&self) -> KbResult<Vec<String>> {
        Ok(self.refresh()?.into_keys().collect())
    }

    async fn load(&self, name: &str) -> KbResult<LoadedDocument> {
        let name = normalize_name(name)?;
        let path = self
            .resolve(&name)?
            .ok_or_else(|| KbError::Source(format!("document '{}' not found", name)))?;

        let read_path = path.clone();
        let text = tokio::task::spawn_blocking(move || extract::extract_file(&read_path))
            .await
            .map_err(|e| KbError::Source(e.to_string()))?
            .map_err(|e| KbError::Source(format!("{}: {}", name, e)))?;

        Ok(LoadedDocument {
            name,
            source_path: Some(path.display().to_string()),
            text,
        })
    }
}

// ============ Memory ============

/// In-memory document store.
#[derive(Default)]
pub struct MemoryDocuments {
    docs: RwLock<BTreeMap<String, String>>,
}

impl MemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a document, returning its normalized name.
    pub fn insert(&self, name: &str, text: impl Into<String>) -> KbResult<String> {
        let name = normalize_name(name)?;
        self.docs
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.clone(), text.into());
        Ok(name)
    }

    pub fn remove(&self, name: &str) -> bool {
        match normalize_name(name) {
            Ok(name) => self
                .docs
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&name)
                .is_some(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl DocumentSource for MemoryDocuments {
    async fn list(&self) -> KbResult<Vec<String>> {
        Ok(self
            .docs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .cloned()
            .collect())
    }

    async fn load(&self, name: &str) -> KbResult<LoadedDocument> {
        let name = normalize_name(name)?;
        let text = self
            .docs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&name)
            .cloned()
            .ok_or_else(|| KbError::Source(format!("document '{}' not found", name)))?;
        Ok(LoadedDocument {
            name,
            source_path: None,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  policy.pdf ").unwrap(), "policy.pdf");
        assert_eq!(normalize_name("uploads/2025/policy.pdf").unwrap(), "policy.pdf");
        assert_eq!(normalize_name("C:\\docs\\policy.pdf").unwrap(), "policy.pdf");
        assert!(matches!(normalize_name("   "), Err(KbError::EmptyInput)));
        assert!(matches!(normalize_name("dir/"), Err(KbError::EmptyInput)));
    }

    fn config(root: &Path) -> DocumentsConfig {
        DocumentsConfig {
            root: root.to_path_buf(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_directory_lists_matching_files() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("sub")).unwrap();
        std::fs::write(tmp.path().join("b.txt"), "bravo").unwrap();
        std::fs::write(tmp.path().join("sub/a.md"), "alpha").unwrap();
        std::fs::write(tmp.path().join("image.png"), [0u8; 4]).unwrap();
        std::fs::write(tmp.path().join(".hidden.txt"), "x").unwrap();

        let docs = DirectoryDocuments::new(&config(tmp.path())).unwrap();
        assert_eq!(docs.list().await.unwrap(), vec!["a.md", "b.txt"]);

        let loaded = docs.load("a.md").await.unwrap();
        assert_eq!(loaded.text, "alpha");
        assert!(loaded.source_path.unwrap().ends_with("a.md"));
    }

    #[tokio::test]
    async fn test_directory_missing_root_is_empty() {
        let tmp = TempDir::new().unwrap();
        let docs = DirectoryDocuments::new(&config(&tmp.path().join("nope"))).unwrap();
        assert!(docs.list().await.unwrap().is_empty());
        assert!(matches!(docs.load("x.txt").await, Err(KbError::Source(_))));
    }

    #[tokio::test]
    async fn test_import_copies_into_root() {
        let tmp = TempDir::new().unwrap();
        let outside = tmp.path().join("incoming.txt");
        std::fs::write(&outside, "hello").unwrap();

        let docs = DirectoryDocuments::new(&config(&tmp.path().join("docs"))).unwrap();
        let name = docs.import(&outside).unwrap();
        assert_eq!(name, "incoming.txt");
        assert_eq!(docs.list().await.unwrap(), vec!["incoming.txt"]);
    }

    fn walks(docs: &DirectoryDocuments) -> usize {
        docs.walks.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[tokio::test]
    async fn test_bulk_load_walks_root_once() {
        let tmp = TempDir::new().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(tmp.path().join(name), name).unwrap();
        }
        let docs = DirectoryDocuments::new(&config(tmp.path())).unwrap();

        let names = docs.list().await.unwrap();
        for name in &names {
            assert_eq!(&docs.load(name).await.unwrap().text, name);
        }
        assert_eq!(walks(&docs), 1);

        std::fs::write(tmp.path().join("d.txt"), "late arrival").unwrap();
        assert_eq!(docs.load("d.txt").await.unwrap().text, "late arrival");
        assert_eq!(walks(&docs), 2);

        std::fs::remove_file(tmp.path().join("a.txt")).unwrap();
        assert!(matches!(docs.load("a.txt").await, Err(KbError::Source(_))));
        assert_eq!(docs.list().await.unwrap(), vec!["b.txt", "c.txt", "d.txt"]);
    }

    #[tokio::test]
    async fn test_memory_documents() {
        let docs = MemoryDocuments::new();
        docs.insert("folder/one.txt", "first").unwrap();
        docs.insert("two.txt", "second").unwrap();
        assert_eq!(docs.list().await.unwrap(), vec!["one.txt", "two.txt"]);
        assert_eq!(docs.load("one.txt").await.unwrap().text, "first");
        assert!(docs.remove("one.txt"));
        assert!(!docs.remove("one.txt"));
    }
}
