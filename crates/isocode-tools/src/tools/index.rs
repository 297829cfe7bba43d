//! Workspace file index and codebase search.
//!
//! The index is built on demand per workspace and cached for 60 seconds.
//! A fixed ignore set and a binary-extension filter keep it small enough to
//! score in memory.

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;
use walkdir::WalkDir;

const INDEX_TTL: Duration = Duration::from_secs(60);
/// Head kept from each key file.
const KEY_FILE_HEAD: usize = 2_000;

const IGNORED_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "out",
    "build",
    "vendor",
    "target",
];

const BINARY_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "gif", "webp", "ico", "pdf", "zip", "tar", "gz", "bz2", "7z", "exe",
    "dll", "so", "dylib", "a", "o", "class", "jar", "wasm", "woff", "woff2", "ttf", "mp3", "mp4",
    "bin", "lock",
];

const KEY_FILE_NAMES: &[&str] = &[
    "README.md",
    "Cargo.toml",
    "package.json",
    "pyproject.toml",
    "go.mod",
    "Makefile",
];

#[derive(Clone, Debug)]
pub struct IndexedFile {
    pub relative_path: String,
    pub extension: String,
    pub size: u64,
    pub dir: String,
}

#[derive(Clone, Debug)]
pub struct FileIndex {
    pub files: Vec<IndexedFile>,
    pub dirs: BTreeSet<String>,
    /// Key file name -> first 2,000 chars.
    pub key_files: HashMap<String, String>,
    pub total: usize,
    pub built_at: Instant,
}

impl FileIndex {
    fn build(root: &Path) -> FileIndex {
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();
        let mut key_files = HashMap::new();

        for entry in WalkDir::new(root)
            .into_iter()
            .filter_entry(|e| {
                if e.depth() == 0 {
                    return true;
                }
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && !IGNORED_DIRS.contains(&name.as_ref())
            })
            .filter_map(|e| e.ok())
        {
            let rel = confine::relative_display(root, entry.path());
            if entry.file_type().is_dir() {
                if !rel.is_empty() {
                    dirs.insert(rel);
                }
                continue;
            }
            if !entry.file_type().is_file() {
                continue;
            }
            let extension = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            if BINARY_EXTENSIONS.contains(&extension.as_str()) {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if KEY_FILE_NAMES.contains(&name.as_ref()) {
                if let Ok(content) = std::fs::read_to_string(entry.path()) {
                    let head: String = content.chars().take(KEY_FILE_HEAD).collect();
                    key_files.entry(name.to_string()).or_insert(head);
                }
            }
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let dir = rel.rsplit_once('/').map(|(d, _)| d.to_string()).unwrap_or_default();
            files.push(IndexedFile {
                relative_path: rel,
                extension,
                size,
                dir,
            });
        }

        let total = files.len();
        debug!("file index built: {} files, {} dirs", total, dirs.len());
        FileIndex {
            files,
            dirs,
            key_files,
            total,
            built_at: Instant::now(),
        }
    }

    /// Compact project map used in the system prompt: top-level layout plus
    /// file counts by extension.
    pub fn project_map(&self) -> String {
        let mut by_ext: HashMap<&str, usize> = HashMap::new();
        for file in &self.files {
            if !file.extension.is_empty() {
                *by_ext.entry(file.extension.as_str()).or_default() += 1;
            }
        }
        let mut counts: Vec<(&str, usize)> = by_ext.into_iter().collect();
        counts.sort_by(|a, b| b.1.cmp(&a.1));

        let top_dirs: Vec<&str> = self
            .dirs
            .iter()
            .filter(|d| !d.contains('/'))
            .map(|d| d.as_str())
            .take(20)
            .collect();

        let mut out = format!("{} files", self.total);
        if !top_dirs.is_empty() {
            out.push_str(&format!("; top-level dirs: {}", top_dirs.join(", ")));
        }
        if !counts.is_empty() {
            let summary: Vec<String> = counts
                .iter()
                .take(8)
                .map(|(ext, n)| format!("{} .{}", n, ext))
                .collect();
            out.push_str(&format!("; {}", summary.join(", ")));
        }
        out
    }

    /// Score files against whitespace-separated query terms.
    fn search(&self, query: &str, limit: usize) -> Vec<(String, u32)> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| t.len() > 1)
            .collect();
        if terms.is_empty() {
            return Vec::new();
        }

        let mut scored: Vec<(String, u32)> = self
            .files
            .iter()
            .filter_map(|file| {
                let path_lower = file.relative_path.to_lowercase();
                let mut score = 0u32;
                for term in &terms {
                    if path_lower.contains(term.as_str()) {
                        score += 10;
                        // File-name hits outrank directory hits.
                        if path_lower
                            .rsplit('/')
                            .next()
                            .is_some_and(|name| name.contains(term.as_str()))
                        {
                            score += 5;
                        }
                    }
                }
                (score > 0).then(|| (file.relative_path.clone(), score))
            })
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }
}

/// Process-wide index cache: one index per workspace root, 60 s TTL.
#[derive(Default)]
pub struct FileIndexCache {
    inner: Mutex<HashMap<PathBuf, Arc<FileIndex>>>,
}

impl FileIndexCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, root: &Path) -> Arc<FileIndex> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(index) = inner.get(root) {
            if index.built_at.elapsed() < INDEX_TTL {
                return index.clone();
            }
        }
        let index = Arc::new(FileIndex::build(root));
        inner.insert(root.to_path_buf(), index.clone());
        index
    }

    pub fn invalidate(&self, root: &Path) {
        self.inner.lock().unwrap().remove(root);
    }

    /// Short relevance context for a query, capped in characters. Used to
    /// enrich the initial user message when no explicit context is attached.
    pub fn relevance_context(&self, root: &Path, query: &str, cap: usize) -> Option<String> {
        let index = self.get(root);
        let hits = index.search(query, 10);
        if hits.is_empty() {
            return None;
        }
        let mut out = String::from("Possibly relevant files:\n");
        for (path, _) in hits {
            if out.len() + path.len() + 3 > cap {
                break;
            }
            out.push_str("- ");
            out.push_str(&path);
            out.push('\n');
        }
        Some(out.trim_end().to_string())
    }
}

pub struct CodebaseSearchTool {
    cache: Arc<FileIndexCache>,
}

impl CodebaseSearchTool {
    pub fn new(cache: Arc<FileIndexCache>) -> Self {
        Self { cache }
    }
}

#[async_trait::async_trait]
impl Tool for CodebaseSearchTool {
    fn name(&self) -> &str {
        "codebase_search"
    }

    fn description(&self) -> &str {
        "Find files relevant to a free-text query by scoring names and paths \
         against the workspace index. Cheaper than grep for orientation."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Free-text query, e.g. 'session registry'"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let query = match args["query"].as_str() {
            Some(q) => q,
            None => return ToolResult::error("Missing required parameter: query"),
        };
        let index = self.cache.get(&ctx.workspace_root);
        let matches: Vec<Value> = index
            .search(query, 20)
            .into_iter()
            .map(|(path, score)| json!({ "file": path, "score": score }))
            .collect();
        ToolResult::json(json!({
            "query": query,
            "matches": matches,
            "indexedFiles": index.total,
        }))
    }
}
