//! Response shaping
//!
//! Applied once every call has a result. Outputs that should not travel
//! inline are written under `<output_dir>/<batch-id>/<key>.txt`.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use super::{BatchResult, ResponseMode};

/// `auto` keeps outputs below this size inline
pub const AUTO_INLINE_LIMIT: usize = 10 * 1024;

/// Preview length for outputs persisted under `auto`
pub const AUTO_PREVIEW_CHARS: usize = 500;

/// Preview length under `summary`
pub const SUMMARY_PREVIEW_CHARS: usize = 200;

/// Aggregate output size above which `auto` becomes `refs`
pub const REFS_UPGRADE_BYTES: usize = 1024 * 1024;

/// Mode actually applied to a set of results
pub fn effective_mode(
    requested: ResponseMode,
    results: &BTreeMap<String, BatchResult>,
) -> ResponseMode {
    if requested != ResponseMode::Auto {
        return requested;
    }
    let total: usize = results
        .values()
        .filter_map(|r| r.output.as_deref())
        .map(str::len)
        .sum();
    if total > REFS_UPGRADE_BYTES {
        tracing::debug!("Batch output is {} bytes, switching to refs", total);
        ResponseMode::Refs
    } else {
        ResponseMode::Auto
    }
}

/// Rewrites results in place and returns the side files written
pub struct Shaper {
    mode: ResponseMode,
    dir: PathBuf,
    used_names: HashSet<String>,
    files: Vec<PathBuf>,
}

impl Shaper {
    pub fn new(mode: ResponseMode, dir: PathBuf) -> Self {
        Self {
            mode,
            dir,
            used_names: HashSet::new(),
            files: Vec::new(),
        }
    }

    pub async fn apply(mut self, results: &mut BTreeMap<String, BatchResult>) -> Vec<PathBuf> {
        if self.mode == ResponseMode::Full {
            return self.files;
        }
        for (key, result) in results.iter_mut() {
            self.shape_one(key, result).await;
        }
        self.files
    }

    async fn shape_one(&mut self, key: &str, result: &mut BatchResult) {
        let Some(output) = result.output.as_deref().filter(|o| !o.is_empty()) else {
            return;
        };

        let preview_chars = match self.mode {
            ResponseMode::Full => return,
            ResponseMode::Auto if output.len() < AUTO_INLINE_LIMIT => return,
            ResponseMode::Auto => Some(AUTO_PREVIEW_CHARS),
            ResponseMode::Summary => Some(SUMMARY_PREVIEW_CHARS),
            ResponseMode::Refs => None,
        };

        let Some(path) = self.persist(key, output).await else {
            return;
        };

        let (inline, truncated) = match preview_chars {
            Some(limit) => preview(output, limit),
            None => (format!("[output stored in {}]", path.display()), true),
        };
        result.output = Some(inline);
        result.truncated = truncated;
        result.file = Some(path);
    }

    async fn persist(&mut self, key: &str, output: &str) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            tracing::warn!(
                "Failed to create batch output dir {}: {}",
                self.dir.display(),
                e
            );
            return None;
        }

        let name = self.unique_name(key);
        let path = self.dir.join(format!("{}.txt", name));
        match tokio::fs::write(&path, output).await {
            Ok(()) => {
                self.files.push(path.clone());
                Some(path)
            }
            Err(e) => {
                tracing::warn!("Failed to write batch output {}: {}", path.display(), e);
                None
            }
        }
    }

    fn unique_name(&mut self, key: &str) -> String {
        let base = file_stem(key);
        let mut name = base.clone();
        let mut n = 1;
        while !self.used_names.insert(name.clone()) {
            n += 1;
            name = format!("{}-{}", base, n);
        }
        name
    }
}

/// File-safe version of a call key
fn file_stem(key: &str) -> String {
    let cleaned: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.starts_with('.') {
        format!("call_{}", cleaned)
    } else {
        cleaned
    }
}

/// First `limit` characters, plus whether anything was cut
fn preview(text: &str, limit: usize) -> (String, bool) {
    match text.char_indices().nth(limit) {
        Some((idx, _)) => (text[..idx].to_string(), true),
        None => (text.to_string(), false),
    }
}
