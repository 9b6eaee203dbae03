//! Layered instruction loading (AGENTS.md).
//!
//! Instructions come from three layers, merged least-specific first so the
//! most specific text sits closest to the conversation:
//!
//! 1. **global**: `~/.config/ctxkeep/AGENTS.md`
//! 2. **project**: `{root}/AGENTS.md`, where `{root}` is the nearest ancestor
//!    of the working directory holding `.git`, `.hg`, `go.mod`,
//!    `package.json`, or `Cargo.toml`
//! 3. **local**: `AGENTS.md` files in directories between the root and the
//!    working directory (root to leaf), then `AGENTS.local.md` overrides
//!
//! Missing files are skipped. The merged text is capped at a byte ceiling
//! (32 KiB by default). When over, the global layer is trimmed first, then
//! the project layer; local text is kept intact. Every trim is reported as
//! an [`InstructionTrim`]. Local text that alone exceeds the ceiling is an
//! error ([`InstructionError::ConfigTooLarge`]).
//!
//! A `## Compaction Instructions` section in any file is pulled out of the
//! prompt and exposed as [`InstructionSet::compaction_instructions`] for the
//! compaction engine.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::estimator::estimate_tokens;
use crate::context::truncate::{MIN_TRUNCATION_LIMIT_BYTES, OutputTruncator};
use crate::error::InstructionError;

/// Default cap on the merged instructions (32 KiB).
pub const DEFAULT_INSTRUCTION_CEILING_BYTES: usize = 32 * 1024;

/// File name for global, project, and nested instructions.
pub const INSTRUCTION_FILE: &str = "AGENTS.md";

/// File name for untracked local overrides.
pub const LOCAL_INSTRUCTION_FILE: &str = "AGENTS.local.md";

/// Files or directories that mark a project root.
pub const ROOT_MARKERS: &[&str] = &[".git", ".hg", "go.mod", "package.json", "Cargo.toml"];

const COMPACTION_HEADER: &str = "## Compaction Instructions";

// ── Layers ─────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Global,
    Project,
    Local,
}

impl Layer {
    /// Separator line placed above the layer's text in the merged prompt.
    fn header(self) -> &'static str {
        match self {
            Layer::Global => "=== Global instructions ===",
            Layer::Project => "=== Project instructions ===",
            Layer::Local => "=== Local instructions ===",
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Global => write!(f, "global"),
            Layer::Project => write!(f, "project"),
            Layer::Local => write!(f, "local"),
        }
    }
}

/// A layer cut (or dropped) to fit the ceiling.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct InstructionTrim {
    pub layer: Layer,
    pub original_bytes: usize,
    pub retained_bytes: usize,
    /// The layer was removed entirely.
    pub dropped: bool,
    pub trimmed_at: DateTime<Utc>,
}

// ── Paths ──────────────────────────────────────────────────────────

/// Where each layer is read from. Missing files are fine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstructionPaths {
    pub global: Option<PathBuf>,
    pub project: Option<PathBuf>,
    /// Concatenated in order.
    pub local: Vec<PathBuf>,
}

impl InstructionPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_global(mut self, path: impl Into<PathBuf>) -> Self {
        self.global = Some(path.into());
        self
    }

    pub fn with_project(mut self, path: impl Into<PathBuf>) -> Self {
        self.project = Some(path.into());
        self
    }

    /// Append a local file.
    pub fn with_local(mut self, path: impl Into<PathBuf>) -> Self {
        self.local.push(path.into());
        self
    }

    /// Resolve the standard layout for `workdir`, with `$HOME` for the
    /// global layer.
    pub fn discover(workdir: &Path) -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from);
        Self::discover_with_home(workdir, home.as_deref())
    }

    /// [`discover`](Self::discover) with an explicit home directory.
    pub fn discover_with_home(workdir: &Path, home: Option<&Path>) -> Self {
        let mut paths = Self {
            global: home.map(|h| h.join(".config/ctxkeep").join(INSTRUCTION_FILE)),
            ..Self::default()
        };

        let Some(root) = find_project_root(workdir) else {
            // No marker: the working directory acts as the project.
            paths.project = Some(workdir.join(INSTRUCTION_FILE));
            paths.local.push(workdir.join(LOCAL_INSTRUCTION_FILE));
            return paths;
        };

        paths.project = Some(root.join(INSTRUCTION_FILE));

        // Nested AGENTS.md files below the root, root to leaf.
        let mut nested: Vec<PathBuf> = workdir
            .ancestors()
            .take_while(|dir| *dir != root.as_path())
            .map(|dir| dir.join(INSTRUCTION_FILE))
            .collect();
        nested.reverse();
        paths.local.extend(nested);

        paths.local.push(root.join(LOCAL_INSTRUCTION_FILE));
        if workdir != root.as_path() {
            paths.local.push(workdir.join(LOCAL_INSTRUCTION_FILE));
        }
        paths
    }
}

/// Nearest ancestor of `start` (inclusive) that contains a root marker.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| ROOT_MARKERS.iter().any(|m| dir.join(m).exists()))
        .map(Path::to_path_buf)
}

// ── Instruction set ────────────────────────────────────────────────

/// Merged instructions for one session. Immutable until reloaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstructionSet {
    /// Layer text as merged (possibly trimmed), compaction sections removed.
    pub global: Option<String>,
    pub project: Option<String>,
    pub local: Option<String>,
    /// The system-prompt text, at most `ceiling_bytes` long.
    pub merged: String,
    /// `## Compaction Instructions` sections from all layers.
    pub compaction_instructions: Option<String>,
    pub trims: Vec<InstructionTrim>,
    pub ceiling_bytes: usize,
}

impl InstructionSet {
    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn was_trimmed(&self) -> bool {
        !self.trims.is_empty()
    }

    pub fn layer(&self, layer: Layer) -> Option<&str> {
        match layer {
            Layer::Global => self.global.as_deref(),
            Layer::Project => self.project.as_deref(),
            Layer::Local => self.local.as_deref(),
        }
    }

    /// Fixed per-turn overhead for the context manager.
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.merged)
    }
}

// ── Loader ─────────────────────────────────────────────────────────

/// Reads and merges instruction layers under a byte ceiling.
#[derive(Debug, Clone, Copy)]
pub struct InstructionLoader {
    ceiling_bytes: usize,
}

impl Default for InstructionLoader {
    fn default() -> Self {
        Self {
            ceiling_bytes: DEFAULT_INSTRUCTION_CEILING_BYTES,
        }
    }
}

impl InstructionLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ceiling_bytes(mut self, bytes: usize) -> Self {
        self.ceiling_bytes = bytes;
        self
    }

    pub fn ceiling_bytes(&self) -> usize {
        self.ceiling_bytes
    }

    /// Read the layers from disk and merge them.
    pub fn load(&self, paths: &InstructionPaths) -> Result<InstructionSet, InstructionError> {
        let global = paths.global.as_deref().map(read_optional).transpose()?.flatten();
        let project = paths.project.as_deref().map(read_optional).transpose()?.flatten();

        let mut local_parts = Vec::new();
        for path in &paths.local {
            if let Some(content) = read_optional(path)? {
                local_parts.push(content);
            }
        }
        let local = (!local_parts.is_empty()).then(|| local_parts.join("\n\n"));

        self.merge(global.as_deref(), project.as_deref(), local.as_deref())
            .map_err(|err| match err {
                InstructionError::ConfigTooLarge {
                    local_bytes,
                    ceiling,
                    ..
                } => InstructionError::ConfigTooLarge {
                    local_bytes,
                    ceiling,
                    path: paths.local.iter().find(|p| p.is_file()).cloned(),
                },
                other => other,
            })
    }

    /// Merge already-read layer text.
    pub fn merge(
        &self,
        global: Option<&str>,
        project: Option<&str>,
        local: Option<&str>,
    ) -> Result<InstructionSet, InstructionError> {
        if let Some(local) = local
            && local.len() > self.ceiling_bytes
        {
            return Err(InstructionError::ConfigTooLarge {
                local_bytes: local.len(),
                ceiling: self.ceiling_bytes,
                path: None,
            });
        }

        let mut compaction_parts = Vec::new();
        let mut sections: Vec<(Layer, String)> = Vec::new();
        for (layer, text) in [
            (Layer::Global, global),
            (Layer::Project, project),
            (Layer::Local, local),
        ] {
            let Some(text) = text else { continue };
            let (main, compaction) = extract_compaction_section(text);
            compaction_parts.extend(compaction);
            if !main.is_empty() {
                sections.push((layer, main));
            }
        }

        let mut trims = Vec::new();
        for layer in [Layer::Global, Layer::Project] {
            let total = rendered_len(&sections);
            if total <= self.ceiling_bytes {
                break;
            }
            let Some(pos) = sections.iter().position(|(l, _)| *l == layer) else {
                continue;
            };
            let overflow = total - self.ceiling_bytes;
            let original = sections[pos].1.len();
            let budget = original.saturating_sub(overflow);

            let trim = if budget < MIN_TRUNCATION_LIMIT_BYTES {
                sections.remove(pos);
                InstructionTrim {
                    layer,
                    original_bytes: original,
                    retained_bytes: 0,
                    dropped: true,
                    trimmed_at: Utc::now(),
                }
            } else {
                let (cut, _) = OutputTruncator::default().truncate_to(&sections[pos].1, budget);
                let cut = cut.into_owned();
                let trim = InstructionTrim {
                    layer,
                    original_bytes: original,
                    retained_bytes: cut.len(),
                    dropped: false,
                    trimmed_at: Utc::now(),
                };
                sections[pos].1 = cut;
                trim
            };
            warn!(
                layer = %layer,
                original_bytes = trim.original_bytes,
                retained_bytes = trim.retained_bytes,
                dropped = trim.dropped,
                "instructions over {} byte ceiling, trimming",
                self.ceiling_bytes
            );
            trims.push(trim);
        }

        let mut merged = render(&sections);
        if merged.len() > self.ceiling_bytes {
            // Only local text is left and its header tips it over.
            merged = sections
                .iter()
                .map(|(_, text)| text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n");
        }

        let find = |layer: Layer| {
            sections
                .iter()
                .find(|(l, _)| *l == layer)
                .map(|(_, text)| text.clone())
        };
        debug!(
            bytes = merged.len(),
            layers = sections.len(),
            trimmed = !trims.is_empty(),
            "instructions loaded"
        );
        Ok(InstructionSet {
            global: find(Layer::Global),
            project: find(Layer::Project),
            local: find(Layer::Local),
            merged,
            compaction_instructions: (!compaction_parts.is_empty())
                .then(|| compaction_parts.join("\n\n")),
            trims,
            ceiling_bytes: self.ceiling_bytes,
        })
    }
}

// ── Private helpers ────────────────────────────────────────────────

/// Read a file; `None` when it is missing or blank.
fn read_optional(path: &Path) -> Result<Option<String>, InstructionError> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(None),
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(InstructionError::Read {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn render(sections: &[(Layer, String)]) -> String {
    sections
        .iter()
        .map(|(layer, text)| format!("{}\n{text}", layer.header()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn rendered_len(sections: &[(Layer, String)]) -> usize {
    let body: usize = sections
        .iter()
        .map(|(layer, text)| layer.header().len() + 1 + text.len())
        .sum();
    body + 2 * sections.len().saturating_sub(1)
}

/// Split a `## Compaction Instructions` section (up to the next `## `
/// heading) out of `content`.
#[allow(clippy::string_slice)] // offsets come from `find` on ASCII needles
fn extract_compaction_section(content: &str) -> (String, Option<String>) {
    let Some(start) = content.find(COMPACTION_HEADER) else {
        return (content.trim().to_string(), None);
    };

    let after_header = start + COMPACTION_HEADER.len();
    let section_end = content[after_header..]
        .find("\n## ")
        .map_or(content.len(), |pos| after_header + pos);

    let compaction = content[after_header..section_end].trim().to_string();
    let rest = content[section_end..].trim_start();
    let main = if rest.is_empty() {
        content[..start].trim_end().to_string()
    } else {
        format!("{}\n\n{rest}", content[..start].trim_end())
    };

    (
        main.trim().to_string(),
        (!compaction.is_empty()).then_some(compaction),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kib(n: usize, fill: char) -> String {
        let line: String = std::iter::repeat_n(fill, 63).chain(['\n']).collect();
        line.repeat(n * 16)
    }

    #[test]
    fn merges_layers_in_order_with_separators() {
        let set = InstructionLoader::new()
            .merge(Some("Be terse."), Some("Use cargo."), Some("I prefer tabs."))
            .unwrap();

        let g = set.merged.find("Be terse.").unwrap();
        let p = set.merged.find("Use cargo.").unwrap();
        let l = set.merged.find("I prefer tabs.").unwrap();
        assert!(g < p && p < l);
        assert!(set.merged.contains("=== Project instructions ==="));
        assert!(!set.was_trimmed());
    }

    #[test]
    fn missing_layers_are_skipped() {
        let set = InstructionLoader::new().merge(None, Some("Only project."), None).unwrap();
        assert_eq!(set.merged, "=== Project instructions ===\nOnly project.");
        assert!(set.global.is_none());
        assert!(set.local.is_none());

        let empty = InstructionLoader::new().merge(None, None, None).unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn small_layers_are_kept_verbatim() {
        let (g, p, l) = (kib(2, 'g'), kib(1, 'p'), kib(1, 'l'));
        let set = InstructionLoader::new()
            .merge(Some(&g), Some(&p), Some(&l))
            .unwrap();
        assert!(set.merged.contains(g.trim()));
        assert!(set.merged.contains(p.trim()));
        assert!(set.merged.contains(l.trim()));
        assert!(set.merged.len() < 4 * 1024 + 128);
    }

    #[test]
    fn trims_global_before_project() {
        let loader = InstructionLoader::new().with_ceiling_bytes(8 * 1024);
        let (g, p, l) = (kib(4, 'g'), kib(3, 'p'), kib(2, 'l'));
        let set = loader.merge(Some(&g), Some(&p), Some(&l)).unwrap();

        assert!(set.merged.len() <= 8 * 1024);
        assert_eq!(set.trims.len(), 1);
        assert_eq!(set.trims[0].layer, Layer::Global);
        assert!(!set.trims[0].dropped);
        assert_eq!(set.project.as_deref(), Some(p.trim()));
        assert_eq!(set.local.as_deref(), Some(l.trim()));
        assert!(set.merged.contains("[... omitted"));
    }

    #[test]
    fn drops_global_then_trims_project() {
        let loader = InstructionLoader::new().with_ceiling_bytes(4 * 1024);
        let (g, p, l) = (kib(4, 'g'), kib(3, 'p'), kib(2, 'l'));
        let set = loader.merge(Some(&g), Some(&p), Some(&l)).unwrap();

        assert!(set.merged.len() <= 4 * 1024);
        assert_eq!(set.trims.len(), 2);
        assert!(set.trims[0].dropped);
        assert_eq!(set.trims[1].layer, Layer::Project);
        assert!(set.global.is_none());
        assert_eq!(set.local.as_deref(), Some(l.trim()));
    }

    #[test]
    fn local_at_ceiling_loses_only_its_header() {
        let loader = InstructionLoader::new().with_ceiling_bytes(1024);
        let local = "l".repeat(1024);
        let set = loader.merge(Some("global"), None, Some(&local)).unwrap();
        assert_eq!(set.merged, local);
        assert!(set.trims.iter().any(|t| t.layer == Layer::Global && t.dropped));
    }

    #[test]
    fn oversized_local_is_config_too_large() {
        let local = kib(40, 'l');
        let err = InstructionLoader::new()
            .merge(Some("global"), Some("project"), Some(&local))
            .unwrap_err();
        assert!(matches!(
            err,
            InstructionError::ConfigTooLarge { local_bytes, ceiling: 32_768, .. } if local_bytes == 40 * 1024
        ));
    }

    #[test]
    fn compaction_section_is_extracted() {
        let project = "# Rules\nBe good.\n\n## Compaction Instructions\nPreserve file paths.\n\n## Other\nStuff.";
        let set = InstructionLoader::new().merge(None, Some(project), None).unwrap();
        assert_eq!(set.compaction_instructions.as_deref(), Some("Preserve file paths."));
        assert!(set.merged.contains("## Other"));
        assert!(!set.merged.contains("Compaction Instructions"));
    }

    #[test]
    fn extract_section_at_end() {
        let (main, compaction) =
            extract_compaction_section("# Rules\n\n## Compaction Instructions\nKeep file paths.");
        assert_eq!(main, "# Rules");
        assert_eq!(compaction.as_deref(), Some("Keep file paths."));
    }

    #[test]
    fn load_reads_files_and_skips_missing() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("AGENTS.md"), "Project rules.").unwrap();
        fs::write(root.join("AGENTS.local.md"), "My local rules.").unwrap();

        let paths = InstructionPaths::new()
            .with_global(root.join("missing/AGENTS.md"))
            .with_project(root.join("AGENTS.md"))
            .with_local(root.join("AGENTS.local.md"));
        let set = InstructionLoader::new().load(&paths).unwrap();

        assert!(set.global.is_none());
        assert_eq!(set.project.as_deref(), Some("Project rules."));
        assert_eq!(set.local.as_deref(), Some("My local rules."));
    }

    #[test]
    fn load_names_the_oversized_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("AGENTS.local.md");
        fs::write(&local, kib(40, 'x')).unwrap();

        let paths = InstructionPaths::new().with_local(&local);
        let err = InstructionLoader::new().load(&paths).unwrap_err();
        match err {
            InstructionError::ConfigTooLarge { path, .. } => assert_eq!(path, Some(local)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unreadable_layer_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where a file is expected.
        fs::create_dir(dir.path().join("AGENTS.md")).unwrap();
        let paths = InstructionPaths::new().with_project(dir.path().join("AGENTS.md"));
        assert!(matches!(
            InstructionLoader::new().load(&paths),
            Err(InstructionError::Read { .. })
        ));
    }

    #[test]
    fn discovers_root_and_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::write(root.join("Cargo.toml"), "[workspace]").unwrap();
        let workdir = root.join("crates/core");
        fs::create_dir_all(&workdir).unwrap();

        let home = root.join("home");
        let paths = InstructionPaths::discover_with_home(&workdir, Some(&home));

        assert_eq!(paths.global, Some(home.join(".config/ctxkeep/AGENTS.md")));
        assert_eq!(paths.project, Some(root.join("AGENTS.md")));
        assert_eq!(
            paths.local,
            vec![
                root.join("crates/AGENTS.md"),
                root.join("crates/core/AGENTS.md"),
                root.join("AGENTS.local.md"),
                workdir.join("AGENTS.local.md"),
            ]
        );
    }

    #[test]
    fn workdir_is_project_without_markers() {
        let dir = tempfile::tempdir().unwrap();
        let paths = InstructionPaths::discover_with_home(dir.path(), None);
        // tempdirs normally live outside any repository.
        if find_project_root(dir.path()).is_none() {
            assert_eq!(paths.project, Some(dir.path().join("AGENTS.md")));
            assert_eq!(paths.local, vec![dir.path().join("AGENTS.local.md")]);
        }
        assert!(paths.global.is_none());
    }

    #[test]
    fn estimated_tokens_follow_merged_text() {
        let set = InstructionLoader::new().merge(None, Some("Use cargo."), None).unwrap();
        assert_eq!(set.estimated_tokens(), estimate_tokens(&set.merged));
    }
}
