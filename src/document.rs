//! Document ingestion: manuals are walked into `Node`s — Markdown heading
//! sections and whole-file JSON documents — preserving file and in-file
//! insertion order (SPEC_FULL.md §3, §4.2).

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;

use crate::error::{SearchCoreError, SearchResult};
use crate::manual::Manual;

/// The kind of file a node was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    Markdown,
    Json,
}

/// A single indexable unit of text: one Markdown heading section (its body
/// plus the bodies of all descendant headings, per SPEC_FULL.md §3) or one
/// whole JSON file.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Node {
    /// Stable within a manual: `"<relative_path>#<ordinal>"`.
    pub id: String,
    pub manual_id: String,
    /// Path relative to the manual root, using `/` separators.
    pub relative_path: String,
    pub kind: FileKind,
    /// The nearest heading text, or the file stem for JSON nodes.
    pub title: String,
    /// Heading depth (1-6) for Markdown nodes; 0 for JSON nodes.
    pub heading_level: u8,
    /// Full section text, including descendant headings' text.
    pub text: String,
    /// 1-based inclusive line range within the source file.
    pub start_line: usize,
    pub end_line: usize,
    /// Order in which this node was discovered within its manual.
    pub seq: usize,
}

/// ATX heading line: 1-6 `#` characters, a required space, then the heading
/// text. Setext headings (`===`/`---` underlines) are intentionally not
/// recognized — the corpus this crate indexes uses ATX headings exclusively.
static ATX_HEADING: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(#{1,6})\s+(.*\S)\s*$").unwrap());

/// A source of manual content, decoupled from any concrete transport or
/// filesystem so the pipeline can be tested against fixtures (SPEC_FULL.md
/// §4.12).
pub trait DocumentSource: Send + Sync {
    /// Load every node for `manual`, in stable discovery order.
    fn load_nodes(&self, manual: &Manual) -> SearchResult<Vec<Node>>;
}

/// The production [`DocumentSource`]: reads `.md`/`.json` files directly off
/// disk via [`Manual::indexable_files`].
#[derive(Debug, Clone, Copy, Default)]
pub struct FsDocumentSource;

impl DocumentSource for FsDocumentSource {
    fn load_nodes(&self, manual: &Manual) -> SearchResult<Vec<Node>> {
        let mut nodes = Vec::new();
        let mut seq = 0usize;
        for path in manual.indexable_files()? {
            let relative_path = path
                .strip_prefix(&manual.root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            let contents = std::fs::read_to_string(&path)?;
            match path.extension().and_then(|ext| ext.to_str()) {
                Some("md") => {
                    for node in markdown_nodes(&manual.id, &relative_path, &contents, &mut seq) {
                        nodes.push(node);
                    }
                }
                Some("json") => {
                    nodes.push(json_node(&manual.id, &relative_path, &contents, &mut seq));
                }
                _ => {}
            }
        }
        Ok(nodes)
    }
}

struct HeadingLine<'a> {
    level: u8,
    title: &'a str,
    line_no: usize,
}

/// Split Markdown source into heading nodes. Each heading's node spans from
/// its own line to the line before the next heading of level <= its own,
/// which is exactly "this heading plus all of its descendant headings".
fn markdown_nodes(manual_id: &str, relative_path: &str, contents: &str, seq: &mut usize) -> Vec<Node> {
    let lines: Vec<&str> = contents.lines().collect();
    let headings: Vec<HeadingLine<'_>> = lines
        .iter()
        .enumerate()
        .filter_map(|(idx, line)| {
            ATX_HEADING.captures(line).map(|caps| HeadingLine {
                level: caps[1].len() as u8,
                title: caps.get(2).unwrap().as_str(),
                line_no: idx + 1,
            })
        })
        .collect();

    if headings.is_empty() {
        if contents.trim().is_empty() {
            return Vec::new();
        }
        let title = std::path::Path::new(relative_path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| relative_path.to_owned());
        let node = Node {
            id: format!("{relative_path}#{seq}"),
            manual_id: manual_id.to_owned(),
            relative_path: relative_path.to_owned(),
            kind: FileKind::Markdown,
            title,
            heading_level: 0,
            text: contents.to_owned(),
            start_line: 1,
            end_line: lines.len().max(1),
            seq: *seq,
        };
        *seq += 1;
        return vec![node];
    }

    let mut nodes = Vec::with_capacity(headings.len());
    for (idx, heading) in headings.iter().enumerate() {
        let end_line = headings[idx + 1..]
            .iter()
            .find(|next| next.level <= heading.level)
            .map_or(lines.len(), |next| next.line_no - 1);
        let start_line = heading.line_no;
        let text = lines[start_line - 1..end_line].join("\n");
        nodes.push(Node {
            id: format!("{relative_path}#{seq}"),
            manual_id: manual_id.to_owned(),
            relative_path: relative_path.to_owned(),
            kind: FileKind::Markdown,
            title: heading.title.to_owned(),
            heading_level: heading.level,
            text,
            start_line,
            end_line,
            seq: *seq,
        });
        *seq += 1;
    }
    nodes
}

fn json_node(manual_id: &str, relative_path: &str, contents: &str, seq: &mut usize) -> Node {
    let title = std::path::Path::new(relative_path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| relative_path.to_owned());
    let line_count = contents.lines().count().max(1);
    let node = Node {
        id: format!("{relative_path}#{seq}"),
        manual_id: manual_id.to_owned(),
        relative_path: relative_path.to_owned(),
        kind: FileKind::Json,
        title,
        heading_level: 0,
        text: contents.to_owned(),
        start_line: 1,
        end_line: line_count,
        seq: *seq,
    };
    *seq += 1;
    node
}

/// In-memory, insertion-order-preserving table of a manual's nodes.
#[derive(Debug, Clone, Default)]
pub struct DocumentStore {
    nodes: IndexMap<String, Node>,
}

impl DocumentStore {
    /// Load every node for `manual` through `source`.
    pub fn build(manual: &Manual, source: &dyn DocumentSource) -> SearchResult<Self> {
        let loaded = source.load_nodes(manual)?;
        let mut nodes = IndexMap::with_capacity(loaded.len());
        for node in loaded {
            nodes.insert(node.id.clone(), node);
        }
        Ok(Self { nodes })
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// All nodes, in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Count of distinct files contributing nodes, used for
    /// `summary.file_bias_ratio` (SPEC_FULL.md §4.8, §9).
    #[must_use]
    pub fn file_count(&self) -> usize {
        let mut paths: Vec<&str> = self.nodes.values().map(|n| n.relative_path.as_str()).collect();
        paths.sort_unstable();
        paths.dedup();
        paths.len()
    }
}

/// Returns `invalid_parameter` if `manual.root` does not exist or is empty of
/// indexable content, matching the pipeline's early-validation convention.
pub fn validate_manual_has_content(store: &DocumentStore, manual_id: &str) -> SearchResult<()> {
    if store.is_empty() {
        return Err(SearchCoreError::InvalidParameter(format!(
            "manual {manual_id:?} has no indexable .md/.json content"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &std::path::Path, name: &str, contents: &str) {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
    }

    #[test]
    fn single_top_level_heading_spans_whole_file() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.md", "# Title\nbody line\n");
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        assert_eq!(store.len(), 1);
        let node = store.iter().next().unwrap();
        assert_eq!(node.title, "Title");
        assert_eq!(node.start_line, 1);
        assert_eq!(node.end_line, 2);
    }

    #[test]
    fn nested_heading_included_in_parent_and_own_node() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "a.md",
            "# Parent\nintro\n## Child\nchild body\n# Sibling\nsibling body\n",
        );
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        let nodes: Vec<&Node> = store.iter().collect();
        assert_eq!(nodes.len(), 3);

        let parent = &nodes[0];
        assert_eq!(parent.title, "Parent");
        assert!(parent.text.contains("Child"));
        assert!(parent.text.contains("child body"));
        assert!(!parent.text.contains("Sibling"));

        let child = &nodes[1];
        assert_eq!(child.title, "Child");
        assert!(child.text.contains("child body"));
        assert!(!child.text.contains("Sibling"));

        let sibling = &nodes[2];
        assert_eq!(sibling.title, "Sibling");
    }

    #[test]
    fn json_file_becomes_one_whole_file_node() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "data.json", "{\"a\": 1}\n");
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        assert_eq!(store.len(), 1);
        let node = store.iter().next().unwrap();
        assert_eq!(node.kind, FileKind::Json);
        assert_eq!(node.title, "data");
    }

    #[test]
    fn headingless_markdown_becomes_one_node() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "notes.md", "just some text\nmore text\n");
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.iter().next().unwrap().title, "notes");
    }

    #[test]
    fn empty_manual_fails_content_validation() {
        let dir = tempfile::tempdir().unwrap();
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        let err = validate_manual_has_content(&store, "m").unwrap_err();
        assert_eq!(err.code(), "invalid_parameter");
    }

    #[test]
    fn node_order_is_stable_across_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.md", "# A\nbody\n");
        write_file(dir.path(), "b.md", "# B\nbody\n");
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        let titles: Vec<&str> = store.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "B"]);
    }

    #[test]
    fn file_count_counts_distinct_files_not_nodes() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "a.md", "# One\nx\n## Two\ny\n");
        let manual = Manual::new("m", dir.path()).unwrap();
        let store = DocumentStore::build(&manual, &FsDocumentSource).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.file_count(), 1);
    }
}
