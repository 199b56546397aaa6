//! Load the corpus from disk or from the bundled copy.
//!
//! Layout of a knowledge root:
//! - `catalog.json`: products and add-ons
//! - `errors/<CODE>.md`: YAML frontmatter (code, title, severity, causes, steps) + markdown
//! - `docs/<name>.md`: YAML frontmatter (id, collection, title, tags) + markdown split on `## ` headings
//!
//! Precedence: root first, then extra dirs (later overwrites earlier by catalog, code, or doc id).

use anyhow::Result;
use include_dir::{include_dir, Dir};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{Catalog, Collection, ErrorCodeDoc, KnowledgeBase, KnowledgeError, Passage};

/// Corpus shipped with the crate; `init` extracts it into the config directory.
pub static BUNDLED_KNOWLEDGE: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/config/knowledge");

#[derive(Debug, Deserialize)]
struct GuideFrontmatter {
    id: Option<String>,
    collection: Collection,
    title: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Default)]
struct Merged {
    catalog: Option<Catalog>,
    error_codes: BTreeMap<String, ErrorCodeDoc>,
    guides: BTreeMap<String, Vec<Passage>>,
}

impl Merged {
    fn add_catalog(&mut self, path: &str, content: &str) {
        match serde_json::from_str::<Catalog>(content) {
            Ok(c) => self.catalog = Some(c),
            Err(e) => log::warn!("failed to parse {}: {}", path, e),
        }
    }

    fn add_error_doc(&mut self, path: &str, content: &str) {
        match parse_error_doc(path, content) {
            Ok(doc) => {
                self.error_codes.insert(doc.code.to_ascii_uppercase(), doc);
            }
            Err(e) => log::warn!("skipping {}", e),
        }
    }

    fn add_guide(&mut self, path: &str, stem: &str, content: &str) {
        match parse_guide(path, stem, content) {
            Ok((id, passages)) => {
                self.guides.insert(id, passages);
            }
            Err(e) => log::warn!("skipping {}", e),
        }
    }

    fn finish(self) -> KnowledgeBase {
        let catalog = self.catalog.unwrap_or_else(|| {
            log::warn!("no catalog.json found; product answers will have no catalog facts");
            Catalog::default()
        });
        KnowledgeBase {
            catalog,
            error_codes: self.error_codes,
            guides: self.guides.into_values().flatten().collect(),
        }
    }
}

/// Load the corpus from `root` and `extra_dirs`. Missing directories are skipped.
pub fn load_knowledge(root: Option<&Path>, extra_dirs: &[PathBuf]) -> Result<KnowledgeBase> {
    let mut merged = Merged::default();
    if let Some(d) = root {
        load_from_dir(d, &mut merged);
    }
    for dir in extra_dirs {
        load_from_dir(dir, &mut merged);
    }
    let kb = merged.finish();
    log::info!(
        "loaded knowledge: {} product(s), {} error code(s), {} guide passage(s)",
        kb.catalog.products.len(),
        kb.error_codes.len(),
        kb.guides.len()
    );
    Ok(kb)
}

pub(super) fn load_bundled() -> Result<KnowledgeBase, KnowledgeError> {
    let mut merged = Merged::default();
    let catalog = BUNDLED_KNOWLEDGE
        .get_file("catalog.json")
        .and_then(|f| f.contents_utf8())
        .ok_or_else(|| KnowledgeError::Document {
            path: "catalog.json".to_string(),
            message: "missing from bundled corpus".to_string(),
        })?;
    merged.add_catalog("catalog.json", catalog);
    for (sub, is_errors) in [("errors", true), ("docs", false)] {
        let Some(dir) = BUNDLED_KNOWLEDGE.get_dir(sub) else {
            continue;
        };
        for file in dir.files() {
            let path = file.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(content) = file.contents_utf8() else {
                continue;
            };
            let display = path.display().to_string();
            if is_errors {
                merged.add_error_doc(&display, content);
            } else {
                merged.add_guide(&display, &file_stem(path), content);
            }
        }
    }
    Ok(merged.finish())
}

fn load_from_dir(dir: &Path, merged: &mut Merged) {
    let catalog_path = dir.join("catalog.json");
    if let Ok(s) = std::fs::read_to_string(&catalog_path) {
        merged.add_catalog(&catalog_path.display().to_string(), &s);
    }
    for path in markdown_files(&dir.join("errors")) {
        if let Ok(s) = std::fs::read_to_string(&path) {
            merged.add_error_doc(&path.display().to_string(), &s);
        }
    }
    for path in markdown_files(&dir.join("docs")) {
        if let Ok(s) = std::fs::read_to_string(&path) {
            merged.add_guide(&path.display().to_string(), &file_stem(&path), &s);
        }
    }
}

fn markdown_files(dir: &Path) -> Vec<PathBuf> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(d) => d,
        Err(_) => return Vec::new(),
    };
    let mut out: Vec<PathBuf> = read_dir
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("md"))
        .collect();
    out.sort();
    out
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("doc")
        .to_string()
}

/// Split `---\n<yaml>\n---\n<body>`; None when the content has no frontmatter.
fn split_frontmatter(content: &str) -> Option<(&str, &str)> {
    let rest = content.trim_start().strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let yaml = rest[..end].trim();
    let body = rest[end + 4..].trim_start_matches('-').trim_start();
    Some((yaml, body))
}

fn doc_error(path: &str, message: impl Into<String>) -> KnowledgeError {
    KnowledgeError::Document {
        path: path.to_string(),
        message: message.into(),
    }
}

fn parse_error_doc(path: &str, content: &str) -> Result<ErrorCodeDoc, KnowledgeError> {
    let (yaml, body) = split_frontmatter(content).ok_or_else(|| doc_error(path, "missing frontmatter"))?;
    let mut doc: ErrorCodeDoc =
        serde_yaml::from_str(yaml).map_err(|e| doc_error(path, e.to_string()))?;
    if doc.steps.is_empty() {
        return Err(doc_error(path, "error code has no resolution steps"));
    }
    doc.code = doc.code.trim().to_ascii_uppercase();
    doc.body = body.to_string();
    Ok(doc)
}

fn parse_guide(path: &str, stem: &str, content: &str) -> Result<(String, Vec<Passage>), KnowledgeError> {
    let (yaml, body) = split_frontmatter(content).ok_or_else(|| doc_error(path, "missing frontmatter"))?;
    let fm: GuideFrontmatter =
        serde_yaml::from_str(yaml).map_err(|e| doc_error(path, e.to_string()))?;
    let id = fm.id.unwrap_or_else(|| stem.to_string());
    let doc_title = fm.title.unwrap_or_else(|| id.clone());
    let passages = split_sections(body)
        .into_iter()
        .enumerate()
        .map(|(i, (heading, text))| Passage {
            id: format!("{}#{}", id, i),
            collection: fm.collection,
            title: heading.unwrap_or_else(|| doc_title.clone()),
            text,
            tags: fm.tags.clone(),
        })
        .collect();
    Ok((id, passages))
}

/// Split markdown into (heading, text) sections on `## ` lines. Text before the first heading
/// becomes an untitled section when non-empty.
fn split_sections(body: &str) -> Vec<(Option<String>, String)> {
    let mut out = Vec::new();
    let mut heading: Option<String> = None;
    let mut text = String::new();
    for line in body.lines() {
        if let Some(h) = line.strip_prefix("## ") {
            if !text.trim().is_empty() {
                out.push((heading.take(), normalize_ws(&text)));
            }
            heading = Some(h.trim().to_string());
            text.clear();
        } else {
            text.push_str(line);
            text.push('\n');
        }
    }
    if !text.trim().is_empty() {
        out.push((heading, normalize_ws(&text)));
    }
    out
}

/// Re-flow wrapped lines; blank lines stay paragraph breaks.
fn normalize_ws(text: &str) -> String {
    text.split("\n\n")
        .map(|para| para.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundled_corpus_parses() {
        let kb = KnowledgeBase::bundled().unwrap();
        assert!(kb.catalog.product("cm-pro").is_some());
        let e5678 = kb.error_code("e5678").unwrap();
        assert_eq!(e5678.title, "Container Image Verification Failed");
        assert_eq!(e5678.steps.len(), 4);
        assert!(kb.guides.iter().any(|p| p.collection == Collection::Billing));
    }

    #[test]
    fn split_sections_uses_headings() {
        let sections = split_sections("intro\n\n## First\nline one\nline two\n\n## Second\nmore\n");
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].0, None);
        assert_eq!(sections[1].0.as_deref(), Some("First"));
        assert_eq!(sections[1].1, "line one line two");
    }

    #[test]
    fn error_doc_without_steps_is_rejected() {
        let content = "---\ncode: E1\ntitle: T\nseverity: low\n---\nbody";
        assert!(parse_error_doc("E1.md", content).is_err());
    }

    #[test]
    fn extra_dir_overrides_error_code() {
        let dir = std::env::temp_dir().join(format!("concierge-kb-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("errors")).unwrap();
        std::fs::write(
            dir.join("errors").join("E5678.md"),
            "---\ncode: E5678\ntitle: Overridden\nseverity: high\nsteps:\n  - category: Only\n    action: Do it.\n---\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.join("root")).unwrap();
        BUNDLED_KNOWLEDGE.extract(dir.join("root")).unwrap();
        let kb = load_knowledge(Some(&dir.join("root")), &[dir.clone()]).unwrap();
        let doc = kb.error_code("E5678").unwrap();
        assert_eq!(doc.title, "Overridden");
        assert_eq!(doc.steps.len(), 1);
        assert!(kb.error_code("E1234").is_some());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
