//! Per-agent workspace directories on the service host.

use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

use ignore::WalkBuilder;
use regex::Regex;

use crate::error::{GodmodeError, Result};

pub const MAX_LISTED_FILES: usize = 500;

static AGENT_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,128}$").expect("static regex"));

fn normalize_root(root: &Path) -> Option<PathBuf> {
    let abs = if root.is_absolute() {
        root.to_path_buf()
    } else {
        std::env::current_dir().ok()?.join(root)
    };
    abs.canonicalize().ok()
}

/// Joins `rel` onto `root`, refusing anything that escapes it.
pub fn resolve_under_root(root: &Path, rel: &str) -> Option<PathBuf> {
    let root_abs = normalize_root(root)?;
    let normalized = Path::new(rel).components().fold(PathBuf::new(), |mut acc, comp| {
        match comp {
            Component::ParentDir => {
                acc.pop();
            }
            Component::Normal(part) => acc.push(part),
            _ => {}
        }
        acc
    });
    let full_path = root_abs.join(&normalized);
    match full_path.canonicalize() {
        Ok(canonical) => canonical.starts_with(&root_abs).then_some(canonical),
        // Not created yet: only the lexical check applies.
        Err(_) => full_path.starts_with(&root_abs).then_some(full_path),
    }
}

/// Workspace directory of `agent_id` below `root`.
pub fn agent_workspace(root: &Path, agent_id: &str) -> Result<PathBuf> {
    if !AGENT_ID.is_match(agent_id) {
        return Err(GodmodeError::BadRequest(format!("invalid agent id: {agent_id:?}")));
    }
    resolve_under_root(root, agent_id)
        .ok_or_else(|| GodmodeError::NotFound(format!("workspace for {agent_id}")))
}

/// Files in the agent's workspace as sorted relative paths. A workspace that
/// does not exist yet is empty.
pub fn list_agent_files(root: &Path, agent_id: &str, max: usize) -> Result<Vec<String>> {
    let dir = match agent_workspace(root, agent_id) {
        Ok(dir) => dir,
        Err(GodmodeError::NotFound(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for dirent in WalkBuilder::new(&dir).hidden(false).git_ignore(true).build().flatten() {
        if out.len() >= max {
            break;
        }
        if !dirent.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }
        if let Ok(rel) = dirent.path().strip_prefix(&dir) {
            out.push(rel.to_string_lossy().replace('\\', "/"));
        }
    }
    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn resolve_denies_path_traversal() {
        let dir = tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let escaped = resolve_under_root(dir.path(), "../etc/passwd");
        assert!(escaped.map_or(true, |p| p.starts_with(&root)));
        assert!(resolve_under_root(dir.path(), "agent_1").is_some());
    }

    #[test]
    fn lists_files_relative_to_workspace() {
        let dir = tempdir().unwrap();
        let ws = dir.path().join("agent_1_abc");
        fs::create_dir_all(ws.join("notes")).unwrap();
        fs::write(ws.join("business_plan.md"), "# plan").unwrap();
        fs::write(ws.join("notes").join("research.txt"), "x").unwrap();
        fs::write(dir.path().join("other.txt"), "not mine").unwrap();

        let files = list_agent_files(dir.path(), "agent_1_abc", MAX_LISTED_FILES).unwrap();
        assert_eq!(files, vec!["business_plan.md".to_string(), "notes/research.txt".to_string()]);
        assert_eq!(list_agent_files(dir.path(), "agent_1_abc", 1).unwrap().len(), 1);
    }

    #[test]
    fn missing_workspace_is_empty_and_bad_ids_rejected() {
        let dir = tempdir().unwrap();
        assert!(list_agent_files(dir.path(), "agent_9", 10).unwrap().is_empty());
        for bad in ["../x", "a/b", "", ".."] {
            let listed = list_agent_files(dir.path(), bad, 10);
            assert!(matches!(listed, Err(GodmodeError::BadRequest(_))), "{bad}");
        }
    }
}
