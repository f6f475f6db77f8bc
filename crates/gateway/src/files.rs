//! Read-only access to the agent's workspace directory.

use serde::Serialize;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum FileError {
    #[error("Access denied: path outside workspace")]
    AccessDenied,

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Error reading file: {0}")]
    Io(String),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub size: usize,
    pub lines: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileNode {
    File {
        name: String,
        path: String,
        size: u64,
    },
    Directory {
        name: String,
        path: String,
        children: Vec<FileNode>,
    },
}

/// Resolve `relative` inside `workspace`, refusing anything that escapes it
/// either lexically (`..`, absolute paths) or through a symlink.
pub fn resolve(workspace: &Path, relative: &str) -> Result<PathBuf, FileError> {
    let mut clean = PathBuf::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !clean.pop() {
                    return Err(FileError::AccessDenied);
                }
            }
            Component::RootDir | Component::Prefix(_) => return Err(FileError::AccessDenied),
        }
    }

    let full = workspace.join(&clean);
    if !full.exists() {
        return Err(FileError::NotFound(relative.to_string()));
    }
    let root = workspace.canonicalize().map_err(|e| FileError::Io(e.to_string()))?;
    let real = full.canonicalize().map_err(|e| FileError::Io(e.to_string()))?;
    if !real.starts_with(&root) {
        return Err(FileError::AccessDenied);
    }
    Ok(real)
}

pub fn read_file(workspace: &Path, relative: &str) -> Result<FileContent, FileError> {
    let path = resolve(workspace, relative)?;
    if !path.is_file() {
        return Err(FileError::NotAFile(relative.to_string()));
    }
    let content = std::fs::read_to_string(&path).map_err(|e| FileError::Io(e.to_string()))?;
    Ok(FileContent {
        path: relative.to_string(),
        size: content.chars().count(),
        lines: content.matches('\n').count() + 1,
        content,
    })
}

/// The workspace tree, entries sorted by name. Creates the workspace if it
/// does not exist yet.
pub fn list_tree(workspace: &Path) -> std::io::Result<Vec<FileNode>> {
    if !workspace.exists() {
        std::fs::create_dir_all(workspace)?;
        return Ok(Vec::new());
    }
    Ok(walk(workspace, workspace))
}

fn walk(dir: &Path, root: &Path) -> Vec<FileNode> {
    // Unreadable directories are listed as empty.
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut paths: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let rel = path
                .strip_prefix(root)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|_| name.clone());
            if path.is_dir() {
                FileNode::Directory {
                    name,
                    path: rel,
                    children: walk(&path, root),
                }
            } else {
                let size = path.metadata().map(|m| m.len()).unwrap_or(0);
                FileNode::File { name, path: rel, size }
            }
        })
        .collect()
}
