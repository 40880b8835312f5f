//! Folder tree of the uploads root, as JSON and as a plain HTML page

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TreeEntry {
    Directory {
        name: String,
        path: String,
        size: u64,
        mtime: String,
        items: Vec<TreeEntry>,
    },
    File {
        name: String,
        path: String,
        size: u64,
        mtime: String,
        ext: String,
    },
}

impl TreeEntry {
    pub fn name(&self) -> &str {
        match self {
            TreeEntry::Directory { name, .. } | TreeEntry::File { name, .. } => name,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            TreeEntry::Directory { path, .. } | TreeEntry::File { path, .. } => path,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, TreeEntry::Directory { .. })
    }
}

/// Reads the tree below `root`, directories first and then by name.
pub fn folder_tree(root: &Path) -> Result<Vec<TreeEntry>> {
    read_level(root, "")
}

fn read_level(dir: &Path, prefix: &str) -> Result<Vec<TreeEntry>> {
    let mut entries = Vec::new();

    for entry in fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(super::PARTIAL_PREFIX) {
            continue;
        }
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{}/{}", prefix, name)
        };

        // entries removed while listing are skipped
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        let mtime = metadata.modified().map(format_mtime).unwrap_or_default();

        if metadata.is_dir() {
            let items = read_level(&entry.path(), &path)?;
            entries.push(TreeEntry::Directory {
                name,
                path,
                size: 0,
                mtime,
                items,
            });
        } else {
            let ext = Path::new(&name)
                .extension()
                .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
                .unwrap_or_default();
            entries.push(TreeEntry::File {
                name,
                path,
                size: metadata.len(),
                mtime,
                ext,
            });
        }
    }

    entries.sort_by(|a, b| match (a.is_dir(), b.is_dir()) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.name().cmp(b.name()),
    });
    Ok(entries)
}

fn format_mtime(time: SystemTime) -> String {
    DateTime::<Local>::from(time).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Percent-encodes one path segment or query value.
pub fn encode_component(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

fn encode_path(path: &str) -> String {
    path.split('/').map(encode_component).collect::<Vec<_>>().join("/")
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Renders the listing page served at `/`.
pub fn render_page(root_display: &str, tree: &[TreeEntry]) -> String {
    let mut html = String::new();
    html.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>ferry</title>\n</head>\n<body>\n");
    let _ = writeln!(html, "<h1>Files in {}</h1>", escape_html(root_display));
    html.push_str(
        "<form action=\"/upload\" method=\"post\" enctype=\"multipart/form-data\">\n\
         <input type=\"text\" name=\"path\" placeholder=\"folder\">\n\
         <input type=\"file\" name=\"file\">\n\
         <button type=\"submit\">Upload</button>\n\
         </form>\n",
    );
    if tree.is_empty() {
        html.push_str("<p>No files yet.</p>\n");
    } else {
        render_entries(&mut html, tree);
    }
    html.push_str("</body>\n</html>\n");
    html
}

fn render_entries(html: &mut String, entries: &[TreeEntry]) {
    html.push_str("<ul>\n");
    for entry in entries {
        match entry {
            TreeEntry::Directory { name, path, items, .. } => {
                let _ = writeln!(
                    html,
                    "<li>{}/ <a href=\"/download-folder?path={}\">zip</a>",
                    escape_html(name),
                    encode_component(path)
                );
                if !items.is_empty() {
                    render_entries(html, items);
                }
                html.push_str("</li>\n");
            }
            TreeEntry::File { name, path, size, mtime, .. } => {
                let _ = writeln!(
                    html,
                    "<li><a href=\"/uploads/{}\">{}</a> {} bytes, {}</li>",
                    encode_path(path),
                    escape_html(name),
                    size,
                    escape_html(mtime)
                );
            }
        }
    }
    html.push_str("</ul>\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directories_sort_first() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.TXT"), b"hello").unwrap();
        std::fs::create_dir_all(dir.path().join("zeta/inner")).unwrap();
        std::fs::write(dir.path().join("zeta/inner/x.bin"), b"1").unwrap();
        std::fs::create_dir(dir.path().join("beta")).unwrap();

        let tree = folder_tree(dir.path()).unwrap();
        let names: Vec<&str> = tree.iter().map(TreeEntry::name).collect();
        assert_eq!(names, vec!["beta", "zeta", "a.TXT"]);

        match &tree[2] {
            TreeEntry::File { size, ext, path, .. } => {
                assert_eq!(*size, 5);
                assert_eq!(ext, ".txt");
                assert_eq!(path, "a.TXT");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
        match &tree[1] {
            TreeEntry::Directory { items, .. } => {
                assert_eq!(items[0].path(), "zeta/inner");
            }
            other => panic!("unexpected entry: {:?}", other),
        }
    }

    #[test]
    fn test_tree_json_shape() {
        let entry = TreeEntry::File {
            name: "a.txt".to_string(),
            path: "docs/a.txt".to_string(),
            size: 3,
            mtime: "2024-01-01 00:00:00".to_string(),
            ext: ".txt".to_string(),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["path"], "docs/a.txt");
    }

    #[test]
    fn test_page_escapes_names() {
        let tree = vec![TreeEntry::File {
            name: "x & <y>.txt".to_string(),
            path: "docs/x & <y>.txt".to_string(),
            size: 1,
            mtime: String::new(),
            ext: ".txt".to_string(),
        }];
        let html = render_page("uploads", &tree);
        assert!(html.contains(">x &amp; &lt;y&gt;.txt</a>"));
        assert!(html.contains("/uploads/docs/x%20%26%20%3Cy%3E.txt"));
    }
}
