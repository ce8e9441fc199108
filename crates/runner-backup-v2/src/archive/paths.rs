use std::path::{Component, Path};

/// Archive-internal form of a relative path: `/`-separated, no `.`/`..`.
pub(crate) fn logical_path(rel: &Path) -> Result<String, &'static str> {
    let mut parts: Vec<&str> = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str().ok_or("non-UTF-8 path")?),
            Component::CurDir => {}
            Component::ParentDir => return Err("path traversal"),
            Component::RootDir | Component::Prefix(_) => return Err("absolute path"),
        }
    }
    if parts.is_empty() {
        return Err("empty path");
    }
    Ok(parts.join("/"))
}

/// Re-validate a logical path read from an archive before it is joined onto
/// a staging directory.
pub(crate) fn checked_logical(raw: &str) -> Result<String, &'static str> {
    if raw.starts_with('/') || raw.starts_with('\\') || raw.contains('\\') {
        return Err("absolute or non-portable path");
    }
    let normalized = logical_path(Path::new(raw))?;
    if normalized != raw {
        return Err("path is not in normalized form");
    }
    Ok(normalized)
}

/// Whether `path` is `root` itself or lives below it.
pub(crate) fn is_within(path: &str, root: &str) -> bool {
    path == root
        || path
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}
