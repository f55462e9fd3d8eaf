//! Helpers for slash separated ensemble paths.
//!
//! A valid path is absolute, has no trailing slash and no empty, `.` or `..`
//! segments. The root is `/`.

pub const ROOT: &str = "/";

pub fn is_valid(path: &str) -> bool {
    if path == ROOT {
        return true;
    }
    let Some(rest) = path.strip_prefix('/') else {
        return false;
    };
    !path.contains('\0')
        && rest
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}

/// Places `path` below `base`. `path` must itself be absolute; `/` names
/// `base` itself.
pub fn join(base: &str, path: &str) -> Option<String> {
    if !is_valid(base) || !is_valid(path) {
        return None;
    }
    Some(match (base, path) {
        (_, ROOT) => base.to_string(),
        (ROOT, _) => path.to_string(),
        _ => format!("{base}{path}"),
    })
}

pub fn parent(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/')? {
        0 => Some(ROOT),
        i => Some(&path[..i]),
    }
}

/// Last segment of `path`.
pub fn name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Every node from the first level down to `path` itself, outermost first.
/// Empty for the root.
pub fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    let own = (path != ROOT).then_some(path);
    path.match_indices('/')
        .skip(1)
        .map(move |(i, _)| &path[..i])
        .chain(own)
}
