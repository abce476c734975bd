//! Pure path helpers shared by the filesystem backends.

/// Split a URI into its protocol and path parts.
///
/// `"memory://a/b"` yields `(Some("memory"), "a/b")`; a plain path
/// yields `(None, path)`. Windows drive letters are not treated as
/// protocols.
pub fn split_protocol(uri: &str) -> (Option<&str>, &str) {
    if let Some(pos) = uri.find("://") {
        let scheme = &uri[..pos];
        if scheme.len() > 1
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-')
        {
            return (Some(scheme), &uri[pos + 3..]);
        }
    }
    (None, uri)
}

/// Split a path into `(parent, name)`.
///
/// A single component has the empty string as parent, so a target such
/// as `"t.cube"` still yields a well-defined sibling location.
pub fn split_parent(path: &str) -> (&str, &str) {
    let path = path.trim_end_matches('/');
    match path.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => ("", path),
    }
}

/// Normalize a path: collapse repeated separators, resolve `.` segments,
/// and strip any trailing separator. `..` segments are resolved where a
/// parent component exists and kept otherwise.
pub fn normalize_path(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut out: Vec<&str> = Vec::new();
    for comp in path.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                if matches!(out.last(), Some(&last) if last != "..") {
                    out.pop();
                } else if !absolute {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    let joined = out.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Join a relative component onto a path.
pub fn join(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), rel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_protocol() {
        assert_eq!(split_protocol("memory://a/b"), (Some("memory"), "a/b"));
        assert_eq!(split_protocol("file:///tmp/x"), (Some("file"), "/tmp/x"));
        assert_eq!(split_protocol("/tmp/x"), (None, "/tmp/x"));
        assert_eq!(split_protocol("t.cube"), (None, "t.cube"));
    }

    #[test]
    fn test_split_parent() {
        assert_eq!(split_parent("/a/b/c"), ("/a/b", "c"));
        assert_eq!(split_parent("a/b"), ("a", "b"));
        assert_eq!(split_parent("/a"), ("/", "a"));
        assert_eq!(split_parent("t.cube"), ("", "t.cube"));
        assert_eq!(split_parent("a/b/"), ("a", "b"));
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a//b/./c/"), "/a/b/c");
        assert_eq!(normalize_path("a/b/../c"), "a/c");
        assert_eq!(normalize_path("/../a"), "/a");
        assert_eq!(normalize_path("../a"), "../a");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/a/b", "c"), "/a/b/c");
        assert_eq!(join("", "c"), "c");
        assert_eq!(join("/a/", "c"), "/a/c");
    }
}
