//! Name validation and path helpers shared by the disk and object layers.

pub const SLASH_SEPARATOR: &str = "/";

/// Reserved volume holding multipart sessions and the staging area.
pub const SYS_VOLUME: &str = ".strata.sys";
pub const MPART_META_PREFIX: &str = "multipart";
pub const TMP_META_PREFIX: &str = "tmp";

const MAX_PATH_LEN: usize = 1024;
const MAX_COMPONENT_LEN: usize = 255;

/// Joins path elements with `/`, keeping a trailing slash on the last
/// element so directory paths survive the join.
pub fn path_join(elements: &[&str]) -> String {
    let mut joined = String::new();
    for element in elements.iter().filter(|element| !element.is_empty()) {
        if !joined.is_empty() && !joined.ends_with('/') {
            joined.push('/');
        }
        joined.push_str(element.trim_start_matches('/'));
    }
    joined
}

pub fn retain_slash(path: &str) -> String {
    if path.is_empty() || path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Parent directory of an object name, `"."` for top level names.
pub fn parent_dir(object: &str) -> &str {
    match object.trim_end_matches('/').rfind('/') {
        Some(idx) if idx > 0 => &object[..idx],
        _ => ".",
    }
}

pub fn is_valid_volname(volume: &str) -> bool {
    if volume.len() < 3 || volume.len() > 63 {
        return false;
    }
    volume != "." && volume != ".." && !volume.contains('/') && !volume.contains('\\')
}

pub fn is_valid_path(path: &str) -> bool {
    if path.is_empty() || path.len() > MAX_PATH_LEN || path.starts_with('/') || path.contains('\\') {
        return false;
    }
    path.trim_end_matches('/').split('/').all(|component| {
        !component.is_empty()
            && component.len() <= MAX_COMPONENT_LEN
            && component != "."
            && component != ".."
    })
}

pub fn is_valid_bucket_name(bucket: &str) -> bool {
    if bucket.len() < 3 || bucket.len() > 63 || bucket.contains("..") {
        return false;
    }
    let bytes = bucket.as_bytes();
    let edge_ok = |byte: u8| byte.is_ascii_lowercase() || byte.is_ascii_digit();
    if !edge_ok(bytes[0]) || !edge_ok(bytes[bytes.len() - 1]) {
        return false;
    }
    if !bytes
        .iter()
        .all(|&byte| edge_ok(byte) || byte == b'.' || byte == b'-')
    {
        return false;
    }
    // Dotted quads look like IP addresses.
    bucket.parse::<std::net::Ipv4Addr>().is_err()
}

pub fn is_valid_object_prefix(prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    if prefix.len() > MAX_PATH_LEN || prefix.starts_with('/') || prefix.contains("//") {
        return false;
    }
    is_valid_path(prefix)
}

pub fn is_valid_object_name(object: &str) -> bool {
    !object.is_empty() && !object.ends_with('/') && is_valid_object_prefix(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_keeps_trailing_slash() {
        assert_eq!(path_join(&["multipart", "bucket", "a/b"]), "multipart/bucket/a/b");
        assert_eq!(path_join(&["multipart", "bucket", "dir/"]), "multipart/bucket/dir/");
        assert_eq!(path_join(&["multipart/", "bucket", ""]), "multipart/bucket");
        assert_eq!(retain_slash("a/b"), "a/b/");
        assert_eq!(retain_slash("a/b/"), "a/b/");
    }

    #[test]
    fn parent_dir_of_objects() {
        assert_eq!(parent_dir("a/b/c"), "a/b");
        assert_eq!(parent_dir("a"), ".");
        assert_eq!(parent_dir("a/b/"), "a");
    }

    #[test]
    fn bucket_names_follow_s3_rules() {
        assert!(is_valid_bucket_name("photos"));
        assert!(is_valid_bucket_name("my-bucket.v2"));
        assert!(!is_valid_bucket_name("ab"));
        assert!(!is_valid_bucket_name("Photos"));
        assert!(!is_valid_bucket_name("-photos"));
        assert!(!is_valid_bucket_name("a..b"));
        assert!(!is_valid_bucket_name("192.168.1.1"));
        assert!(!is_valid_bucket_name(SYS_VOLUME));
    }

    #[test]
    fn object_names_reject_traversal() {
        assert!(is_valid_object_name("a/b/c.txt"));
        assert!(!is_valid_object_name(""));
        assert!(!is_valid_object_name("/abs"));
        assert!(!is_valid_object_name("a/../b"));
        assert!(!is_valid_object_name("a//b"));
        assert!(!is_valid_object_name("dir/"));
        assert!(is_valid_object_prefix("dir/"));
        assert!(is_valid_object_prefix(""));
    }
}
