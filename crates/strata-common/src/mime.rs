pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Content type guessed from the object name's extension.
pub fn content_type_for(object: &str) -> String {
    mime_guess::from_path(object)
        .first_raw()
        .unwrap_or(DEFAULT_CONTENT_TYPE)
        .to_string()
}
