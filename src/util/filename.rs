/// Longest sanitized title kept in a file name (in characters).
const MAX_TITLE_CHARS: usize = 200;

/// Characters that are invalid in file names on at least one supported platform.
const INVALID_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Make a bookmark title safe to use as a file name on every platform.
///
/// Removes path separators and characters Windows forbids, strips control
/// characters, trims leading/trailing dots and spaces, and limits the length.
/// An empty result becomes `untitled`.
pub fn sanitize_filename(title: &str) -> String {
    let cleaned: String = title
        .chars()
        .filter(|c| !INVALID_CHARS.contains(c) && !c.is_control())
        .collect();
    let trimmed = cleaned.trim_matches(|c| c == '.' || c == ' ');
    let limited: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    let limited = limited.trim_end_matches(['.', ' ']);

    if limited.is_empty() {
        "untitled".to_string()
    } else {
        limited.to_string()
    }
}

/// File name for one content facet of a bookmark: `<title> [<id>].<ext>`.
///
/// The id suffix keeps names unique when two bookmarks share a title.
pub fn content_file_name(title: &str, id: &str, extension: &str) -> String {
    format!(
        "{} [{}].{}",
        sanitize_filename(title),
        sanitize_filename(id),
        extension
    )
}
