use std::borrow::Cow;

/// Collapses every run of Unicode whitespace into a single ASCII space and
/// trims both ends.
///
/// Returns `Cow::Borrowed` when the input is already collapsed.
///
/// # Examples
///
/// ```
/// use feedmill::util::collapse_whitespace;
///
/// assert_eq!(collapse_whitespace("  Hello \n\t World "), "Hello World");
/// assert_eq!(collapse_whitespace("already clean"), "already clean");
/// ```
pub fn collapse_whitespace(s: &str) -> Cow<'_, str> {
    let mut previous_space = true;
    let clean = s.chars().all(|c| {
        let ok = if c.is_whitespace() {
            c == ' ' && !previous_space
        } else {
            true
        };
        previous_space = c.is_whitespace();
        ok
    }) && !s.ends_with(' ');

    if clean {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(word);
    }
    Cow::Owned(out)
}

/// Strips ASCII control characters (including ESC and DEL) from user-supplied
/// names, then trims surrounding whitespace.
///
/// Returns `None` when nothing printable remains.
pub fn sanitize_name(name: &str) -> Option<String> {
    let stripped: String = name.chars().filter(|c| !c.is_control()).collect();
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}
