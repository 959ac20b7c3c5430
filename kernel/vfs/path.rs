//! Path canonicalization
//!
//! Stack-based: `.` is dropped, `..` pops one segment (a no-op at the root),
//! and relative inputs are appended to the caller's working directory.

use alloc::string::String;
use alloc::vec::Vec;

/// Path separator
pub const PATH_SEPARATOR: char = '/';

/// Turn `input` into an absolute path with no `.`/`..` or empty segments.
///
/// An empty input yields `/`.
pub fn canonicalize(cwd: &str, input: &str) -> String {
    let mut stack: Vec<&str> = Vec::new();

    if !input.is_empty() && !input.starts_with(PATH_SEPARATOR) {
        push_segments(&mut stack, cwd);
    }
    push_segments(&mut stack, input);

    if stack.is_empty() {
        return String::from("/");
    }

    let mut out = String::with_capacity(input.len() + cwd.len() + 1);
    for segment in stack {
        out.push(PATH_SEPARATOR);
        out.push_str(segment);
    }
    out
}

fn push_segments<'a>(stack: &mut Vec<&'a str>, path: &'a str) {
    for segment in path.split(PATH_SEPARATOR) {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            s => stack.push(s),
        }
    }
}

/// Segments of a canonical path (`/` yields none).
pub fn components(path: &str) -> Vec<&str> {
    path.split(PATH_SEPARATOR).filter(|s| !s.is_empty()).collect()
}

/// Join segments into an absolute path.
pub fn join(segments: &[&str]) -> String {
    if segments.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for s in segments {
        out.push(PATH_SEPARATOR);
        out.push_str(s);
    }
    out
}

/// Last segment of a canonical path, `None` for the root.
pub fn file_name(path: &str) -> Option<&str> {
    path.rsplit(PATH_SEPARATOR).find(|s| !s.is_empty())
}
