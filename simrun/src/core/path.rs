//! Platform path and value transforms applied before launching a process.
//!
//! These are pure string transforms. The directory probe used by
//! [`to_windows_short_name`] is injected so the logic stays testable off Windows.

use std::path::Path;

const PROGRAM_FILES: &str = "Program Files";
const SHORT_NAME_CANDIDATES: usize = 10;
const WINDOWS_SEPARATOR: char = '\\';

/// Rewrite a `Program Files` segment to its legacy `Progra~N` alias.
///
/// Off Windows, or when `value` has no `Program Files` segment, the value is
/// returned unchanged. Otherwise each `Progra~0`..`Progra~9` sibling is checked
/// with `same_dir(alias, long_dir)` and the first match replaces the long
/// segment; the rest of the path is kept. Sibling directories can shift the
/// alias index, so the index is never assumed.
pub fn to_windows_short_name<F>(value: &str, is_windows: bool, same_dir: F) -> String
where
    F: Fn(&Path, &Path) -> bool,
{
    if !is_windows {
        return value.to_string();
    }
    let Some(start) = value.find(PROGRAM_FILES) else {
        return value.to_string();
    };
    // Covers both "Program Files" and "Program Files (x86)".
    let segment_end = value[start + PROGRAM_FILES.len()..]
        .find(WINDOWS_SEPARATOR)
        .map(|offset| start + PROGRAM_FILES.len() + offset)
        .unwrap_or(value.len());
    let (long_dir, rest) = value.split_at(segment_end);
    let parent = &value[..start];

    for index in 0..SHORT_NAME_CANDIDATES {
        let alias = format!("{parent}Progra~{index}");
        if same_dir(Path::new(&alias), Path::new(long_dir)) {
            return format!("{alias}{rest}");
        }
    }
    value.to_string()
}

/// Probe used in production: both paths resolve to the same directory.
pub fn same_directory(alias: &Path, long_dir: &Path) -> bool {
    match (alias.canonicalize(), long_dir.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Wrap a value containing spaces in double quotes.
pub fn quote_if_spaced(value: &str) -> String {
    if value.contains(' ') {
        format!("\"{value}\"")
    } else {
        value.to_string()
    }
}

/// Escape control characters, quotes and backslashes in a propagated value.
pub fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn never(_: &Path, _: &Path) -> bool {
        false
    }

    #[test]
    fn identity_off_windows() {
        let value = r"C:\Program Files\Java\bin\java.exe";
        assert_eq!(to_windows_short_name(value, false, |_, _| true), value);
    }

    #[test]
    fn identity_without_program_files() {
        let value = r"C:\tools\java\bin\java.exe";
        assert_eq!(to_windows_short_name(value, true, |_, _| true), value);
    }

    #[test]
    fn rewrites_matching_alias_and_keeps_rest() {
        let value = r"C:\Program Files\Java\bin\java.exe";
        let shortened = to_windows_short_name(value, true, |alias, long| {
            alias == Path::new(r"C:\Progra~1") && long == Path::new(r"C:\Program Files")
        });
        assert_eq!(shortened, r"C:\Progra~1\Java\bin\java.exe");
    }

    #[test]
    fn x86_segment_is_treated_as_one_directory() {
        let value = r"C:\Program Files (x86)\Java\bin\java.exe";
        let shortened = to_windows_short_name(value, true, |alias, long| {
            alias == Path::new(r"C:\Progra~2") && long == Path::new(r"C:\Program Files (x86)")
        });
        assert_eq!(shortened, r"C:\Progra~2\Java\bin\java.exe");
    }

    #[test]
    fn trailing_program_files_without_separator() {
        let value = r"C:\Program Files";
        let shortened = to_windows_short_name(value, true, |alias, _| {
            alias == Path::new(r"C:\Progra~0")
        });
        assert_eq!(shortened, r"C:\Progra~0");
    }

    #[test]
    fn unresolved_alias_keeps_value() {
        let value = r"C:\Program Files\Java\bin\java.exe";
        assert_eq!(to_windows_short_name(value, true, never), value);
    }

    #[test]
    fn quotes_only_spaced_values() {
        assert_eq!(quote_if_spaced("plain"), "plain");
        assert_eq!(quote_if_spaced("with space"), "\"with space\"");
    }

    #[test]
    fn escapes_control_characters() {
        assert_eq!(escape_value("a\tb\nc\"d\\"), "a\\tb\\nc\\\"d\\\\");
    }
}
