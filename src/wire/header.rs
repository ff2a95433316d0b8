//! Attribute extraction from queueing header values such as
//! `position=3; ID=abc123; length=9`.
//!
//! Everything here borrows from the header value: nothing allocates.

/// Result of scanning a header value for one attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeScan<'a> {
    pub value: Option<&'a str>,
    /// Occurrences of the attribute name that were not followed by `=`.
    pub malformed: usize,
}

/// Returns the value of `attribute` inside `header`, if present.
pub fn attribute_value<'a>(header: &'a str, attribute: &str) -> Option<&'a str> {
    scan_attribute(header, attribute).value
}

/// Case-insensitive attribute lookup.
///
/// A match must be preceded by start of string or one of `; , : <space>` and
/// followed by `=`, a space, or end of string. Blanks between the name and the
/// `=` are skipped. The value runs until the next `;` or `,`.
pub fn scan_attribute<'a>(header: &'a str, attribute: &str) -> AttributeScan<'a> {
    let bytes = header.as_bytes();
    let needle = attribute.as_bytes();
    let mut malformed = 0;

    if needle.is_empty() || needle.len() > bytes.len() {
        return AttributeScan {
            value: None,
            malformed,
        };
    }

    let mut from = 0;
    while let Some(start) = find_ignore_case(bytes, needle, from) {
        let end = start + needle.len();
        from = start + 1;

        let left_ok = start == 0 || matches!(bytes[start - 1], b';' | b',' | b':' | b' ');
        let right_ok = end == bytes.len() || matches!(bytes[end], b' ' | b'=');
        if !left_ok || !right_ok {
            continue;
        }

        let mut cursor = end;
        while cursor < bytes.len() && bytes[cursor] == b' ' {
            cursor += 1;
        }

        if cursor >= bytes.len() || bytes[cursor] != b'=' {
            malformed += 1;
            from = cursor.max(from);
            continue;
        }

        let value_start = cursor + 1;
        let value_end = bytes[value_start..]
            .iter()
            .position(|byte| matches!(byte, b';' | b','))
            .map(|offset| value_start + offset)
            .unwrap_or(bytes.len());

        return AttributeScan {
            value: Some(header[value_start..value_end].trim()),
            malformed,
        };
    }

    AttributeScan {
        value: None,
        malformed,
    }
}

/// Parses a leading `major.minor` pair, e.g. `1.0` or `0.1`.
pub fn parse_version(raw: &str) -> Option<(u32, u32)> {
    let raw = raw.trim_start();
    let (major, rest) = split_leading_digits(raw)?;
    let rest = rest.strip_prefix('.')?;
    let (minor, _) = split_leading_digits(rest)?;

    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Base-10 prefix of `raw`, 0 when there is none, clamped to `i32::MAX`.
pub fn parse_leading_integer(raw: &str) -> u32 {
    let raw = raw.trim_start();
    let raw = raw.strip_prefix('+').unwrap_or(raw);
    let Some((digits, _)) = split_leading_digits(raw) else {
        return 0;
    };

    match digits.parse::<u64>() {
        Ok(value) => value.min(i32::MAX as u64) as u32,
        Err(_) => i32::MAX as u32,
    }
}

fn split_leading_digits(raw: &str) -> Option<(&str, &str)> {
    let digits = raw.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    Some(raw.split_at(digits))
}

fn find_ignore_case(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
        .map(|offset| from + offset)
}
