/// Read access to a parsed header block.
///
/// The transfer layer owns header framing; the scheduler only needs lookups.
pub trait HeaderLookup {
    fn header(&self, name: &str) -> Option<&str>;
}

/// Small ordered header collection with case-insensitive names.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `Name: value` lines, stopping at the first blank line.
    /// Lines without a colon are ignored.
    pub fn parse_block(block: &str) -> Self {
        let mut headers = Self::new();
        for line in block.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim(), value.trim());
            }
        }
        headers
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.insert(name, value);
        self
    }

    /// Replaces any existing header with the same (case-insensitive) name.
    pub fn insert(&mut self, name: &str, value: &str) {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
        {
            existing.1 = value.to_owned();
            return;
        }
        self.entries.push((name.to_owned(), value.to_owned()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl HeaderLookup for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{HeaderLookup, HeaderMap};

    #[test]
    fn lookups_ignore_header_name_case() {
        let headers = HeaderMap::new().with("X-Queue", "1.0");

        assert_eq!(headers.header("x-queue"), Some("1.0"));
        assert_eq!(headers.header("X-QUEUED"), None);
    }

    #[test]
    fn parse_block_stops_at_blank_line() {
        let headers = HeaderMap::parse_block(
            "X-Queue: 1.0\r\nX-Queued: position=2; ID=ab\r\nbogus line\r\n\r\nX-Node: 1.2.3.4:5\r\n",
        );

        assert_eq!(headers.len(), 2);
        assert_eq!(headers.header("x-queued"), Some("position=2; ID=ab"));
        assert_eq!(headers.header("X-Node"), None);
    }

    #[test]
    fn insert_replaces_existing_value() {
        let mut headers = HeaderMap::new();
        headers.insert("Retry-After", "10");
        headers.insert("retry-after", "20");

        assert_eq!(headers.len(), 1);
        assert_eq!(headers.header("Retry-After"), Some("20"));
    }
}
