/// A `*`-wildcard exclusion pattern, compiled once at startup and matched
/// against `bucket/object` paths. `*` matches any byte sequence including
/// `/`; there is no single-character wildcard. An empty pattern matches
/// nothing.
#[derive(Debug, Clone)]
pub struct CachePattern {
    pattern: String,
    segments: Vec<String>,
    leading_wild: bool,
    trailing_wild: bool,
}

impl CachePattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            segments: pattern
                .split('*')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            leading_wild: pattern.starts_with('*'),
            trailing_wild: pattern.ends_with('*'),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn matches(&self, text: &str) -> bool {
        if self.pattern.is_empty() {
            return false;
        }
        let mut segments: &[String] = &self.segments;
        if segments.is_empty() {
            // the pattern is nothing but wildcards
            return true;
        }

        let mut pos = 0usize;
        if !self.leading_wild {
            let first = &segments[0];
            if !text.starts_with(first.as_str()) {
                return false;
            }
            pos = first.len();
            segments = &segments[1..];
            if segments.is_empty() {
                return self.trailing_wild || pos == text.len();
            }
        }

        // middle segments match greedily left to right; the final segment
        // must anchor at the end unless the pattern ends in a wildcard
        let (middle, last) = if self.trailing_wild {
            (segments, None)
        } else {
            let (m, l) = segments.split_at(segments.len() - 1);
            (m, Some(&l[0]))
        };

        for segment in middle {
            match text[pos..].find(segment.as_str()) {
                Some(idx) => pos += idx + segment.len(),
                None => return false,
            }
        }
        match last {
            Some(segment) => {
                text.len() >= pos + segment.len() && text[pos..].ends_with(segment.as_str())
            }
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matched(pattern: &str, text: &str) -> bool {
        CachePattern::new(pattern).matches(text)
    }

    #[test]
    fn test_exact_match() {
        assert!(matched("bucket/object", "bucket/object"));
        assert!(!matched("bucket/object", "bucket/object2"));
        assert!(!matched("", "anything"));
    }

    #[test]
    fn test_wildcard_only() {
        assert!(matched("*", "bucket/any/path"));
        assert!(matched("**", "x"));
    }

    #[test]
    fn test_prefix_and_suffix() {
        assert!(matched("mybucket/*", "mybucket/a/b/c"));
        assert!(!matched("mybucket/*", "otherbucket/a"));
        assert!(matched("*.pdf", "docs/reports/q3.pdf"));
        assert!(!matched("*.pdf", "docs/reports/q3.pdfx"));
    }

    #[test]
    fn test_infix_wildcards() {
        assert!(matched("bucket/*/logs/*", "bucket/2024/logs/app.log"));
        assert!(matched("a*b*c", "axxbyyc"));
        assert!(matched("a*b*c", "abc"));
        assert!(!matched("a*b*c", "acb"));
        assert!(!matched("ab*bc", "abc"));
    }
}
