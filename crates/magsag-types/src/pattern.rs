//! Shell-style `*` wildcard matching used by permission policies and route
//! selection. Matching is case-sensitive.

pub fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if is_first && !pattern.starts_with('*') {
            if let Some(stripped) = remaining.strip_prefix(part) {
                remaining = stripped;
            } else {
                return false;
            }
            is_first = false;
            continue;
        }
        is_first = false;
        if let Some(index) = remaining.find(part) {
            remaining = &remaining[index + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_semantics() {
        assert!(wildcard_matches("*", "anything"));
        assert!(wildcard_matches("search.*", "search.query"));
        assert!(wildcard_matches("*.delete_*", "index.delete_all"));
        assert!(wildcard_matches("a*b", "axxb"));
        assert!(!wildcard_matches("a*b", "axxbc"));
        assert!(!wildcard_matches("search.*", "web.search"));
        assert!(!wildcard_matches("exact", "exact.more"));
        assert!(!wildcard_matches("Exact", "exact"));
    }
}
