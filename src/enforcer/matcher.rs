//! Segment-wise wildcard matching used on `res`, `act` and `obj`

/// Match a request value against a policy pattern.
///
/// `*` alone matches anything. Otherwise both sides are split on `/` and
/// must have the same number of segments. A pattern segment matches when it
/// is equal to the key segment, or when it contains `*` and the key segment
/// starts with everything before that `*`.
pub fn key_match(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return key == pattern;
    }

    let mut keys = key.split('/');
    let mut patterns = pattern.split('/');
    loop {
        match (keys.next(), patterns.next()) {
            (None, None) => return true,
            (Some(k), Some(p)) => {
                if !segment_match(k, p) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

fn segment_match(key: &str, pattern: &str) -> bool {
    match pattern.find('*') {
        Some(star) => key.starts_with(&pattern[..star]),
        None => key == pattern,
    }
}

/// Action match: exact, or a `*` policy action.
pub fn action_match(act: &str, pattern: &str) -> bool {
    pattern == "*" || act == pattern
}
