//! Glob matching over dotted counter names.
//!
//! | token | matches                                   |
//! |-------|-------------------------------------------|
//! | `*`   | any run of characters, dots included      |
//! | `?`   | any run of characters without a dot       |
//! | other | itself                                    |
//!
//! Both wildcards may match the empty string. A pattern must cover the
//! whole name.

/// Returns true if `name` matches the glob `pattern`.
///
/// Runs in `O(name.len() * pattern.len())` regardless of how many
/// wildcards the pattern holds.
///
/// # Examples
/// ```rust,ignore
/// use alopex_istat::store::pattern_match;
///
/// assert!(pattern_match("web.requests.count", "web.*"));
/// assert!(!pattern_match("web.requests.count", "web.?"));
/// ```
pub fn pattern_match(name: &str, pattern: &str) -> bool {
    let s = name.as_bytes();
    let p = pattern.as_bytes();
    let width = s.len() + 1;

    // row j holds whether s[i..] matches p[j..], for every i
    let mut next = vec![false; width];
    next[s.len()] = true;
    let mut cur = vec![false; width];

    for &token in p.iter().rev() {
        match token {
            b'*' => {
                cur[s.len()] = next[s.len()];
                for i in (0..s.len()).rev() {
                    cur[i] = next[i] || cur[i + 1];
                }
            }
            b'?' => {
                cur[s.len()] = next[s.len()];
                for i in (0..s.len()).rev() {
                    cur[i] = next[i] || (s[i] != b'.' && cur[i + 1]);
                }
            }
            literal => {
                cur[s.len()] = false;
                for i in (0..s.len()).rev() {
                    cur[i] = s[i] == literal && next[i + 1];
                }
            }
        }
        std::mem::swap(&mut cur, &mut next);
    }
    next[0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_inputs() {
        assert!(pattern_match("", ""));
        assert!(!pattern_match("x", ""));
        assert!(pattern_match("", "*"));
        assert!(pattern_match("", "?"));
        assert!(!pattern_match("", "a"));
    }

    #[test]
    fn test_star_crosses_dots() {
        assert!(pattern_match("foo.bar", "foo*"));
        assert!(pattern_match("foo.foo.bar", "f*oo.bar"));
        assert!(pattern_match("foo", "f***oo"));
        assert!(!pattern_match("foo.bar", "f*a*bar"));
        assert!(pattern_match("a.b.c", "*"));
    }

    #[test]
    fn test_question_stays_within_component() {
        assert!(!pattern_match("foo.bar.baz", "foo.?"));
        assert!(!pattern_match("foo.bar.baz", "?.baz"));
        assert!(pattern_match("foo.bar.baz", "foo.b?.baz"));
        assert!(!pattern_match("foo.bar.baz", "foo.b?r?baz"));
        assert!(pattern_match("foo.bar.baz", "?foo.bar.baz"));
        assert!(pattern_match("foo.bar.baz", "foo.?.baz"));
    }

    #[test]
    fn test_literals() {
        assert!(!pattern_match("*", "foo bar"));
        assert!(pattern_match("foo bar", "foo bar"));
        assert!(!pattern_match("foo.bar", "foo.baz"));
    }
}
