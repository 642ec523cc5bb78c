//! Counter name handling.
//!
//! Incoming names are normalized before they reach the registry: a leading
//! `*` marks a collated counter, and the rest is munged so that it is safe
//! to use as a directory path and case-insensitive.

/// Prefix marking a collated (event) counter.
pub const COLLATED_PREFIX: char = '*';

/// A parsed counter name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterName {
    /// Munged name without the collated prefix.
    pub name: String,
    /// True if the raw name carried the collated prefix.
    pub collated: bool,
}

impl CounterName {
    /// Parses a raw counter name.
    ///
    /// Empty dotted components are dropped, so `a..b` and `a.b` name the
    /// same counter. Returns `None` when nothing is left, as for `""`, `*`
    /// or `..`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (rest, collated) = match raw.strip_prefix(COLLATED_PREFIX) {
            Some(rest) => (rest, true),
            None => (raw, false),
        };
        let name = collapse_dots(&munge(rest));
        if name.is_empty() {
            return None;
        }
        Some(Self { name, collated })
    }

    /// The name with its collated prefix restored.
    pub fn to_raw(&self) -> String {
        if self.collated {
            format!("{}{}", COLLATED_PREFIX, self.name)
        } else {
            self.name.clone()
        }
    }
}

/// Replaces characters that are unsafe in a path with `_` and lowercases
/// the rest.
///
/// Bytes outside the printable ASCII range and any of `/ : \ " '` are
/// replaced one for one.
pub fn munge(name: &str) -> String {
    name.bytes()
        .map(|b| match b {
            b'/' | b':' | b'\\' | b'"' | b'\'' => '_',
            b if !(33..=126).contains(&b) => '_',
            b => b.to_ascii_lowercase() as char,
        })
        .collect()
}

/// Drops empty dotted components: `.a..b.` becomes `a.b`.
pub fn collapse_dots(name: &str) -> String {
    name.split('.')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(".")
}

/// Strips the last `.component` of a name.
///
/// Returns `None` when the name has no dot.
pub fn strip_ext(name: &str) -> Option<&str> {
    name.rfind('.').map(|pos| &name[..pos])
}

/// Iterates a name followed by its dotted parents, nearest first.
///
/// `"a.b.c"` yields `"a.b.c"`, `"a.b"`, `"a"`.
pub fn ancestry(name: &str) -> impl Iterator<Item = &str> {
    std::iter::successors(Some(name), |n| strip_ext(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_munge_replaces_unsafe_characters() {
        assert_eq!(munge("Web.Requests"), "web.requests");
        assert_eq!(munge("a b/c:d\\e\"f'g"), "a_b_c_d_e_f_g");
        assert_eq!(munge("tab\there"), "tab_here");
        assert_eq!(munge("~ok!"), "~ok!");
        // two UTF-8 bytes, two replacements
        assert_eq!(munge("caf\u{e9}"), "caf__");
    }

    #[test]
    fn test_parse_collated_prefix() {
        assert_eq!(
            CounterName::parse("*Hits.Total"),
            Some(CounterName {
                name: "hits.total".to_string(),
                collated: true
            })
        );
        assert_eq!(
            CounterName::parse("load"),
            Some(CounterName {
                name: "load".to_string(),
                collated: false
            })
        );
        assert_eq!(CounterName::parse(""), None);
        assert_eq!(CounterName::parse("*"), None);
    }

    #[test]
    fn test_parse_collapses_empty_components() {
        assert_eq!(collapse_dots(".a..b."), "a.b");
        assert_eq!(collapse_dots("a.b"), "a.b");

        let doubled = CounterName::parse("*A..B.").unwrap();
        assert_eq!(doubled.name, "a.b");
        assert!(doubled.collated);
        assert_eq!(doubled.to_raw(), "*a.b");
        assert_eq!(CounterName::parse(&doubled.to_raw()), Some(doubled));

        assert_eq!(CounterName::parse(".."), None);
        assert_eq!(CounterName::parse("*."), None);
    }

    #[test]
    fn test_strip_ext() {
        assert_eq!(strip_ext("a.b.c"), Some("a.b"));
        assert_eq!(strip_ext("a"), None);
        assert_eq!(strip_ext("*a.b"), Some("*a"));
        assert_eq!(strip_ext("a."), Some("a"));
    }

    #[test]
    fn test_ancestry() {
        let names: Vec<&str> = ancestry("x.y.z").collect();
        assert_eq!(names, vec!["x.y.z", "x.y", "x"]);
        assert_eq!(ancestry("solo").count(), 1);
    }
}
