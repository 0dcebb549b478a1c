//! Subject matching.
//!
//! Subjects are `.`-separated tokens. Patterns may contain `*` (exactly one
//! token) and a trailing `>` (one or more tokens). This module only answers
//! the questions trust decisions need; routing lives elsewhere.

pub const PWC: &str = "*";
pub const FWC: &str = ">";

fn tokens(subject: &str) -> impl Iterator<Item = &str> {
    subject.split('.')
}

/// A subject or pattern is valid if it has no empty tokens and `>` only appears last.
pub fn is_valid_subject(subject: &str) -> bool {
    if subject.is_empty() || subject.contains(char::is_whitespace) {
        return false;
    }
    let parts: Vec<&str> = tokens(subject).collect();
    for (i, t) in parts.iter().enumerate() {
        if t.is_empty() {
            return false;
        }
        if *t == FWC && i + 1 != parts.len() {
            return false;
        }
    }
    true
}

/// True if the subject contains no wildcard tokens.
pub fn is_literal(subject: &str) -> bool {
    tokens(subject).all(|t| t != PWC && t != FWC)
}

/// Does `pattern` match the literal `subject`?
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut p = tokens(pattern);
    let mut s = tokens(subject);
    loop {
        match (p.next(), s.next()) {
            (Some(FWC), Some(_)) => return true,
            (Some(PWC), Some(_)) => {}
            (Some(a), Some(b)) if a == b => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Could any literal subject match both patterns?
pub fn intersects(a: &str, b: &str) -> bool {
    let mut x = tokens(a);
    let mut y = tokens(b);
    loop {
        match (x.next(), y.next()) {
            (Some(FWC), Some(_)) | (Some(_), Some(FWC)) => return true,
            (Some(PWC), Some(_)) | (Some(_), Some(PWC)) => {}
            (Some(l), Some(r)) if l == r => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Is every subject matched by `sub` also matched by `of`?
pub fn is_subset(sub: &str, of: &str) -> bool {
    let mut x = tokens(sub);
    let mut y = tokens(of);
    loop {
        match (x.next(), y.next()) {
            (Some(_), Some(FWC)) => return true,
            (Some(FWC), Some(_)) => return false,
            (Some(_), Some(PWC)) => {}
            (Some(PWC), Some(_)) => return false,
            (Some(l), Some(r)) if l == r => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Number of tokens in `subject`.
pub fn token_count(subject: &str) -> usize {
    tokens(subject).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn validity() {
        assert!(is_valid_subject("foo.bar"));
        assert!(is_valid_subject("foo.*.baz"));
        assert!(is_valid_subject("foo.>"));
        assert!(!is_valid_subject(""));
        assert!(!is_valid_subject("foo..bar"));
        assert!(!is_valid_subject("foo.>.bar"));
        assert!(!is_valid_subject("foo bar"));
    }

    #[test]
    fn wildcard_matching() {
        assert!(matches("foo", "foo"));
        assert!(matches("foo.*", "foo.bar"));
        assert!(!matches("foo.*", "foo.bar.baz"));
        assert!(matches("foo.>", "foo.bar.baz"));
        assert!(!matches("foo.>", "foo"));
        assert!(!matches("foo.bar", "foo"));
        assert!(matches(">", "anything.at.all"));
    }

    #[test]
    fn subset_and_intersection() {
        assert!(is_subset("foo.bar", "foo.*"));
        assert!(is_subset("foo.*", "foo.>"));
        assert!(!is_subset("foo.>", "foo.*"));
        assert!(!is_subset("foo.*", "foo.bar"));
        assert!(intersects("foo.*", "*.bar"));
        assert!(intersects("foo.>", "foo.bar.*"));
        assert!(!intersects("foo.*", "bar.*"));
    }

    fn token() -> impl Strategy<Value = String> {
        prop_oneof![Just("a".to_string()), Just("b".to_string()), Just("c".to_string())]
    }

    fn literal() -> impl Strategy<Value = String> {
        prop::collection::vec(token(), 1..5).prop_map(|t| t.join("."))
    }

    proptest! {
        #[test]
        fn literal_matches_itself(s in literal()) {
            prop_assert!(matches(&s, &s));
            prop_assert!(is_subset(&s, &s));
            prop_assert!(intersects(&s, &s));
        }

        #[test]
        fn full_wildcard_covers_every_literal(s in literal()) {
            prop_assert!(matches(">", &s));
            prop_assert!(is_subset(&s, ">"));
        }

        #[test]
        fn matching_implies_intersection(s in literal(), idx in 0usize..5) {
            let mut parts: Vec<&str> = s.split('.').collect();
            let i = idx % parts.len();
            parts[i] = "*";
            let pattern = parts.join(".");
            prop_assert!(matches(&pattern, &s));
            prop_assert!(intersects(&pattern, &s));
            prop_assert!(is_subset(&s, &pattern));
        }
    }
}
