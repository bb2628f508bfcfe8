//! Shell-style name matching for task and target selection.
//!
//! Selection flags accept either literal names or fnmatch-style patterns
//! (`*`, `?`, `[...]`). Patterns are translated to anchored regexes for
//! matching against task names and target keys.

use regex::Regex;

/// Whether `s` should be treated as a pattern rather than a literal.
pub fn is_pattern(s: &str) -> bool {
    s.contains(['*', '?', '['])
}

/// Translate an fnmatch-style pattern into an anchored regex.
pub fn fnmatch_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut class = String::new();
                let mut closed = false;
                if chars.peek() == Some(&'!') {
                    chars.next();
                    class.push('^');
                }
                for inner in chars.by_ref() {
                    if inner == ']' {
                        closed = true;
                        break;
                    }
                    if matches!(inner, '\\' | '^') {
                        class.push('\\');
                    }
                    class.push(inner);
                }
                if closed && !class.is_empty() && class != "^" {
                    out.push('[');
                    out.push_str(&class);
                    out.push(']');
                } else {
                    // Unterminated or empty class matches a literal '['
                    out.push_str(&regex::escape("["));
                    out.push_str(&regex::escape(&class.replace('^', "!")));
                    if closed {
                        out.push_str(&regex::escape("]"));
                    }
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out)
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test_case("out/*.txt", "out/a.txt", true)]
    #[test_case("out/*.txt", "log/a.txt", false)]
    #[test_case("out/*.txt", "out/deep/a.txt", true; "star crosses separators like fnmatch")]
    #[test_case("a?.txt", "ab.txt", true)]
    #[test_case("a?.txt", "abc.txt", false)]
    #[test_case("file[0-9].dat", "file7.dat", true)]
    #[test_case("file[0-9].dat", "filex.dat", false)]
    #[test_case("file[!0-9].dat", "filex.dat", true)]
    #[test_case("plain.txt", "plain.txt", true)]
    #[test_case("a.b", "axb", false; "dots are literal")]
    fn matching(pattern: &str, candidate: &str, expected: bool) {
        let re = fnmatch_regex(pattern).unwrap();
        assert_eq!(re.is_match(candidate), expected, "{pattern} vs {candidate}");
    }

    #[test]
    fn pattern_detection() {
        assert!(is_pattern("out/*.txt"));
        assert!(is_pattern("a?c"));
        assert!(is_pattern("x[12]"));
        assert!(!is_pattern("plain/path.txt"));
    }
}
