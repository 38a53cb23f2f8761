//! Environment variable expansion for command strings
//!
//! Supports `$VAR` and `${VAR}` forms. Unset variables expand to the empty
//! string, matching shell behavior for unset-but-referenced variables.

/// Expand `$VAR` / `${VAR}` references in `input`.
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some(&(_, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed && !name.is_empty() {
                    out.push_str(&std::env::var(&name).unwrap_or_default());
                } else {
                    // Unterminated or empty reference, keep it verbatim.
                    out.push_str("${");
                    out.push_str(&name);
                }
            }
            Some(&(_, c)) if c == '_' || c.is_ascii_alphabetic() => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c == '_' || c.is_ascii_alphanumeric() {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(&std::env::var(&name).unwrap_or_default());
            }
            _ => out.push('$'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_string_untouched() {
        assert_eq!(expand_env("/usr/bin/cachestat -1 -j"), "/usr/bin/cachestat -1 -j");
    }

    #[test]
    fn test_braced_expansion() {
        unsafe { std::env::set_var("CACHEMON_TEST_A", "aaa") };
        assert_eq!(expand_env("x ${CACHEMON_TEST_A} y"), "x aaa y");
    }

    #[test]
    fn test_bare_expansion() {
        unsafe { std::env::set_var("CACHEMON_TEST_B", "bbb") };
        assert_eq!(expand_env("$CACHEMON_TEST_B/bin"), "bbb/bin");
    }

    #[test]
    fn test_unset_variable_is_empty() {
        assert_eq!(expand_env("pre${CACHEMON_TEST_UNSET_XYZ}post"), "prepost");
    }

    #[test]
    fn test_lone_dollar() {
        assert_eq!(expand_env("cost: 3$"), "cost: 3$");
        assert_eq!(expand_env("a $ b"), "a $ b");
    }

    #[test]
    fn test_unterminated_brace_kept() {
        assert_eq!(expand_env("${OOPS"), "${OOPS");
    }
}
