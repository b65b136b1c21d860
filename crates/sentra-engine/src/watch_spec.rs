//! Watch specification parsing.
//!
//! A watch specification is one or more directory roots separated by `;` or
//! `|`, with environment variables expanded (`%VAR%`, `${VAR}` or `$VAR`)
//! and surrounding whitespace trimmed. Empty segments are dropped.

use std::env;
use std::path::PathBuf;

/// Parse a watch specification into directory roots.
pub fn parse(spec: &str) -> Vec<PathBuf> {
    spec.split(|c| c == ';' || c == '|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(expand_env)
        .map(PathBuf::from)
        .collect()
}

/// Expand `%VAR%`, `${VAR}` and `$VAR` references from the environment.
/// Unknown variables are left verbatim.
fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '%' => {
                let mut name = String::new();
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '%' {
                        closed = true;
                        break;
                    }
                    name.push(next);
                }
                match (closed, name.is_empty()) {
                    (true, false) => match env::var(&name) {
                        Ok(v) => out.push_str(&v),
                        Err(_) => {
                            out.push('%');
                            out.push_str(&name);
                            out.push('%');
                        }
                    },
                    // "%%" or an unterminated reference: keep verbatim.
                    (true, true) => out.push_str("%%"),
                    (false, _) => {
                        out.push('%');
                        out.push_str(&name);
                    }
                }
            }
            '$' => {
                let braced = chars.peek() == Some(&'{');
                if braced {
                    chars.next();
                }
                let mut name = String::new();
                while let Some(&next) = chars.peek() {
                    let done = if braced {
                        next == '}'
                    } else {
                        !(next.is_ascii_alphanumeric() || next == '_')
                    };
                    if done {
                        break;
                    }
                    name.push(next);
                    chars.next();
                }
                if braced {
                    chars.next(); // consume '}'
                }
                if name.is_empty() {
                    out.push('$');
                } else {
                    match env::var(&name) {
                        Ok(v) => out.push_str(&v),
                        Err(_) => {
                            out.push('$');
                            out.push_str(&name);
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_both_separators_and_trims() {
        let roots = parse(" /srv/uploads ; /home/user/inbox | /tmp/drop ");
        assert_eq!(
            roots,
            vec![
                PathBuf::from("/srv/uploads"),
                PathBuf::from("/home/user/inbox"),
                PathBuf::from("/tmp/drop"),
            ]
        );
    }

    #[test]
    fn drops_empty_segments() {
        assert_eq!(parse(";;|"), Vec::<PathBuf>::new());
        assert_eq!(parse("/a;;/b"), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
    }

    #[test]
    fn expands_environment_variables() {
        env::set_var("SENTRA_TEST_ROOT", "/srv/watched");
        assert_eq!(
            parse("$SENTRA_TEST_ROOT/in;${SENTRA_TEST_ROOT}/out"),
            vec![
                PathBuf::from("/srv/watched/in"),
                PathBuf::from("/srv/watched/out"),
            ]
        );
        assert_eq!(
            parse("%SENTRA_TEST_ROOT%\\drop"),
            vec![PathBuf::from("/srv/watched\\drop")]
        );
        env::remove_var("SENTRA_TEST_ROOT");
    }

    #[test]
    fn unknown_variables_stay_verbatim() {
        assert_eq!(
            parse("/data/$SENTRA_NO_SUCH_VAR/x"),
            vec![PathBuf::from("/data/$SENTRA_NO_SUCH_VAR/x")]
        );
        assert_eq!(
            parse("%SENTRA_NO_SUCH_VAR%"),
            vec![PathBuf::from("%SENTRA_NO_SUCH_VAR%")]
        );
    }
}
