// Copyright (c) 2026 The io-plumbing Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Shell-word codec.
//!
//! `unquote` tokenizes a command line into words the way a POSIX shell
//! tokenizes its input, minus redirections, variable expansion and
//! globbing. `quote` renders a word list back into a string that
//! `unquote` maps to the same list.

use crate::error::{Error, Result};

// Characters that may appear in a word without any quoting. `!` is
// excluded when deciding whether a word can be emitted verbatim, since
// interactive shells give it history-expansion meaning.
fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || "_!%+,-./:@^".contains(c)
}

fn quote_word(word: &str) -> Result<String> {
    if word.contains('\0') {
        return Err(Error::Configuration(
            "cannot quote a word containing a NUL byte".to_string(),
        ));
    }

    if word.is_empty() {
        return Ok("''".to_string());
    }

    if word.contains('\'') {
        // Single quotes cannot appear inside single quotes; fall back to
        // escaping every byte that needs it.
        let mut out = String::with_capacity(word.len() * 2);
        for c in word.chars() {
            if !is_safe(c) {
                out.push('\\');
            }
            out.push(c);
        }
        return Ok(out);
    }

    if word.chars().any(|c| !is_safe(c) || c == '!') {
        return Ok(format!("'{}'", word));
    }

    Ok(word.to_string())
}

/// Render `words` as a single shell-safe command line.
pub fn quote<S: AsRef<str>>(words: &[S]) -> Result<String> {
    let quoted: Result<Vec<String>> = words.iter().map(|w| quote_word(w.as_ref())).collect();
    Ok(quoted?.join(" "))
}

/// Split a command line into words, honoring single quotes, double
/// quotes and backslash escapes. Adjacent fragments concatenate into one
/// word; whitespace separates words.
pub fn unquote(input: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut word = String::new();
    // Distinguishes "no fragment yet" from an accumulated empty word, so
    // that '' produces an empty argument instead of nothing.
    let mut open = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                open = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(ch) => word.push(ch),
                        None => {
                            return Err(Error::Parse(format!(
                                "unterminated single quote in {:?}",
                                input
                            )))
                        }
                    }
                }
            }
            '"' => {
                open = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(ch) => word.push(ch),
                            None => {
                                return Err(Error::Parse(format!(
                                    "unterminated double quote in {:?}",
                                    input
                                )))
                            }
                        },
                        Some(ch) => word.push(ch),
                        None => {
                            return Err(Error::Parse(format!(
                                "unterminated double quote in {:?}",
                                input
                            )))
                        }
                    }
                }
            }
            '\\' => {
                open = true;
                match chars.next() {
                    Some(ch) => word.push(ch),
                    None => {
                        return Err(Error::Parse(format!("trailing backslash in {:?}", input)))
                    }
                }
            }
            ch if ch.is_whitespace() => {
                if open {
                    words.push(std::mem::take(&mut word));
                    open = false;
                }
            }
            ch => {
                open = true;
                word.push(ch);
            }
        }
    }

    if open {
        words.push(word);
    }

    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(&["hi'there"], "hi\\'there")]
    #[case(&["foo>bar"], "'foo>bar'")]
    #[case(&["foo!bar"], "'foo!bar'")]
    #[case(&["cat", "-e"], "cat -e")]
    #[case(&["a b", "c"], "'a b' c")]
    #[case(&[""], "''")]
    #[case(&["s/$/bar/"], "'s/$/bar/'")]
    fn test_quote(#[case] words: &[&str], #[case] expect: &str) {
        assert_eq!(quote(words).unwrap(), expect);
    }

    #[test]
    fn test_quote_rejects_nul() {
        assert!(quote(&["a\0b"]).is_err());
    }

    #[test]
    fn test_unquote() {
        #[derive(Debug)]
        struct TestData<'a> {
            input: &'a str,
            expect: &'a [&'a str],
        }

        let tests = &[
            TestData {
                input: "cat -e",
                expect: &["cat", "-e"],
            },
            TestData {
                input: "  spaced   out  ",
                expect: &["spaced", "out"],
            },
            TestData {
                input: "'single quoted'",
                expect: &["single quoted"],
            },
            TestData {
                // No escapes inside single quotes.
                input: r"'back\slash'",
                expect: &[r"back\slash"],
            },
            TestData {
                input: r#""double \" quote""#,
                expect: &[r#"double " quote"#],
            },
            TestData {
                input: r"esc\ aped",
                expect: &["esc aped"],
            },
            TestData {
                // Adjacent fragments concatenate.
                input: r#"a'b'"c"\d"#,
                expect: &["abcd"],
            },
            TestData {
                input: "''",
                expect: &[""],
            },
            TestData {
                input: "",
                expect: &[],
            },
            TestData {
                input: "   ",
                expect: &[],
            },
        ];

        for (i, d) in tests.iter().enumerate() {
            let msg = format!("test[{}]: {:?}", i, d);
            let got = unquote(d.input).unwrap_or_else(|e| panic!("{}: {}", msg, e));
            assert_eq!(got, d.expect, "{}", msg);
        }
    }

    #[test]
    fn test_unquote_errors() {
        assert!(unquote("'oops").is_err());
        assert!(unquote("\"oops").is_err());
        assert!(unquote("\"oops\\").is_err());
        assert!(unquote("oops\\").is_err());
    }

    #[test]
    fn test_round_trip() {
        let cases: &[&[&str]] = &[
            &["cat", "-e"],
            &["hi'there"],
            &["foo>bar", "two words", ""],
            &["dd", "if=/dev/zero", "bs=1k", "count=200"],
            &["we\"ird", "mix'of\tstuff"],
            &["newline\nin word"],
        ];
        for ws in cases {
            let line = quote(ws).unwrap();
            let back = unquote(&line).unwrap();
            assert_eq!(&back, ws, "through {:?}", line);
        }
    }
}
