// Copyright (c) 2019 Parity Technologies (UK) Ltd.
//
// Licensed under the Apache License, Version 2.0
// <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0> or the MIT
// license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. All files in the project carrying such notice may not be copied,
// modified, or distributed except according to those terms.

//! Quote-aware tokenizing of HTTP header values.

use std::borrow::Cow;

/// Split `s` at every `delim` which is not inside a double-quoted string.
///
/// Tokens are trimmed and empty tokens are skipped. Quotes are retained,
/// use [`unquote`] to remove them.
pub fn split_quoted(s: &str, delim: char) -> Tokens<'_> {
    Tokens { rest: s, delim }
}

/// Iterator returned by [`split_quoted`].
#[derive(Debug, Clone)]
pub struct Tokens<'a> {
    rest: &'a str,
    delim: char
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while !self.rest.is_empty() {
            let mut quoted = false;
            let mut escaped = false;
            let mut end = self.rest.len();
            for (i, c) in self.rest.char_indices() {
                if escaped {
                    escaped = false;
                    continue
                }
                match c {
                    '\\' if quoted => escaped = true,
                    '"' => quoted = !quoted,
                    c if c == self.delim && !quoted => {
                        end = i;
                        break
                    }
                    _ => {}
                }
            }
            let token = self.rest[.. end].trim();
            self.rest = self.rest.get(end + self.delim.len_utf8() ..).unwrap_or("");
            if !token.is_empty() {
                return Some(token)
            }
        }
        None
    }
}

/// Remove surrounding double quotes and resolve backslash escapes.
///
/// Values which are not quoted are returned trimmed but otherwise as is.
pub fn unquote(s: &str) -> Cow<'_, str> {
    let s = s.trim();
    if s.len() < 2 || !s.starts_with('"') || !s.ends_with('"') {
        return Cow::Borrowed(s)
    }
    let inner = &s[1 .. s.len() - 1];
    if !inner.contains('\\') {
        return Cow::Borrowed(inner)
    }
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next)
            }
        } else {
            out.push(c)
        }
    }
    Cow::Owned(out)
}

/// Quote `s` if it contains characters which are not valid in an HTTP token.
pub fn quote_if_needed(s: &str) -> Cow<'_, str> {
    let is_token = !s.is_empty() && s.bytes().all(|b| {
        b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
    });
    if is_token {
        return Cow::Borrowed(s)
    }
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\')
        }
        out.push(c)
    }
    out.push('"');
    Cow::Owned(out)
}

#[cfg(test)]
mod tests {
    use super::{quote_if_needed, split_quoted, unquote};

    #[test]
    fn commas_inside_quotes_do_not_split() {
        let tokens: Vec<_> = split_quoted(r#"a, b; p=1, "c,d""#, ',').map(unquote).collect();
        assert_eq!(vec!["a", "b; p=1", "c,d"], tokens)
    }

    #[test]
    fn empty_tokens_are_skipped() {
        let tokens: Vec<_> = split_quoted(" , a,, b ,", ',').collect();
        assert_eq!(vec!["a", "b"], tokens)
    }

    #[test]
    fn escaped_quote_does_not_terminate() {
        let tokens: Vec<_> = split_quoted(r#""x\",y", z"#, ',').collect();
        assert_eq!(vec![r#""x\",y""#, "z"], tokens);
        assert_eq!(r#"x",y"#, unquote(tokens[0]))
    }

    #[test]
    fn quoting_roundtrip() {
        assert_eq!("15", quote_if_needed("15"));
        assert_eq!(r#""a,b""#, quote_if_needed("a,b"));
        assert_eq!("a,b", unquote(&quote_if_needed("a,b")))
    }
}
