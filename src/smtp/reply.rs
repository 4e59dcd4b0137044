// Copyright 2022 OpenStax Poland
// Licensed under the MIT license. See LICENSE file in the project root for
// full license text.

//! SMTP replies ([RFC 5321 section 4.2](
//! https://datatracker.ietf.org/doc/html/rfc5321#section-4.2))

use std::borrow::Cow;

/// A numeric reply code with one or more lines of text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    code: u16,
    lines: Vec<Cow<'static, str>>,
}

impl Reply {
    pub fn new(code: u16, line: impl Into<Cow<'static, str>>) -> Self {
        let line: Cow<'static, str> = line.into();
        Reply::multiline(code, [line])
    }

    pub fn multiline<L>(code: u16, lines: impl IntoIterator<Item = L>) -> Self
    where
        L: Into<Cow<'static, str>>,
    {
        debug_assert!((100..=599).contains(&code), "invalid reply code {code}");

        let mut lines: Vec<Cow<'static, str>> = lines.into_iter()
            .flat_map(|line| split_line_breaks(line.into()))
            .collect();
        if lines.is_empty() {
            lines.push(Cow::Borrowed(""));
        }

        Reply { code, lines }
    }

    /// Append wire form of this reply to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let last = self.lines.len() - 1;

        for (inx, line) in self.lines.iter().enumerate() {
            // Continuation lines are marked with a hyphen, the final line
            // with a space.
            let separator = if inx == last { ' ' } else { '-' };
            out.extend_from_slice(format!("{}{}{}\r\n", self.code, separator, line).as_bytes());
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// Break text containing CR or LF into separate reply lines, so that text
/// from hooks can't end a reply early
fn split_line_breaks(line: Cow<'static, str>) -> Vec<Cow<'static, str>> {
    let is_break = |c: char| c == '\r' || c == '\n';

    if !line.contains(is_break) {
        return vec![line];
    }

    let lines = line.split(is_break)
        .filter(|part| !part.is_empty())
        .map(|part| Cow::Owned(part.to_owned()))
        .collect();
    lines
}

/// Render `code` and `lines` into wire form
pub fn format_reply<S: AsRef<str>>(code: u16, lines: &[S]) -> Vec<u8> {
    Reply::multiline(code, lines.iter().map(|line| line.as_ref().to_owned())).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn single_line() {
        assert_eq!(Reply::new(250, "Ok").to_bytes(), b"250 Ok\r\n");
        assert_eq!(format_reply(221, &["mx.example.org closing connection"]),
            b"221 mx.example.org closing connection\r\n");
    }

    #[test]
    fn multiple_lines() {
        let reply = format_reply(250, &["mx.example.org", "PIPELINING", "8BITMIME"]);
        assert_eq!(
            String::from_utf8(reply).unwrap(),
            "250-mx.example.org\r\n250-PIPELINING\r\n250 8BITMIME\r\n",
        );
    }

    #[test]
    fn line_breaks_in_text_become_continuation_lines() {
        assert_eq!(
            String::from_utf8(Reply::new(451, "db down\r\n250 Ok").to_bytes()).unwrap(),
            "451-db down\r\n451 250 Ok\r\n",
        );
        assert_eq!(
            String::from_utf8(format_reply(250, &["first\nsecond", "third"])).unwrap(),
            "250-first\r\n250-second\r\n250 third\r\n",
        );
        assert_eq!(Reply::new(550, "\r\n").to_bytes(), b"550 \r\n");
    }

    #[test]
    fn empty_text() {
        assert_eq!(Reply::new(334, "").to_bytes(), b"334 \r\n");
        assert_eq!(format_reply::<&str>(334, &[]), b"334 \r\n");
    }
}
