//! Header name registry.
//!
//! One constant table drives everything the parser needs to know about a
//! header: its canonical name, its one-character compact form (RFC 3261
//! §7.3.3) and whether multiple occurrences may be coalesced into one
//! comma-separated value. Recognition is a binary search over the sorted
//! names; compact forms are resolved by scanning the compact column.

pub struct HeaderEntry {
    pub name: &'static str,
    pub compact: Option<char>,
    pub coalesces: bool,
}

const fn entry(
    name: &'static str,
    compact: Option<char>,
    coalesces: bool,
) -> HeaderEntry {
    HeaderEntry {
        name,
        compact,
        coalesces,
    }
}

// Sorted case-insensitively by name; `lookup` relies on the order.
pub static HEADERS: &[HeaderEntry] = &[
    entry("Accept", None, true),
    entry("Accept-Contact", Some('a'), true),
    entry("Accept-Encoding", None, true),
    entry("Accept-Language", None, true),
    entry("Alert-Info", None, true),
    entry("Allow", None, true),
    entry("Authentication-Info", None, true),
    entry("Authorization", None, false),
    entry("Call-ID", Some('i'), true),
    entry("Call-Info", None, true),
    entry("Contact", Some('m'), true),
    entry("Content-Disposition", None, true),
    entry("Content-Encoding", Some('e'), true),
    entry("Content-Language", None, true),
    entry("Content-Length", Some('l'), true),
    entry("Content-Type", Some('c'), true),
    entry("CSeq", None, true),
    entry("Date", None, true),
    entry("Error-Info", None, true),
    entry("Event", Some('o'), true),
    entry("Expires", None, true),
    entry("From", Some('f'), true),
    entry("In-Reply-To", None, true),
    entry("Max-Forwards", None, true),
    entry("MIME-Version", None, true),
    entry("Min-Expires", None, true),
    entry("Organization", None, true),
    entry("Priority", None, true),
    entry("Proxy-Authenticate", None, false),
    entry("Proxy-Authorization", None, false),
    entry("Proxy-Require", None, true),
    entry("Record-Route", None, true),
    entry("Refer-To", Some('r'), true),
    entry("Referred-By", Some('b'), true),
    entry("Reject-Contact", Some('j'), true),
    entry("Reply-To", None, true),
    entry("Request-Disposition", Some('d'), true),
    entry("Require", None, true),
    entry("Retry-After", None, true),
    entry("Route", None, true),
    entry("Server", None, true),
    entry("Session-Expires", Some('x'), true),
    entry("Subject", Some('s'), true),
    entry("Supported", Some('k'), true),
    entry("Timestamp", None, true),
    entry("To", Some('t'), true),
    entry("Unsupported", None, true),
    entry("User-Agent", None, true),
    entry("Via", Some('v'), true),
    entry("Warning", None, true),
    entry("WWW-Authenticate", None, false),
];

// Headers whose values follow the name-addr grammar and get the address
// normalization treatment on parse.
static CONTACT_LIKE: &[&str] =
    &["Contact", "From", "Record-Route", "Reply-To", "Route", "To"];

fn ci_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

pub fn lookup(name: &str) -> Option<&'static HeaderEntry> {
    HEADERS
        .binary_search_by(|e| ci_cmp(e.name, name))
        .ok()
        .map(|i| &HEADERS[i])
}

pub fn expand_compact(compact: char) -> Option<&'static str> {
    let compact = compact.to_ascii_lowercase();
    HEADERS
        .iter()
        .find(|e| e.compact == Some(compact))
        .map(|e| e.name)
}

/// Resolves a header name as written on the wire to its canonical form:
/// single characters expand through the compact table, known long names map
/// to the registry spelling, anything else passes through untouched.
pub fn canonical_name(name: &str) -> &str {
    let mut chars = name.chars();
    if let (Some(c), None) = (chars.next(), chars.next()) {
        if let Some(full) = expand_compact(c) {
            return full;
        }
    }
    name
}

pub fn is_non_coalescing(name: &str) -> bool {
    lookup(name).map(|e| !e.coalesces).unwrap_or(false)
}

pub fn is_contact_like(name: &str) -> bool {
    CONTACT_LIKE.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A delimiter-returning tokenizer with quote awareness, used by the address
/// normalizer and the coalesced-value splitter. Inside a double-quoted
/// string, delimiters lose their meaning and `\` escapes the next character.
pub(crate) struct Tokenizer<'a> {
    input: &'a str,
    delims: &'static [u8],
    pos: usize,
}

pub(crate) enum Token<'a> {
    Delim(u8),
    Text(&'a str),
}

impl<'a> Tokenizer<'a> {
    pub fn new(input: &'a str, delims: &'static [u8]) -> Tokenizer<'a> {
        Tokenizer {
            input,
            delims,
            pos: 0,
        }
    }

    pub fn next_token(&mut self) -> Option<Token<'a>> {
        let bytes = self.input.as_bytes();
        if self.pos >= bytes.len() {
            return None;
        }
        if self.delims.contains(&bytes[self.pos]) {
            let d = bytes[self.pos];
            self.pos += 1;
            return Some(Token::Delim(d));
        }

        let start = self.pos;
        let mut in_quote = false;
        let mut in_angle = false;
        while self.pos < bytes.len() {
            let b = bytes[self.pos];
            if in_quote {
                match b {
                    b'\\' if self.pos + 1 < bytes.len() => self.pos += 1,
                    b'"' => in_quote = false,
                    _ => {}
                }
            } else if in_angle {
                if b == b'>' {
                    in_angle = false;
                }
            } else if b == b'"' {
                in_quote = true;
            } else if b == b'<' {
                in_angle = true;
            } else if self.delims.contains(&b) {
                break;
            }
            self.pos += 1;
        }
        Some(Token::Text(&self.input[start..self.pos]))
    }
}

/// Splits a coalescable header value at top-level commas, honoring quoted
/// strings and `<...>` groups. Returns byte spans into `value`, trimmed of
/// surrounding whitespace; empty items are dropped.
pub(crate) fn split_coalesced(value: &str) -> Vec<(usize, usize)> {
    let bytes = value.as_bytes();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut pos = 0usize;
    let mut in_quote = false;
    let mut in_angle = false;

    let mut push = |begin: usize, end: usize, spans: &mut Vec<(usize, usize)>| {
        let mut b = begin;
        let mut e = end;
        while b < e && bytes[b].is_ascii_whitespace() {
            b += 1;
        }
        while e > b && bytes[e - 1].is_ascii_whitespace() {
            e -= 1;
        }
        if b < e {
            spans.push((b, e));
        }
    };

    while pos < bytes.len() {
        let b = bytes[pos];
        if in_quote {
            match b {
                b'\\' if pos + 1 < bytes.len() => pos += 1,
                b'"' => in_quote = false,
                _ => {}
            }
        } else if in_angle {
            if b == b'>' {
                in_angle = false;
            }
        } else if b == b'"' {
            in_quote = true;
        } else if b == b'<' {
            in_angle = true;
        } else if b == b',' {
            push(start, pos, &mut spans);
            start = pos + 1;
        }
        pos += 1;
    }
    push(start, bytes.len(), &mut spans);
    spans
}
