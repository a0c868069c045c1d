use std::collections::HashSet;
use std::fmt;
use std::fmt::Display;

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use strum_macros::EnumString;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::header;
use crate::transport::{EndPoint, TransportType};

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Hash,
    Serialize,
    Deserialize,
)]
pub enum Method {
    INVITE,
    REGISTER,
    CANCEL,
    ACK,
    BYE,
    SUBSCRIBE,
    REFER,
    INFO,
    NOTIFY,
    PUBLISH,
    OPTIONS,
    MESSAGE,
    UPDATE,
    PRACK,
}

impl Default for Method {
    fn default() -> Self {
        Method::INVITE
    }
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message is not a request")]
    NotRequest,
    #[error("message is not a response")]
    NotResponse,
    #[error("no via header in message")]
    NoVia,
    #[error("invalid message")]
    InvalidMessage,
    #[error("invalid via header")]
    InvalidVia,
    #[error("invalid uri")]
    InvalidUri,
    #[error("invalid address")]
    InvalidAddress,
    #[error("embedded nul in header")]
    EmbeddedNul,
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Cseq {
    pub seq: i64,
    pub method: Method,
}

impl FromStr for Cseq {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (seq, method) = s
            .trim()
            .split_once(' ')
            .ok_or(MessageError::InvalidMessage)?;
        let seq = seq
            .parse::<i64>()
            .map_err(|_| MessageError::InvalidMessage)?;
        if seq < 0 {
            return Err(MessageError::InvalidMessage);
        }
        let method =
            Method::from_str(method.trim().to_ascii_uppercase().as_str())
                .map_err(|_| MessageError::InvalidMessage)?;
        Ok(Cseq { seq, method })
    }
}

impl Display for Cseq {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.seq, self.method)
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Via {
    pub transport: TransportType,
    pub host: String,
    pub port: Option<u16>,
    pub branch: String,
    pub received: Option<String>,
    pub rport: Option<u16>,
    pub params: IndexMap<String, Option<String>>,
}

impl FromStr for Via {
    type Err = MessageError;

    // "SIP/2.0/<transport> sent-by[;params]"
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (proto, rest) = s
            .trim()
            .split_once(' ')
            .ok_or(MessageError::InvalidVia)?;

        let mut segments = proto.split('/');
        let name = segments.next();
        let version = segments.next();
        let transport = segments.next();
        if segments.next().is_some() {
            return Err(MessageError::InvalidVia);
        }
        let transport = match (name, version, transport) {
            (Some(name), Some(_version), Some(transport))
                if name.eq_ignore_ascii_case("sip") =>
            {
                TransportType::from_str(transport)
                    .map_err(|_| MessageError::InvalidVia)?
            }
            _ => return Err(MessageError::InvalidVia),
        };

        let rest = rest.trim_start();
        let (sent_by, param_str) = match rest.split_once(';') {
            Some((sent_by, params)) => (sent_by, params),
            None => (rest, ""),
        };
        let (host, port) =
            parse_host_port(sent_by).map_err(|_| MessageError::InvalidVia)?;

        let mut via = Via {
            transport,
            host,
            port,
            ..Default::default()
        };
        for (name, value) in split_params(param_str) {
            match name {
                "branch" => via.branch = value.unwrap_or_default().to_string(),
                "received" => via.received = value.map(str::to_string),
                "rport" => via.rport = value.and_then(|v| v.parse().ok()),
                _ => {
                    via.params
                        .insert(name.to_string(), value.map(str::to_string));
                }
            }
        }

        Ok(via)
    }
}

impl Display for Via {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "SIP/2.0/{} {}",
            self.transport.to_string().to_uppercase(),
            self.host
        )?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if let Some(ref received) = self.received {
            write!(f, ";received={}", received)?;
        }
        if let Some(rport) = self.rport {
            write!(f, ";rport={}", rport)?;
        }
        if !self.branch.is_empty() {
            write!(f, ";branch={}", self.branch)?;
        }
        for (name, value) in self.params.iter() {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

impl Via {
    /// The host:port pair declared by this Via, as written on the wire.
    pub fn sent_by(&self) -> String {
        match self.port {
            Some(p) => format!("{}:{}", self.host, p),
            None => self.host.clone(),
        }
    }

    /// Where a response to the message carrying this Via must be sent,
    /// honoring the `received` and `rport` parameters.
    pub fn response_endpoint(&self) -> EndPoint {
        let host = self.received.clone().unwrap_or_else(|| self.host.clone());
        let port = self
            .rport
            .or(self.port)
            .unwrap_or_else(|| self.transport.default_port());
        EndPoint::new(host, port, self.transport)
    }
}

// Splits "host", "host:port" or "[v6]:port"; the port must be all digits.
fn parse_host_port(s: &str) -> Result<(String, Option<u16>), MessageError> {
    let s = s.trim();
    if let Some(rest) = s.strip_prefix('[') {
        let end = rest.find(']').ok_or(MessageError::InvalidUri)?;
        let host = format!("[{}]", &rest[..end]);
        let after = &rest[end + 1..];
        if after.is_empty() {
            return Ok((host, None));
        }
        let port = after
            .strip_prefix(':')
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or(MessageError::InvalidUri)?;
        return Ok((host, Some(port)));
    }
    match s.rsplit_once(':') {
        Some((host, port))
            if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) =>
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| MessageError::InvalidUri)?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((s.to_string(), None)),
    }
}

// Walks a ";"-separated parameter string as (name, value) pairs; empty
// segments are skipped.
fn split_params(s: &str) -> impl Iterator<Item = (&str, Option<&str>)> {
    s.split(';').filter(|p| !p.is_empty()).map(|p| {
        match p.split_once('=') {
            Some((name, value)) => (name.trim(), Some(value.trim())),
            None => (p.trim(), None),
        }
    })
}

/// Just enough of a SIP URI for the core: the endpoint a request resolves
/// to (host, port, transport), the user part carried through Contact
/// rewrites, and the remaining params held as written. Anything after `?`
/// is kept opaque.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Uri {
    pub scheme: String,
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub transport: TransportType,
    pub params: IndexMap<String, Option<String>>,
    pub headers: Option<String>,
}

impl FromStr for Uri {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .trim()
            .split_once(':')
            .ok_or(MessageError::InvalidUri)?;
        let mut chars = scheme.chars();
        let scheme_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || "+-.".contains(c));
        if !scheme_ok {
            return Err(MessageError::InvalidUri);
        }

        let (rest, headers) = match rest.split_once('?') {
            Some((rest, headers)) => (rest, Some(headers.to_string())),
            None => (rest, None),
        };
        let (addr, param_str) = match rest.split_once(';') {
            Some((addr, params)) => (addr, params),
            None => (rest, ""),
        };
        let (user, hostport) = match addr.split_once('@') {
            Some((user, hostport)) => (Some(user.to_string()), hostport),
            None => (None, addr),
        };
        let (host, port) = parse_host_port(hostport)?;

        let mut uri = Uri {
            scheme: scheme.to_string(),
            user,
            host,
            port,
            headers,
            ..Default::default()
        };
        for (name, value) in split_params(param_str) {
            match name {
                "transport" => {
                    uri.transport = match value {
                        Some(value) => TransportType::from_str(value)
                            .map_err(|_| MessageError::InvalidUri)?,
                        None => TransportType::Udp,
                    };
                }
                _ => {
                    uri.params
                        .insert(name.to_string(), value.map(str::to_string));
                }
            }
        }

        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let scheme = if self.scheme.is_empty() {
            "sip"
        } else {
            &self.scheme
        };
        write!(f, "{}:", scheme)?;
        if let Some(ref user) = self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if self.transport != TransportType::Udp {
            write!(
                f,
                ";transport={}",
                self.transport.to_string().to_lowercase()
            )?;
        }
        for (name, value) in self.params.iter() {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        if let Some(ref headers) = self.headers {
            write!(f, "?{}", headers)?;
        }
        Ok(())
    }
}

impl Uri {
    pub fn get_port(&self) -> u16 {
        match self.port {
            Some(port) => port,
            None => self.transport.default_port(),
        }
    }

    pub fn endpoint(&self) -> EndPoint {
        EndPoint::new(self.host.clone(), self.get_port(), self.transport)
    }
}

#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Address {
    pub display_name: String,
    pub uri: Uri,
    pub tag: Option<String>,
    pub params: IndexMap<String, Option<String>>,
    pub expires: Option<i64>,
}

// Position of the closing quote of a display name, honoring `\` escapes.
fn find_closing_quote(s: &str) -> Result<usize, MessageError> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return Ok(i),
            _ => i += 1,
        }
    }
    Err(MessageError::InvalidAddress)
}

impl FromStr for Address {
    type Err = MessageError;

    // Parses the canonical name-addr shapes the normalizer emits, plus a
    // bare addr-spec: `["name"] <uri>[;params]` or `uri[;params]`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (display_name, rest) = if let Some(inner) = s.strip_prefix('"') {
            let end = find_closing_quote(inner)?;
            (inner[..end].to_string(), inner[end + 1..].trim_start())
        } else if let Some(lt) = s.find('<') {
            (s[..lt].trim().to_string(), &s[lt..])
        } else {
            (String::new(), s)
        };

        let (spec, param_str) = if let Some(rest) = rest.strip_prefix('<') {
            let end = rest.find('>').ok_or(MessageError::InvalidAddress)?;
            let after = rest[end + 1..].trim_start();
            (&rest[..end], after.strip_prefix(';').unwrap_or(""))
        } else {
            // A bare addr-spec: everything after ';' belongs to the header
            // field, not the URI.
            match rest.split_once(';') {
                Some((spec, params)) => (spec.trim_end(), params),
                None => (rest, ""),
            }
        };

        let mut address = Address {
            display_name,
            uri: Uri::from_str(spec)?,
            ..Default::default()
        };
        for (name, value) in split_params(param_str) {
            match name {
                "tag" => address.tag = value.map(str::to_string),
                "expires" => {
                    address.expires = value.and_then(|v| v.parse().ok());
                }
                _ => {
                    address
                        .params
                        .insert(name.to_string(), value.map(str::to_string));
                }
            }
        }
        Ok(address)
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.display_name.is_empty() {
            write!(f, r#""{}" "#, self.display_name)?;
        }
        write!(f, "<{}>", self.uri)?;
        if let Some(ref tag) = self.tag {
            write!(f, ";tag={}", tag)?;
        }
        if let Some(expires) = self.expires {
            write!(f, ";expires={}", expires)?;
        }
        for (name, value) in self.params.iter() {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Clone, Debug)]
enum StartLine {
    Request { method: Method, uri: Uri },
    Response { code: i32 },
}

/// One slot of the header index: byte spans into the raw header block. A
/// slot whose name span is empty continues the value list of the nearest
/// preceding named slot.
#[derive(Clone, Copy, Debug)]
struct HeaderSlot {
    name: (usize, usize),
    value: (usize, usize),
}

impl HeaderSlot {
    fn is_continuation(&self) -> bool {
        self.name.0 == self.name.1
    }
}

/// A parsed SIP message.
///
/// The canonical state is `raw_headers`: the normalized start line and
/// header lines, each terminated by one NUL, the whole block terminated by a
/// second trailing NUL. `parsed` indexes into that block and is rebuilt,
/// together with the block itself, on every mutation.
#[derive(Clone, Debug)]
pub struct Message {
    direction: Direction,
    start: StartLine,
    raw_headers: String,
    parsed: Vec<HeaderSlot>,
    body: Option<String>,
}

impl FromStr for Message {
    type Err = Error;

    fn from_str(s: &str) -> Result<Message, Error> {
        Message::from_wire(s)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line())?;
        for (name, value) in self.header_lines() {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        write!(f, "\r\n")?;
        if let Some(ref body) = self.body {
            write!(f, "{}", body)?;
        }
        Ok(())
    }
}

impl Message {
    /// Parses the normalized representation: header lines separated by a
    /// single NUL, the block terminated by a double NUL.
    pub fn parse(raw_input: &str) -> Result<Message, MessageError> {
        Self::parse_internal(raw_input, Direction::Incoming)
    }

    /// Parses CRLF-separated wire text, unfolding folded lines and
    /// attaching up to Content-Length bytes of body.
    pub fn from_wire(text: &str) -> Result<Message, Error> {
        let (head, rest) = match text.find("\r\n\r\n") {
            Some(i) => (&text[..i], &text[i + 4..]),
            None => match text.find("\n\n") {
                Some(i) => (&text[..i], &text[i + 2..]),
                None => (text, ""),
            },
        };

        let mut lines: Vec<String> = Vec::new();
        for line in head.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.starts_with(' ') || line.starts_with('\t') {
                if let Some(last) = lines.last_mut() {
                    last.push(' ');
                    last.push_str(line.trim());
                }
            } else if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if lines.is_empty() {
            Err(MessageError::InvalidMessage)?;
        }
        let mut raw = lines.join("\0");
        raw.push_str("\0\0");

        let mut msg = Self::parse_internal(&raw, Direction::Incoming)?;
        let length = msg.get_content_length();
        if length > 0 && !rest.is_empty() {
            let mut take = (length as usize).min(rest.len());
            while take < rest.len() && !rest.is_char_boundary(take) {
                take += 1;
            }
            msg.body = Some(rest[..take].to_string());
        }
        Ok(msg)
    }

    /// Reads one message off a stream transport: the header block up to the
    /// empty line, then exactly Content-Length body bytes.
    pub async fn read_from<R: AsyncBufRead + Unpin>(
        reader: &mut R,
    ) -> Result<Message> {
        let mut head = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(anyhow!("connection eof"));
            }
            if !line.trim().is_empty() {
                break;
            }
        }
        head.push_str(&line);
        loop {
            line.clear();
            let n = reader.read_line(&mut line).await?;
            if n == 0 {
                return Err(anyhow!("connection eof"));
            }
            if line.trim().is_empty() {
                break;
            }
            head.push_str(&line);
        }

        let mut msg = Message::from_wire(&head)?;
        let length = msg.get_content_length();
        if length > 0 {
            let mut buf = vec![0u8; length as usize];
            reader.read_exact(&mut buf).await?;
            msg.body = Some(String::from_utf8(buf)?);
        }
        Ok(msg)
    }

    /// Starts an outgoing request with the given method and request-URI.
    pub fn request(method: Method, uri: &str) -> Result<Message> {
        let uri = Uri::from_str(uri)?;
        let raw = format!("{} {} SIP/2.0", method, uri);
        Ok(Self::parse_internal(&raw, Direction::Outgoing)?)
    }

    /// Starts an outgoing response to `request`, copying the headers a
    /// response echoes back: Via, To, From, Call-ID and CSeq.
    pub fn response_from(
        request: &Message,
        code: i32,
        reason: &str,
    ) -> Result<Message> {
        if !request.is_request() {
            Err(MessageError::NotRequest)?;
        }
        let mut raw = format!("SIP/2.0 {} {}", code, reason);
        raw.push('\0');
        for (name, value) in request.header_lines() {
            if ["Via", "To", "From", "Call-ID", "CSeq"]
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name))
            {
                raw.push_str(name);
                raw.push_str(": ");
                raw.push_str(value);
                raw.push('\0');
            }
        }
        raw.push('\0');
        Ok(Self::parse_internal(&raw, Direction::Outgoing)?)
    }

    fn parse_internal(
        raw_input: &str,
        direction: Direction,
    ) -> Result<Message, MessageError> {
        let start_end = raw_input.find('\0').unwrap_or(raw_input.len());
        let (start, mut raw_headers) =
            Self::parse_start_line(&raw_input[..start_end])?;
        raw_headers.push('\0');
        let headers_begin = raw_headers.len();

        if start_end < raw_input.len() {
            Self::normalize_headers(
                &raw_input[start_end + 1..],
                &mut raw_headers,
            )?;
        } else {
            raw_headers.push('\0');
        }

        let mut parsed = Vec::new();
        let mut pos = headers_begin;
        while pos < raw_headers.len() {
            let line_end = raw_headers[pos..]
                .find('\0')
                .map(|i| pos + i)
                .unwrap_or(raw_headers.len());
            if line_end == pos {
                break;
            }
            Self::index_line(&raw_headers, pos, line_end, &mut parsed);
            pos = line_end + 1;
        }

        Ok(Message {
            direction,
            start,
            raw_headers,
            parsed,
            body: None,
        })
    }

    fn index_line(
        raw: &str,
        line_begin: usize,
        line_end: usize,
        parsed: &mut Vec<HeaderSlot>,
    ) {
        let line = &raw[line_begin..line_end];
        let colon = match line.find(':') {
            Some(i) => i,
            None => return,
        };
        let name = (line_begin, line_begin + colon);
        let value_begin = (line_begin + colon + 2).min(line_end);
        let value = (value_begin, line_end);

        let name_str = &raw[name.0..name.1];
        let value_str = &raw[value.0..value.1];
        if value_str.is_empty() || header::is_non_coalescing(name_str) {
            parsed.push(HeaderSlot { name, value });
            return;
        }
        let spans = header::split_coalesced(value_str);
        if spans.is_empty() {
            parsed.push(HeaderSlot { name, value });
            return;
        }
        for (i, &(b, e)) in spans.iter().enumerate() {
            parsed.push(HeaderSlot {
                name: if i == 0 { name } else { (0, 0) },
                value: (value.0 + b, value.0 + e),
            });
        }
    }

    fn normalize_headers(
        input: &str,
        out: &mut String,
    ) -> Result<(), MessageError> {
        for line in input.split('\0') {
            if line.is_empty() {
                break;
            }
            let colon = match line.find(':') {
                Some(i) => i,
                None => continue,
            };
            let name = line[..colon].trim();
            if name.is_empty() {
                continue;
            }
            let value = line[colon + 1..].trim();
            let name = header::canonical_name(name);
            out.push_str(name);
            out.push_str(": ");
            if header::is_contact_like(name) {
                if name.eq_ignore_ascii_case("contact") && value == "*" {
                    out.push('*');
                } else {
                    Self::normalize_contact_like(value, out)?;
                }
            } else {
                out.push_str(value);
            }
            out.push('\0');
        }
        out.push('\0');
        Ok(())
    }

    // Canonicalizes a contact-like value: bare sip:/sips: URIs get angle
    // brackets, bare tokens collect into one quoted display name, and the
    // malformed shapes (second display name, second addr-spec, trailing
    // token after the addr-spec) reject the message.
    fn normalize_contact_like(
        value: &str,
        out: &mut String,
    ) -> Result<(), MessageError> {
        let mut next_is_param = false;
        let mut had_quoted = false;
        let mut had_address = false;
        let mut had_token = false;
        let mut t = header::Tokenizer::new(value, b"; ,");
        while let Some(token) = t.next_token() {
            match token {
                header::Token::Delim(b';') => next_is_param = true,
                header::Token::Delim(b',') => {
                    if had_token && !had_address {
                        out.push('"');
                    }
                    next_is_param = false;
                    had_quoted = false;
                    had_address = false;
                    had_token = false;
                    out.push_str(", ");
                }
                header::Token::Delim(_) => {}
                header::Token::Text(token) => {
                    if token.is_empty() {
                        continue;
                    }
                    if next_is_param {
                        out.push(';');
                        out.push_str(token);
                    } else if token.starts_with('"') {
                        if had_quoted {
                            return Err(MessageError::InvalidAddress);
                        }
                        if token.len() > 1 && !token.starts_with("\"\"") {
                            out.push_str(token);
                        }
                        had_quoted = true;
                    } else if token.starts_with('<') {
                        if had_address {
                            return Err(MessageError::InvalidAddress);
                        }
                        if had_token {
                            out.push_str("\" ");
                        } else if had_quoted {
                            out.push(' ');
                        }
                        out.push_str(token);
                        had_address = true;
                    } else {
                        if had_quoted || had_address {
                            return Err(MessageError::InvalidAddress);
                        }
                        if token.starts_with("sip:") || token.starts_with("sips:")
                        {
                            out.push('<');
                            out.push_str(token);
                            out.push('>');
                            had_address = true;
                        } else {
                            if !had_token {
                                out.push('"');
                            } else {
                                out.push(' ');
                            }
                            out.push_str(token);
                            had_token = true;
                        }
                    }
                }
            }
        }
        if had_token && !had_address {
            out.push('"');
        }
        Ok(())
    }

    fn parse_start_line(
        line: &str,
    ) -> Result<(StartLine, String), MessageError> {
        if line.len() > 4 && line[..4].eq_ignore_ascii_case("sip/") {
            Self::parse_status_line(line)
        } else {
            Self::parse_request_line(line)
        }
    }

    fn parse_request_line(
        line: &str,
    ) -> Result<(StartLine, String), MessageError> {
        let sp = line.find(' ').ok_or(MessageError::InvalidMessage)?;
        let method =
            Method::from_str(line[..sp].to_ascii_uppercase().as_str())
                .map_err(|_| MessageError::InvalidMessage)?;
        let mut raw = method.to_string();

        let rest = line[sp..].trim_start_matches(' ');
        let sp = rest.find(' ').ok_or(MessageError::InvalidMessage)?;
        let uri = Uri::from_str(&rest[..sp])
            .map_err(|_| MessageError::InvalidUri)?;
        raw.push(' ');
        raw.push_str(&uri.to_string());

        let version = rest[sp..].trim_start_matches(' ');
        if Self::parse_version(version)? != (2, 0) {
            return Err(MessageError::InvalidMessage);
        }
        raw.push_str(" SIP/2.0");

        Ok((StartLine::Request { method, uri }, raw))
    }

    fn parse_status_line(
        line: &str,
    ) -> Result<(StartLine, String), MessageError> {
        if Self::parse_version(line)? != (2, 0) {
            return Err(MessageError::InvalidMessage);
        }
        let mut raw = "SIP/2.0".to_string();

        let sp = line.find(' ').ok_or(MessageError::InvalidMessage)?;
        let rest = line[sp..].trim_start_matches(' ');
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(MessageError::InvalidMessage);
        }
        let code = rest[..digits_end]
            .parse::<i32>()
            .map_err(|_| MessageError::InvalidMessage)?;
        if !(100..=699).contains(&code) {
            return Err(MessageError::InvalidMessage);
        }
        raw.push(' ');
        raw.push_str(&rest[..digits_end]);

        let reason = rest[digits_end..].trim_start_matches(' ').trim_end();
        if !reason.is_empty() {
            raw.push(' ');
            raw.push_str(reason);
        }

        Ok((StartLine::Response { code }, raw))
    }

    fn parse_version(s: &str) -> Result<(u32, u32), MessageError> {
        let bytes = s.as_bytes();
        if bytes.len() < 4
            || !s[..3].eq_ignore_ascii_case("sip")
            || bytes[3] != b'/'
        {
            return Err(MessageError::InvalidMessage);
        }
        let rest = &s[4..];
        let dot = rest.find('.').ok_or(MessageError::InvalidMessage)?;
        let major = &rest[..dot];
        if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MessageError::InvalidMessage);
        }
        let after = &rest[dot + 1..];
        let minor_end = after
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(after.len());
        if minor_end == 0 {
            return Err(MessageError::InvalidMessage);
        }
        let major = major.parse::<u32>().map_err(|_| MessageError::InvalidMessage)?;
        let minor = after[..minor_end]
            .parse::<u32>()
            .map_err(|_| MessageError::InvalidMessage)?;
        Ok((major, minor))
    }

    fn slice(&self, span: (usize, usize)) -> &str {
        &self.raw_headers[span.0..span.1]
    }

    fn find_header(&self, from: usize, name: &str) -> Option<usize> {
        let name = header::canonical_name(name);
        (from..self.parsed.len()).find(|&i| {
            let slot = &self.parsed[i];
            !slot.is_continuation()
                && self.slice(slot.name).eq_ignore_ascii_case(name)
        })
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        !self.is_request()
    }

    pub fn method(&self) -> Option<Method> {
        match &self.start {
            StartLine::Request { method, .. } => Some(*method),
            StartLine::Response { .. } => None,
        }
    }

    pub fn request_uri(&self) -> Option<&Uri> {
        match &self.start {
            StartLine::Request { uri, .. } => Some(uri),
            StartLine::Response { .. } => None,
        }
    }

    pub fn response_code(&self) -> Option<i32> {
        match &self.start {
            StartLine::Request { .. } => None,
            StartLine::Response { code } => Some(*code),
        }
    }

    /// The reason text of the status line, empty when the response carried
    /// none.
    pub fn status_text(&self) -> String {
        let line = self.start_line();
        let mut parts = line.splitn(3, ' ');
        parts.next();
        parts.next();
        parts.next().unwrap_or("").to_string()
    }

    pub fn is_invite(&self) -> bool {
        match self.method() {
            Some(m) => m == Method::INVITE,
            None => self
                .get_cseq()
                .map(|c| c.method == Method::INVITE)
                .unwrap_or(false),
        }
    }

    pub fn start_line(&self) -> &str {
        let end = self.raw_headers.find('\0').unwrap_or(self.raw_headers.len());
        &self.raw_headers[..end]
    }

    pub fn raw_headers(&self) -> &str {
        &self.raw_headers
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Replaces the body and rewrites Content-Length to match.
    pub fn set_body(&mut self, body: &str) -> Result<(), MessageError> {
        self.body = if body.is_empty() {
            None
        } else {
            Some(body.to_string())
        };
        let length = body.len();
        self.remove_header("Content-Length")?;
        self.add_header(&format!("Content-Length: {}", length))
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.find_header(0, name).is_some()
    }

    /// Iterates the coalesced entries of `name`: one item per comma-split
    /// value across every matching header line.
    pub fn enumerate_header<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = &'a str> + 'a {
        let name = header::canonical_name(name).to_string();
        HeaderValues {
            msg: self,
            name,
            pos: 0,
            in_run: false,
        }
    }

    /// The values of every matching entry joined with ", ". Headers in the
    /// non-coalescing class should be read with `enumerate_header` instead.
    pub fn get_normalized_header(&self, name: &str) -> Option<String> {
        let mut out = String::new();
        let mut found = false;
        let mut i = 0;
        while let Some(j) = self.find_header(i, name) {
            found = true;
            if !out.is_empty() {
                out.push_str(", ");
            }
            let begin = self.parsed[j].value.0;
            let mut end = self.parsed[j].value.1;
            let mut k = j + 1;
            while k < self.parsed.len() && self.parsed[k].is_continuation() {
                end = self.parsed[k].value.1;
                k += 1;
            }
            out.push_str(&self.raw_headers[begin..end]);
            i = k;
        }
        found.then_some(out)
    }

    /// Exact (case-insensitive) match against each coalesced entry.
    pub fn has_header_value(&self, name: &str, value: &str) -> bool {
        self.enumerate_header(name)
            .any(|v| v.trim().eq_ignore_ascii_case(value.trim()))
    }

    /// The header lines as stored, one `(name, value)` pair per line with
    /// comma-separated values left intact.
    pub fn header_lines(&self) -> Vec<(&str, &str)> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < self.parsed.len() {
            let slot = &self.parsed[i];
            if slot.is_continuation() {
                i += 1;
                continue;
            }
            let begin = slot.value.0;
            let mut end = slot.value.1;
            let mut k = i + 1;
            while k < self.parsed.len() && self.parsed[k].is_continuation() {
                end = self.parsed[k].value.1;
                k += 1;
            }
            out.push((self.slice(slot.name), &self.raw_headers[begin..end]));
            i = k;
        }
        out
    }

    fn rebuild(&mut self, new_raw: String) -> Result<(), MessageError> {
        let mut rebuilt = Self::parse_internal(&new_raw, self.direction)?;
        rebuilt.body = self.body.take();
        *self = rebuilt;
        Ok(())
    }

    /// Appends one header line, given as `"Name: value"`.
    pub fn add_header(&mut self, header: &str) -> Result<(), MessageError> {
        if header.contains('\0') {
            return Err(MessageError::EmbeddedNul);
        }
        let mut new_raw =
            self.raw_headers[..self.raw_headers.len() - 1].to_string();
        new_raw.push_str(header);
        new_raw.push('\0');
        new_raw.push('\0');
        self.rebuild(new_raw)
    }

    /// Inserts one header line directly after the start line, making it the
    /// topmost header.
    pub fn push_front_header(
        &mut self,
        header: &str,
    ) -> Result<(), MessageError> {
        if header.contains('\0') {
            return Err(MessageError::EmbeddedNul);
        }
        let start_end = self
            .raw_headers
            .find('\0')
            .unwrap_or(self.raw_headers.len());
        let mut new_raw = self.raw_headers[..=start_end].to_string();
        new_raw.push_str(header);
        new_raw.push('\0');
        new_raw.push_str(&self.raw_headers[start_end + 1..]);
        self.rebuild(new_raw)
    }

    pub fn remove_header(&mut self, name: &str) -> Result<(), MessageError> {
        let mut to_remove = HashSet::new();
        to_remove.insert(header::canonical_name(name).to_ascii_lowercase());
        self.merge_without(to_remove)
    }

    pub fn remove_headers(
        &mut self,
        names: &[&str],
    ) -> Result<(), MessageError> {
        let to_remove = names
            .iter()
            .map(|n| header::canonical_name(n).to_ascii_lowercase())
            .collect();
        self.merge_without(to_remove)
    }

    /// Removes the header lines matching both name and exact value.
    pub fn remove_header_line(
        &mut self,
        name: &str,
        value: &str,
    ) -> Result<(), MessageError> {
        let name = header::canonical_name(name);
        let mut new_raw = self.start_line().to_string();
        new_raw.push('\0');
        for (line_name, line_value) in self.header_lines() {
            if line_name.eq_ignore_ascii_case(name) && line_value == value {
                continue;
            }
            new_raw.push_str(line_name);
            new_raw.push_str(": ");
            new_raw.push_str(line_value);
            new_raw.push('\0');
        }
        new_raw.push('\0');
        self.rebuild(new_raw)
    }

    pub fn replace_start_line(
        &mut self,
        new_start: &str,
    ) -> Result<(), MessageError> {
        if new_start.contains('\0') {
            return Err(MessageError::EmbeddedNul);
        }
        let mut new_raw = new_start.to_string();
        new_raw.push('\0');
        for (name, value) in self.header_lines() {
            new_raw.push_str(name);
            new_raw.push_str(": ");
            new_raw.push_str(value);
            new_raw.push('\0');
        }
        new_raw.push('\0');
        self.rebuild(new_raw)
    }

    fn merge_without(
        &mut self,
        to_remove: HashSet<String>,
    ) -> Result<(), MessageError> {
        let mut new_raw = self.start_line().to_string();
        new_raw.push('\0');
        for (name, value) in self.header_lines() {
            if to_remove.contains(&name.to_ascii_lowercase()) {
                continue;
            }
            new_raw.push_str(name);
            new_raw.push_str(": ");
            new_raw.push_str(value);
            new_raw.push('\0');
        }
        new_raw.push('\0');
        self.rebuild(new_raw)
    }

    /// Rewrites the topmost Via with the observed peer address, setting
    /// `received` and/or `rport`.
    pub fn stamp_via_received(
        &mut self,
        received: Option<&str>,
        rport: Option<u16>,
    ) -> Result<(), MessageError> {
        let mut new_raw = self.start_line().to_string();
        new_raw.push('\0');
        let mut stamped = false;
        for (name, value) in self.header_lines() {
            if !stamped && name.eq_ignore_ascii_case("via") {
                stamped = true;
                // A multi-valued Via line: only the first value is topmost.
                let spans = header::split_coalesced(value);
                let mut pieces = Vec::new();
                for (i, &(b, e)) in spans.iter().enumerate() {
                    let piece = &value[b..e];
                    if i == 0 {
                        let mut via = Via::from_str(piece)
                            .map_err(|_| MessageError::InvalidVia)?;
                        if let Some(r) = received {
                            via.received = Some(r.to_string());
                        }
                        if let Some(r) = rport {
                            via.rport = Some(r);
                        }
                        pieces.push(via.to_string());
                    } else {
                        pieces.push(piece.to_string());
                    }
                }
                new_raw.push_str(name);
                new_raw.push_str(": ");
                new_raw.push_str(&pieces.join(", "));
                new_raw.push('\0');
                continue;
            }
            new_raw.push_str(name);
            new_raw.push_str(": ");
            new_raw.push_str(value);
            new_raw.push('\0');
        }
        if !stamped {
            return Err(MessageError::NoVia);
        }
        new_raw.push('\0');
        self.rebuild(new_raw)
    }

    pub fn get_content_length(&self) -> i64 {
        self.get_int64_header("Content-Length")
    }

    pub fn get_max_forwards(&self) -> i64 {
        self.get_int64_header("Max-Forwards")
    }

    fn get_int64_header(&self, name: &str) -> i64 {
        let value = match self.enumerate_header(name).next() {
            Some(v) => v.trim(),
            None => return -1,
        };
        if value.is_empty() || value.starts_with('+') {
            return -1;
        }
        match value.parse::<i64>() {
            Ok(v) if v >= 0 => v,
            _ => -1,
        }
    }

    pub fn get_cseq(&self) -> Option<Cseq> {
        let value = self.enumerate_header("CSeq").next()?;
        Cseq::from_str(value.trim()).ok()
    }

    /// The Expires delta-seconds. Values that overflow a u32 saturate to the
    /// maximum, mirroring how RFC 2616 caches transmit an overflowed Age.
    pub fn get_expires_value(&self) -> Option<Duration> {
        let value = self.enumerate_header("Expires").next()?.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let seconds = value.parse::<u32>().unwrap_or(u32::MAX);
        Some(Duration::from_secs(seconds as u64))
    }

    pub fn call_id(&self) -> Option<&str> {
        self.enumerate_header("Call-ID").next().map(|v| v.trim())
    }

    pub fn get_from(&self) -> Option<Address> {
        let value = self.enumerate_header("From").next()?;
        Address::from_str(value).ok()
    }

    pub fn get_to(&self) -> Option<Address> {
        let value = self.enumerate_header("To").next()?;
        Address::from_str(value).ok()
    }

    pub fn get_reply_to(&self) -> Option<Address> {
        let value = self.enumerate_header("Reply-To").next()?;
        Address::from_str(value).ok()
    }

    pub fn contacts(&self) -> Vec<Address> {
        self.addresses_of("Contact")
    }

    pub fn routes(&self) -> Vec<Address> {
        self.addresses_of("Route")
    }

    pub fn record_routes(&self) -> Vec<Address> {
        self.addresses_of("Record-Route")
    }

    fn addresses_of(&self, name: &str) -> Vec<Address> {
        self.enumerate_header(name)
            .filter_map(|v| Address::from_str(v).ok())
            .collect()
    }

    pub fn topmost_via(&self) -> Result<Via, MessageError> {
        let value = self
            .enumerate_header("Via")
            .next()
            .ok_or(MessageError::NoVia)?;
        Via::from_str(value).map_err(|_| MessageError::InvalidVia)
    }
}

struct HeaderValues<'a> {
    msg: &'a Message,
    name: String,
    pos: usize,
    in_run: bool,
}

impl<'a> Iterator for HeaderValues<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        while self.pos < self.msg.parsed.len() {
            let slot = &self.msg.parsed[self.pos];
            if slot.is_continuation() {
                self.pos += 1;
                if self.in_run {
                    return Some(self.msg.slice(slot.value));
                }
                continue;
            }
            let matches = self
                .msg
                .slice(slot.name)
                .eq_ignore_ascii_case(&self.name);
            self.in_run = matches;
            self.pos += 1;
            if matches {
                return Some(self.msg.slice(slot.value));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_wire(lines: &[&str]) -> Message {
        Message::from_wire(&lines.join("\r\n")).unwrap()
    }

    #[test]
    fn via_from_string() {
        let s = "SIP/2.0/UDP 10.0.0.2;branch=testbranch";
        let via = Via::from_str(s).unwrap();
        assert_eq!(s, via.to_string());

        let s = "SIP/2.0/UDP 10.0.0.2:5080;received=10.0.0.3;rport=5090;branch=testbranch";
        let via = Via::from_str(s).unwrap();
        assert_eq!(s, via.to_string());
        assert_eq!("10.0.0.3", via.received.unwrap());
        assert_eq!(5090, via.rport.unwrap());
    }

    #[test]
    fn via_sent_by() {
        let via =
            Via::from_str("SIP/2.0/TCP 10.0.0.1:5080;branch=z9hG4bKx").unwrap();
        assert_eq!("10.0.0.1:5080", via.sent_by());
        let via = Via::from_str("SIP/2.0/UDP example.com;branch=z9hG4bKx").unwrap();
        assert_eq!("example.com", via.sent_by());
    }

    #[test]
    fn via_response_endpoint_honors_received_and_rport() {
        let via = Via::from_str(
            "SIP/2.0/UDP 10.0.0.1:5060;received=203.0.113.7;rport=33444;branch=z9hG4bKx",
        )
        .unwrap();
        let endpoint = via.response_endpoint();
        assert_eq!("203.0.113.7", endpoint.host);
        assert_eq!(33444, endpoint.port);
        assert_eq!(TransportType::Udp, endpoint.transport);

        let via = Via::from_str("SIP/2.0/TLS example.com;branch=z9hG4bKx").unwrap();
        let endpoint = via.response_endpoint();
        assert_eq!(5061, endpoint.port);
    }

    #[test]
    fn uri_from_string() {
        let s = "sip:test@test.com:5080;transport=tcp;lr;user=phone";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(s, uri.to_string());
        assert_eq!(TransportType::Tcp, uri.transport);
        assert!(uri.params.contains_key("lr"));

        let s = "sip:test@test.com:5080";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!("sip".to_string(), uri.scheme);
        assert_eq!(Some("test".to_string()), uri.user);
        assert_eq!("test.com".to_string(), uri.host);
        assert_eq!(Some(5080), uri.port);
        assert_eq!(s, uri.to_string());

        let s = "sips:test@test.com;lr";
        let uri = Uri::from_str(s).unwrap();
        assert_eq!(s, uri.to_string());
    }

    #[test]
    fn uri_default_ports() {
        assert_eq!(5060, Uri::from_str("sip:a@b").unwrap().get_port());
        assert_eq!(
            5061,
            Uri::from_str("sip:a@b;transport=tls").unwrap().get_port()
        );
        assert_eq!(
            443,
            Uri::from_str("sip:a@b;transport=wss").unwrap().get_port()
        );
    }

    #[test]
    fn address_from_string() {
        let s = r#""Test Address" <sip:test@example.net>;tag=tag"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!(s, address.to_string());
        assert_eq!("tag", address.tag.unwrap_or_default());

        let s = r#"<sip:test@example.net>;expires=3600"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!(s, address.to_string());

        let s = r#"sip:test@example.net"#;
        let address = Address::from_str(s).unwrap();
        assert_eq!("<sip:test@example.net>", address.to_string());
    }

    #[test]
    fn request_line_normalizes_method_case() {
        let msg = parse_wire(&[
            "invite sip:1012@example.com SIP/2.0",
            "Via: SIP/2.0/UDP 127.0.0.1:5090;branch=z9hG4bKa",
            "To: <sip:to@example.com>",
            "From: <sip:from@example.com>;tag=x",
            "Call-ID: testcallid",
            "CSeq: 1 INVITE",
            "",
            "",
        ]);
        assert_eq!(Some(Method::INVITE), msg.method());
        assert_eq!(
            "INVITE sip:1012@example.com SIP/2.0",
            msg.start_line()
        );
    }

    #[test]
    fn rejects_unknown_version() {
        for start in [
            "INVITE sip:a@b SIP/1.0",
            "INVITE sip:a@b SIP/3.0",
            "INVITE sip:a@b HTTP/1.1",
            "SIP/1.1 200 OK",
        ] {
            assert!(Message::from_wire(&format!("{start}\r\n\r\n")).is_err());
        }
    }

    #[test]
    fn rejects_out_of_range_status() {
        assert!(Message::from_wire("SIP/2.0 99 Low\r\n\r\n").is_err());
        assert!(Message::from_wire("SIP/2.0 700 High\r\n\r\n").is_err());
        assert!(Message::from_wire("SIP/2.0 abc Bad\r\n\r\n").is_err());
    }

    #[test]
    fn status_line_keeps_reason_and_trims_trailing_space() {
        let msg = Message::from_wire("SIP/2.0 404 Not Found   \r\n\r\n").unwrap();
        assert_eq!(Some(404), msg.response_code());
        assert_eq!("Not Found", msg.status_text());
        assert_eq!("SIP/2.0 404 Not Found", msg.start_line());

        let msg = Message::from_wire("SIP/2.0 100\r\n\r\n").unwrap();
        assert_eq!("", msg.status_text());
    }

    #[test]
    fn compact_forms_expand() {
        let msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "v: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKa",
            "f: <sip:from@example.com>;tag=ft",
            "t: <sip:to@example.com>",
            "i: compactcallid",
            "m: <sip:c@example.com>",
            "l: 0",
            "s: hello",
            "k: path",
            "e: gzip",
            "c: application/sdp",
            "",
            "",
        ]);
        for name in [
            "Via",
            "From",
            "To",
            "Call-ID",
            "Contact",
            "Content-Length",
            "Subject",
            "Supported",
            "Content-Encoding",
            "Content-Type",
        ] {
            assert!(msg.has_header(name), "{name} missing");
        }
        // Compact and full names read the same values.
        assert!(msg.has_header("v"));
        let full: Vec<&str> = msg.enumerate_header("Via").collect();
        let compact: Vec<&str> = msg.enumerate_header("v").collect();
        assert_eq!(full, compact);
        assert_eq!("compactcallid", msg.call_id().unwrap());
    }

    #[test]
    fn comma_coalescing() {
        let msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Accept: a",
            "Accept: b, c",
            "",
            "",
        ]);
        let values: Vec<&str> = msg.enumerate_header("Accept").collect();
        assert_eq!(vec!["a", "b", "c"], values);
        assert_eq!(
            "a, b, c",
            msg.get_normalized_header("Accept").unwrap()
        );
        assert!(msg.has_header_value("Accept", "b"));
        assert!(!msg.has_header_value("Accept", "d"));
    }

    #[test]
    fn non_coalescing_exception() {
        let msg = parse_wire(&[
            "SIP/2.0 401 Unauthorized",
            r#"WWW-Authenticate: Digest realm="x", qop="auth""#,
            "",
            "",
        ]);
        let values: Vec<&str> = msg.enumerate_header("WWW-Authenticate").collect();
        assert_eq!(1, values.len());
        assert_eq!(r#"Digest realm="x", qop="auth""#, values[0]);
    }

    #[test]
    fn only_auth_headers_escape_coalescing() {
        // Date and Retry-After are ordinary coalescing headers: repeated
        // lines merge into one comma-separated entry list.
        let msg = parse_wire(&[
            "SIP/2.0 503 Service Unavailable",
            "Retry-After: 120",
            "Retry-After: 240",
            "",
            "",
        ]);
        let values: Vec<&str> = msg.enumerate_header("Retry-After").collect();
        assert_eq!(vec!["120", "240"], values);
        assert_eq!(
            "120, 240",
            msg.get_normalized_header("Retry-After").unwrap()
        );
    }

    #[test]
    fn multiple_via_in_line_enumerate_separately() {
        let msg = parse_wire(&[
            "SIP/2.0 200 OK",
            "Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKa, SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKb",
            "",
            "",
        ]);
        let vias: Vec<&str> = msg.enumerate_header("Via").collect();
        assert_eq!(2, vias.len());
        assert_eq!("z9hG4bKa", msg.topmost_via().unwrap().branch);
    }

    #[test]
    fn round_trip_preserves_message() {
        let wire = [
            "INVITE sip:1012@example.com SIP/2.0",
            "Via: SIP/2.0/UDP 127.0.0.1:5090;branch=z9hG4bKfirst",
            "Via: SIP/2.0/TCP 127.0.0.1:5080;branch=z9hG4bKsecond",
            "Route: <sip:10.0.0.1:5080;transport=tcp>",
            "Max-Forwards: 70",
            "Contact: <sip:127.0.0.1:5080>",
            r#"To: "To Name" <sip:to@example.com>"#,
            r#"From: "Test Name" <sip:from@example.com>;tag=from_tag"#,
            "Call-ID: atestcallid",
            "CSeq: 1 INVITE",
            "Content-Length: 4",
            "",
            "sdp\n",
        ]
        .join("\r\n");

        let msg = Message::from_wire(&wire).unwrap();
        let reparsed = Message::from_wire(&msg.to_string()).unwrap();

        assert_eq!(msg.start_line(), reparsed.start_line());
        assert_eq!(msg.body(), reparsed.body());
        let a: Vec<(String, String)> = msg
            .header_lines()
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
            .collect();
        let b: Vec<(String, String)> = reparsed
            .header_lines()
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.to_string()))
            .collect();
        assert_eq!(a, b);
    }

    #[test]
    fn raw_block_ends_with_double_nul_through_mutations() {
        let check = |msg: &Message| {
            let raw = msg.raw_headers();
            assert!(raw.ends_with("\0\0"));
            assert!(!raw[..raw.len() - 2].ends_with('\0'));
            for line in raw[..raw.len() - 2].split('\0') {
                assert!(!line.is_empty());
            }
        };

        let mut msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Max-Forwards: 70",
            "Call-ID: x",
            "",
            "",
        ]);
        check(&msg);
        msg.add_header("Accept: application/sdp").unwrap();
        check(&msg);
        msg.push_front_header("Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKa")
            .unwrap();
        check(&msg);
        msg.remove_header("Max-Forwards").unwrap();
        check(&msg);
        msg.replace_start_line("OPTIONS sip:b@example.com SIP/2.0")
            .unwrap();
        check(&msg);
        msg.set_body("v=0").unwrap();
        check(&msg);
        assert!(msg.add_header("Bad: a\0b").is_err());
        check(&msg);
    }

    #[test]
    fn push_front_header_becomes_topmost() {
        let mut msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Via: SIP/2.0/UDP 10.0.0.2;branch=z9hG4bKold",
            "Call-ID: x",
            "",
            "",
        ]);
        msg.push_front_header("Via: SIP/2.0/UDP 10.0.0.1;branch=z9hG4bKnew")
            .unwrap();
        assert_eq!("z9hG4bKnew", msg.topmost_via().unwrap().branch);
        assert_eq!("Via", msg.header_lines()[0].0);
    }

    #[test]
    fn remove_header_line_removes_exact_value_only() {
        let mut msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Accept: a",
            "Accept: b",
            "",
            "",
        ]);
        msg.remove_header_line("Accept", "a").unwrap();
        let values: Vec<&str> = msg.enumerate_header("Accept").collect();
        assert_eq!(vec!["b"], values);
    }

    #[test]
    fn address_normalization_brackets_bare_uris() {
        let msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "From: sip:from@example.com;tag=abc",
            "To: John Smith <sip:to@example.com>",
            "",
            "",
        ]);
        assert_eq!(
            "<sip:from@example.com>;tag=abc",
            msg.enumerate_header("From").next().unwrap()
        );
        assert_eq!(
            r#""John Smith" <sip:to@example.com>"#,
            msg.enumerate_header("To").next().unwrap()
        );
        assert_eq!("abc", msg.get_from().unwrap().tag.unwrap());
    }

    #[test]
    fn address_normalization_rejects_malformed() {
        // Second addr-spec.
        assert!(Message::from_wire(
            "OPTIONS sip:a@b SIP/2.0\r\nTo: <sip:x@y> <sip:z@w>\r\n\r\n"
        )
        .is_err());
        // Second quoted display name.
        assert!(Message::from_wire(
            "OPTIONS sip:a@b SIP/2.0\r\nTo: \"a\" \"b\" <sip:x@y>\r\n\r\n"
        )
        .is_err());
        // Bare token after the addr-spec.
        assert!(Message::from_wire(
            "OPTIONS sip:a@b SIP/2.0\r\nTo: <sip:x@y> trailing\r\n\r\n"
        )
        .is_err());
    }

    #[test]
    fn address_normalization_splits_entries_at_commas() {
        let msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Contact: sip:a@x, \"B\" <sip:b@y>;q=0.5",
            "",
            "",
        ]);
        let contacts = msg.contacts();
        assert_eq!(2, contacts.len());
        assert_eq!("a", contacts[0].uri.user.as_deref().unwrap());
        assert_eq!("B", contacts[1].display_name);
    }

    #[test]
    fn contact_star_passes_through() {
        let msg = parse_wire(&[
            "REGISTER sip:example.com SIP/2.0",
            "Contact: *",
            "",
            "",
        ]);
        assert_eq!("*", msg.enumerate_header("Contact").next().unwrap());
    }

    #[test]
    fn numeric_accessors() {
        let msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Content-Length: 42",
            "Max-Forwards: 70",
            "Expires: 3600",
            "CSeq: 314159 OPTIONS",
            "",
            "",
        ]);
        assert_eq!(42, msg.get_content_length());
        assert_eq!(70, msg.get_max_forwards());
        assert_eq!(Duration::from_secs(3600), msg.get_expires_value().unwrap());
        let cseq = msg.get_cseq().unwrap();
        assert_eq!(314159, cseq.seq);
        assert_eq!(Method::OPTIONS, cseq.method);
    }

    #[test]
    fn numeric_accessors_reject_bad_values() {
        let msg = parse_wire(&[
            "OPTIONS sip:a@example.com SIP/2.0",
            "Content-Length: +5",
            "Max-Forwards: -1",
            "Expires: 99999999999999999999",
            "",
            "",
        ]);
        assert_eq!(-1, msg.get_content_length());
        assert_eq!(-1, msg.get_max_forwards());
        // Overflow saturates instead of failing.
        assert_eq!(
            Duration::from_secs(u32::MAX as u64),
            msg.get_expires_value().unwrap()
        );
    }

    #[test]
    fn stamp_via_received_rewrites_topmost_only() {
        let mut msg = parse_wire(&[
            "INVITE sip:a@example.com SIP/2.0",
            "Via: SIP/2.0/UDP 10.0.0.1:5060;branch=z9hG4bKa",
            "Via: SIP/2.0/UDP 10.0.0.2:5060;branch=z9hG4bKb",
            "Call-ID: x",
            "",
            "",
        ]);
        msg.stamp_via_received(Some("203.0.113.7"), Some(33444)).unwrap();
        let via = msg.topmost_via().unwrap();
        assert_eq!(Some("203.0.113.7".to_string()), via.received);
        assert_eq!(Some(33444), via.rport);
        let vias: Vec<&str> = msg.enumerate_header("Via").collect();
        assert!(!vias[1].contains("received"));
    }

    #[test]
    fn body_framing_from_wire() {
        let wire = "OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 3\r\n\r\nabcdef";
        let msg = Message::from_wire(wire).unwrap();
        assert_eq!("abc", msg.body().unwrap());

        let wire = "OPTIONS sip:a@b SIP/2.0\r\nContent-Length: 0\r\n\r\nignored";
        let msg = Message::from_wire(wire).unwrap();
        assert!(msg.body().is_none());
    }

    #[tokio::test]
    async fn read_from_frames_stream_messages() {
        let wire = concat!(
            "\r\n",
            "OPTIONS sip:a@b SIP/2.0\r\n",
            "Call-ID: one\r\n",
            "Content-Length: 4\r\n",
            "\r\n",
            "bodyOPTIONS sip:c@d SIP/2.0\r\n",
            "Call-ID: two\r\n",
            "Content-Length: 0\r\n",
            "\r\n",
        );
        let mut reader = tokio::io::BufReader::new(wire.as_bytes());
        let first = Message::read_from(&mut reader).await.unwrap();
        assert_eq!("one", first.call_id().unwrap());
        assert_eq!("body", first.body().unwrap());
        let second = Message::read_from(&mut reader).await.unwrap();
        assert_eq!("two", second.call_id().unwrap());
        assert!(Message::read_from(&mut reader).await.is_err());
    }

    #[test]
    fn response_builder_copies_transaction_headers() {
        let request = parse_wire(&[
            "INVITE sip:1012@example.com SIP/2.0",
            "Via: SIP/2.0/UDP 127.0.0.1:5090;branch=z9hG4bKabc",
            "Max-Forwards: 70",
            r#"From: "A" <sip:a@example.com>;tag=ft"#,
            "To: <sip:b@example.com>",
            "Call-ID: cid",
            "CSeq: 2 INVITE",
            "Contact: <sip:a@10.0.0.1>",
            "",
            "",
        ]);
        let resp = Message::response_from(&request, 180, "Ringing").unwrap();
        assert_eq!(Direction::Outgoing, resp.direction());
        assert_eq!(Some(180), resp.response_code());
        assert_eq!("z9hG4bKabc", resp.topmost_via().unwrap().branch);
        assert_eq!("cid", resp.call_id().unwrap());
        assert_eq!(2, resp.get_cseq().unwrap().seq);
        assert!(!resp.has_header("Contact"));
        assert!(!resp.has_header("Max-Forwards"));
    }

    #[test]
    fn folded_header_lines_unfold() {
        let msg = Message::from_wire(
            "OPTIONS sip:a@b SIP/2.0\r\nSubject: first\r\n second\r\nCall-ID: x\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            "first second",
            msg.enumerate_header("Subject").next().unwrap()
        );
    }
}
