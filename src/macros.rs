//! Macro expander (C4): `%{s l o d i p v h c r t}` substitution with
//! transforms (digit count, reverse, custom delimiters) and URL-escaping on
//! uppercase letters.

use crate::domain::validate_post_expansion;
use crate::error::SpfError;
use std::fmt;

#[derive(Debug, Clone)]
pub struct MacroString {
    elements: Vec<MacroElement>,
}

#[derive(Debug, Clone)]
enum MacroElement {
    Literal(String),
    Macro(MacroTerm),
}

#[derive(Debug, Clone)]
struct MacroTerm {
    name: MacroName,
    transformer_digits: Option<u32>,
    reverse: bool,
    url_escape: bool,
    delimiters: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacroName {
    Sender,
    LocalPart,
    SenderDomain,
    Domain,
    Ip,
    ValidatedDomainName,
    ReverseDns,
    HeloDomain,
    ClientIp,
    RelayingHostName,
    CurrentUnixTimeStamp,
}

impl MacroName {
    fn parse(c: char) -> Result<(Self, bool), SpfError> {
        let escape = c.is_ascii_uppercase();
        let name = match c.to_ascii_lowercase() {
            's' => Self::Sender,
            'l' => Self::LocalPart,
            'o' => Self::SenderDomain,
            'd' => Self::Domain,
            'i' => Self::Ip,
            'p' => Self::ValidatedDomainName,
            'v' => Self::ReverseDns,
            'h' => Self::HeloDomain,
            'c' => Self::ClientIp,
            'r' => Self::RelayingHostName,
            't' => Self::CurrentUnixTimeStamp,
            _ => return Err(SpfError::InvalidMacro(format!("invalid macro letter '{c}'"))),
        };
        Ok((name, escape))
    }

    fn as_char(&self) -> char {
        match self {
            Self::Sender => 's',
            Self::LocalPart => 'l',
            Self::SenderDomain => 'o',
            Self::Domain => 'd',
            Self::Ip => 'i',
            Self::ValidatedDomainName => 'p',
            Self::ReverseDns => 'v',
            Self::HeloDomain => 'h',
            Self::ClientIp => 'c',
            Self::RelayingHostName => 'r',
            Self::CurrentUnixTimeStamp => 't',
        }
    }

    /// `c`, `r`, `t` are only meaningful while expanding an `exp` TXT record.
    fn is_explain_only(&self) -> bool {
        matches!(
            self,
            Self::ClientIp | Self::RelayingHostName | Self::CurrentUnixTimeStamp
        )
    }
}

fn starts_with_number(input: &str) -> Result<(Option<u32>, &str), SpfError> {
    let i = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    if i == 0 {
        return Ok((None, input));
    }
    let number: u32 = input[..i]
        .parse()
        .map_err(|_| SpfError::InvalidMacro(format!("bad digit-count in {input}")))?;
    if number == 0 {
        return Err(SpfError::InvalidMacro(
            "macro transformer digit-count must be >= 1".to_owned(),
        ));
    }
    Ok((Some(number), &input[i..]))
}

fn is_macro_literal(c: char) -> bool {
    let c = c as u32;
    (0x21..=0x24).contains(&c) || (0x26..=0x7e).contains(&c)
}

impl MacroString {
    pub fn parse(s: &str) -> Result<Self, SpfError> {
        let mut elements = vec![];

        fn add_literal(elements: &mut Vec<MacroElement>, literal: &str) {
            match elements.last_mut() {
                Some(MacroElement::Literal(prior)) => prior.push_str(literal),
                _ => elements.push(MacroElement::Literal(literal.to_string())),
            }
        }

        let mut s = s;
        while !s.is_empty() {
            if let Some(rest) = s.strip_prefix("%%") {
                add_literal(&mut elements, "%");
                s = rest;
                continue;
            }
            if let Some(rest) = s.strip_prefix("%_") {
                add_literal(&mut elements, " ");
                s = rest;
                continue;
            }
            if let Some(rest) = s.strip_prefix("%-") {
                add_literal(&mut elements, "%20");
                s = rest;
                continue;
            }
            if let Some(rest) = s.strip_prefix("%{") {
                let c = rest
                    .chars()
                    .next()
                    .ok_or_else(|| SpfError::InvalidMacro(format!("unexpected end of input in {s}")))?;
                let (name, url_escape) = MacroName::parse(c)?;

                let remain = &rest[1..];
                let (transformer_digits, remain) = starts_with_number(remain)?;

                let (reverse, remain) = match remain.strip_prefix('r') {
                    Some(r) => (true, r),
                    None => (false, remain),
                };

                let (delimiters, remain) = remain
                    .split_once('}')
                    .ok_or_else(|| SpfError::InvalidMacro(format!("expected '}}' to close macro in {s}")))?;

                if !delimiters.chars().all(is_delimiter_char) {
                    return Err(SpfError::InvalidMacro(format!(
                        "invalid delimiter characters in {s}"
                    )));
                }

                elements.push(MacroElement::Macro(MacroTerm {
                    name,
                    transformer_digits,
                    reverse,
                    url_escape,
                    delimiters: delimiters.to_string(),
                }));

                s = remain;
                continue;
            }

            let c = s.chars().next().unwrap();
            if !is_macro_literal(c) {
                return Err(SpfError::InvalidMacro(format!("invalid macro char in {s}")));
            }
            add_literal(&mut elements, &s[0..c.len_utf8()]);
            s = &s[c.len_utf8()..];
        }

        Ok(Self { elements })
    }

    /// True if any element refers to the `p` macro — such a spec cannot be
    /// fully resolved until a PTR validation has been attempted.
    pub fn needs_ptr(&self) -> bool {
        self.elements.iter().any(|e| {
            matches!(e, MacroElement::Macro(m) if m.name == MacroName::ValidatedDomainName)
        })
    }

    /// Expand against `ctx`. `allow_explain_only` permits `c`/`r`/`t`, which
    /// are only valid while expanding an `exp` TXT record. `truncate_253`
    /// applies the "drop leftmost labels" rule used outside explain text.
    pub fn expand(
        &self,
        ctx: &dyn MacroContext,
        allow_explain_only: bool,
        truncate_253: bool,
    ) -> Result<String, SpfError> {
        let mut result = String::new();

        for element in &self.elements {
            let term = match element {
                MacroElement::Literal(lit) => {
                    result.push_str(lit);
                    continue;
                }
                MacroElement::Macro(term) => term,
            };

            if term.name.is_explain_only() && !allow_explain_only {
                return Err(SpfError::InvalidMacro(format!(
                    "'{}' is only valid in exp text",
                    term.name.as_char()
                )));
            }

            let value = match term.name {
                MacroName::Sender => ctx.sender().to_owned(),
                MacroName::LocalPart => ctx.local_part().to_owned(),
                MacroName::SenderDomain => ctx.sender_domain().to_owned(),
                MacroName::Domain => ctx.domain().to_owned(),
                MacroName::ReverseDns => {
                    if ctx.client_ip_is_v4() {
                        "in-addr".to_owned()
                    } else {
                        "ip6".to_owned()
                    }
                }
                MacroName::Ip => ctx.ip_dotted(),
                MacroName::ClientIp => ctx.client_ip_presentation(),
                MacroName::CurrentUnixTimeStamp => ctx.now_unix().to_string(),
                MacroName::HeloDomain => ctx.helo().to_owned(),
                MacroName::RelayingHostName => ctx.relaying_host_name().to_owned(),
                MacroName::ValidatedDomainName => match ctx.validated_ptr_name() {
                    PtrMacroState::NotYetAttempted => return Err(SpfError::InvalidMacro(
                        "'p' macro requires PTR validation that has not been run yet".to_owned(),
                    )),
                    PtrMacroState::Resolved(name) => name.unwrap_or_else(|| "unknown".to_owned()),
                },
            };

            let output = apply_transform(&value, &term.delimiters, term.reverse, term.transformer_digits);

            if term.url_escape {
                url_escape_into(&output, &mut result);
            } else {
                result.push_str(&output);
            }
        }

        if truncate_253 {
            result = truncate_to_253(&result);
        }

        Ok(result)
    }
}

fn is_delimiter_char(c: char) -> bool {
    matches!(c, '.' | '-' | '+' | ',' | '/' | '_' | '=')
}

fn apply_transform(value: &str, delimiters: &str, reverse: bool, digits: Option<u32>) -> String {
    let delimiters = if delimiters.is_empty() { "." } else { delimiters };
    let mut tokens: Vec<&str> = value.split(|c| delimiters.contains(c)).collect();

    if reverse {
        tokens.reverse();
    }

    if let Some(n) = digits {
        let n = n as usize;
        while tokens.len() > n {
            tokens.remove(0);
        }
    }

    tokens.join(".")
}

fn url_escape_into(value: &str, out: &mut String) {
    // RFC 3986 unreserved set: ALPHA / DIGIT / "-" / "." / "_" / "~"
    for c in value.chars() {
        if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~') {
            out.push(c);
        } else {
            let mut bytes = [0u8; 4];
            for b in c.encode_utf8(&mut bytes).bytes() {
                out.push_str(&format!("%{b:02x}"));
            }
        }
    }
}

/// After non-explain expansion, drop leftmost labels until the result is
/// <= 253 characters (or empty).
fn truncate_to_253(s: &str) -> String {
    if s.len() <= 253 {
        return s.to_owned();
    }
    let mut labels: Vec<&str> = s.split('.').collect();
    loop {
        let candidate = labels.join(".");
        if candidate.len() <= 253 || labels.is_empty() {
            return candidate;
        }
        labels.remove(0);
    }
}

/// Whatever a mechanism/modifier needs to resolve a [`MacroString`] against.
pub trait MacroContext {
    fn sender(&self) -> &str;
    fn local_part(&self) -> &str;
    fn sender_domain(&self) -> &str;
    fn domain(&self) -> &str;
    fn client_ip_is_v4(&self) -> bool;
    /// dotted-quad (v4) or dotted-nibble (v6) form, for `%{i}`.
    fn ip_dotted(&self) -> String;
    /// presentation form (v4 dotted-quad, v6 colon-hex), for `%{c}`.
    fn client_ip_presentation(&self) -> String;
    fn helo(&self) -> &str;
    fn relaying_host_name(&self) -> &str;
    fn now_unix(&self) -> u64;
    fn validated_ptr_name(&self) -> PtrMacroState;
}

/// The state of `%{p}` resolution: either PTR validation has not run for
/// this client IP yet (the expander must defer), or it has, yielding the
/// chosen validated name (or none, which expands to the literal `unknown`).
pub enum PtrMacroState {
    NotYetAttempted,
    Resolved(Option<String>),
}

/// Validate a fully-expanded domain string, applying the 253-char
/// leftmost-label truncation first.
pub fn validate_expanded_domain(s: &str) -> Result<(), &'static str> {
    validate_post_expansion(s)
}

impl fmt::Display for MacroString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in &self.elements {
            match element {
                MacroElement::Literal(lit) => write!(f, "{lit}")?,
                MacroElement::Macro(term) => {
                    write!(f, "%{}{}", term.name.as_char(), term.delimiters)?;
                    if let Some(digits) = term.transformer_digits {
                        write!(f, "{digits}")?;
                    }
                    if term.reverse {
                        f.write_str("r")?;
                    }
                    if term.url_escape {
                        f.write_str("/")?;
                    } else {
                        f.write_str("}")?;
                    }
                }
            }
        }
        Ok(())
    }
}
