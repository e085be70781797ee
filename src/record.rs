//! SPF record parser (C3): tokenizes the text following `v=spf1` into an
//! ordered sequence of mechanism directives plus at most one `redirect` and
//! one `exp` modifier.

use crate::cidr::{parse_dual_cidr_suffix, DualCidrLength};
use crate::error::SpfError;
use crate::macros::MacroString;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Qualifier {
    #[default]
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

impl Qualifier {
    fn parse(c: char) -> Option<Self> {
        Some(match c {
            '+' => Self::Pass,
            '-' => Self::Fail,
            '~' => Self::SoftFail,
            '?' => Self::Neutral,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pass => "+",
            Self::Fail => "-",
            Self::SoftFail => "~",
            Self::Neutral => "?",
        }
    }
}

#[derive(Debug, Clone)]
pub enum Mechanism {
    All,
    Include { domain: MacroString },
    A { domain: Option<MacroString>, cidr: DualCidrLength },
    Mx { domain: Option<MacroString>, cidr: DualCidrLength },
    Ptr { domain: Option<MacroString> },
    Ip4 { network: Ipv4Addr, cidr: u8 },
    Ip6 { network: Ipv6Addr, cidr: u8 },
    Exists { domain: MacroString },
}

impl Mechanism {
    /// Whether evaluating this mechanism requires a DNS round trip — these
    /// are the kinds that decrement `dnsMechanismBudget`.
    pub fn is_dns_mechanism(&self) -> bool {
        matches!(
            self,
            Self::A { .. } | Self::Mx { .. } | Self::Ptr { .. } | Self::Exists { .. } | Self::Include { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Include { .. } => "include",
            Self::A { .. } => "a",
            Self::Mx { .. } => "mx",
            Self::Ptr { .. } => "ptr",
            Self::Ip4 { .. } => "ip4",
            Self::Ip6 { .. } => "ip6",
            Self::Exists { .. } => "exists",
        }
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => write!(f, "all"),
            Self::Include { domain } => write!(f, "include:{domain}"),
            Self::A { domain, .. } => match domain {
                Some(d) => write!(f, "a:{d}"),
                None => write!(f, "a"),
            },
            Self::Mx { domain, .. } => match domain {
                Some(d) => write!(f, "mx:{d}"),
                None => write!(f, "mx"),
            },
            Self::Ptr { domain } => match domain {
                Some(d) => write!(f, "ptr:{d}"),
                None => write!(f, "ptr"),
            },
            Self::Ip4 { network, cidr } => write!(f, "ip4:{network}/{cidr}"),
            Self::Ip6 { network, cidr } => write!(f, "ip6:{network}/{cidr}"),
            Self::Exists { domain } => write!(f, "exists:{domain}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Directive {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism,
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.qualifier != Qualifier::Pass {
            write!(f, "{}", self.qualifier.as_str())?;
        }
        write!(f, "{}", self.mechanism)
    }
}

fn starts_with_ident<'a>(s: &'a str, ident: &str) -> Option<&'a str> {
    if s.len() < ident.len() || !s.as_bytes()[..ident.len()].eq_ignore_ascii_case(ident.as_bytes()) {
        return None;
    }
    Some(&s[ident.len()..])
}

impl Directive {
    fn parse(token: &str) -> Result<Self, SpfError> {
        let mut chars = token.chars();
        let (qualifier, rest) = match chars.next().and_then(Qualifier::parse) {
            Some(q) => (q, &token[1..]),
            None => (Qualifier::default(), token),
        };
        Ok(Self {
            qualifier,
            mechanism: Mechanism::parse(rest)?,
        })
    }
}

impl Mechanism {
    fn parse(s: &str) -> Result<Self, SpfError> {
        if s.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }

        if let Some(spec) = starts_with_ident(s, "include:") {
            return Ok(Self::Include {
                domain: MacroString::parse(spec)?,
            });
        }

        if let Some(remain) = starts_with_ident(s, "a") {
            let (remain, cidr) = parse_dual_cidr_suffix(remain)
                .map_err(|_| SpfError::InvalidToken(s.to_owned()))?;
            let domain = parse_optional_domain(remain, s)?;
            return Ok(Self::A { domain, cidr });
        }

        if let Some(remain) = starts_with_ident(s, "mx") {
            let (remain, cidr) = parse_dual_cidr_suffix(remain)
                .map_err(|_| SpfError::InvalidToken(s.to_owned()))?;
            let domain = parse_optional_domain(remain, s)?;
            return Ok(Self::Mx { domain, cidr });
        }

        if let Some(remain) = starts_with_ident(s, "ptr") {
            let domain = parse_optional_domain(remain, s)?;
            return Ok(Self::Ptr { domain });
        }

        if let Some(remain) = starts_with_ident(s, "ip4:") {
            let (addr, len) = remain
                .split_once('/')
                .ok_or_else(|| SpfError::InvalidToken(s.to_owned()))?;
            let network: Ipv4Addr = addr.parse().map_err(|_| SpfError::InvalidToken(s.to_owned()))?;
            let cidr: u8 = len.parse().map_err(|_| SpfError::InvalidToken(s.to_owned()))?;
            if cidr > 32 {
                return Err(SpfError::InvalidToken(s.to_owned()));
            }
            return Ok(Self::Ip4 { network, cidr });
        }

        if let Some(remain) = starts_with_ident(s, "ip6:") {
            let (addr, len) = remain
                .split_once('/')
                .ok_or_else(|| SpfError::InvalidToken(s.to_owned()))?;
            let network: Ipv6Addr = addr.parse().map_err(|_| SpfError::InvalidToken(s.to_owned()))?;
            let cidr: u8 = len.parse().map_err(|_| SpfError::InvalidToken(s.to_owned()))?;
            if cidr > 128 {
                return Err(SpfError::InvalidToken(s.to_owned()));
            }
            return Ok(Self::Ip6 { network, cidr });
        }

        if let Some(spec) = starts_with_ident(s, "exists:") {
            return Ok(Self::Exists {
                domain: MacroString::parse(spec)?,
            });
        }

        Err(SpfError::InvalidToken(s.to_owned()))
    }
}

fn parse_optional_domain(remain: &str, whole_token: &str) -> Result<Option<MacroString>, SpfError> {
    if let Some(spec) = remain.strip_prefix(':') {
        Ok(Some(MacroString::parse(spec)?))
    } else if remain.is_empty() {
        Ok(None)
    } else {
        Err(SpfError::InvalidToken(whole_token.to_owned()))
    }
}

#[derive(Debug)]
pub enum Modifier {
    Redirect(MacroString),
    Explanation(MacroString),
    Unknown,
}

impl Modifier {
    fn parse(token: &str) -> Result<Self, SpfError> {
        if let Some(spec) = starts_with_ident(token, "redirect=") {
            return Ok(Self::Redirect(MacroString::parse(spec)?));
        }
        if let Some(spec) = starts_with_ident(token, "exp=") {
            return Ok(Self::Explanation(MacroString::parse(spec)?));
        }

        let (name, value) = token
            .split_once('=')
            .ok_or_else(|| SpfError::InvalidToken(token.to_owned()))?;

        let valid_name = !name.is_empty()
            && name.chars().next().unwrap().is_ascii_alphabetic()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid_name {
            return Err(SpfError::InvalidToken(token.to_owned()));
        }

        // Forward-compatibility escape hatch: the macro-string must still
        // parse, but the modifier itself carries no meaning to us.
        let _ = MacroString::parse(value)?;
        Ok(Self::Unknown)
    }
}

/// A parsed `v=spf1 ...` record: an ordered mechanism list plus the
/// optional `redirect`/`exp` modifiers.
#[derive(Debug, Default)]
pub struct Record {
    pub directives: Vec<Directive>,
    pub redirect: Option<MacroString>,
    pub explanation: Option<MacroString>,
}

impl Record {
    /// Parse `text`, dropping `ip4`/`ip6` mechanisms whose family can never
    /// match `client_ip` (a deliberate parse-time skip, not an evaluation
    /// non-match).
    pub fn parse(text: &str, client_ip: IpAddr) -> Result<Self, SpfError> {
        let mut tokens = text.split(' ').filter(|t| !t.is_empty());
        let version = tokens.next().ok_or_else(|| SpfError::WrongVersion(String::new()))?;
        if !version.eq_ignore_ascii_case("v=spf1") {
            return Err(SpfError::WrongVersion(version.to_owned()));
        }

        let mut record = Self::default();
        for token in tokens {
            if let Ok(directive) = Directive::parse(token) {
                if record.redirect.is_some() || record.explanation.is_some() {
                    return Err(SpfError::DirectiveAfterModifier);
                }
                if skip_for_family(&directive.mechanism, client_ip) {
                    tracing::debug!(mechanism = %directive.mechanism, "skipping mechanism: address family mismatch");
                    continue;
                }
                record.directives.push(directive);
                continue;
            }

            match Modifier::parse(token)? {
                Modifier::Redirect(domain) => {
                    if record.redirect.is_some() {
                        return Err(SpfError::DuplicateModifier("redirect"));
                    }
                    record.redirect = Some(domain);
                }
                Modifier::Explanation(domain) => {
                    if record.explanation.is_some() {
                        return Err(SpfError::DuplicateModifier("exp"));
                    }
                    record.explanation = Some(domain);
                }
                Modifier::Unknown => {}
            }
        }

        Ok(record)
    }
}

fn skip_for_family(mechanism: &Mechanism, client_ip: IpAddr) -> bool {
    match mechanism {
        Mechanism::Ip4 { .. } => client_ip.is_ipv6(),
        Mechanism::Ip6 { .. } => client_ip.is_ipv4(),
        _ => false,
    }
}
