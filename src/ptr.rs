//! PTR validator (C5): reverse-lookup-then-forward-lookup verification used
//! by the `ptr` mechanism and by `%{p}` macro resolution. Results are
//! memoized per `(client IP, domain)` on the evaluator's `validated` map.

use std::fmt;
use std::net::IpAddr;

/// Maximum PTR answers considered in one validation.
pub const MAX_PTR_NAMES: usize = 10;

/// The reversed-nibble/reversed-octet `in-addr.arpa`/`ip6.arpa` query name
/// for `ip`.
pub fn ptr_query_name(ip: IpAddr) -> String {
    let mut out = String::new();
    match ip {
        IpAddr::V4(v4) => {
            for octet in v4.octets().iter().rev() {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(&octet.to_string());
            }
            out.push_str(".in-addr.arpa");
        }
        IpAddr::V6(v6) => {
            for byte in v6.octets().iter().rev() {
                let (hi, lo) = (byte >> 4, byte & 0xf);
                for nibble in [lo, hi] {
                    if !out.is_empty() {
                        out.push('.');
                    }
                    out.push_str(&format!("{nibble:x}"));
                }
            }
            out.push_str(".ip6.arpa");
        }
    }
    out
}

/// Filter PTR answers to those equal to, or ending with, the restricting
/// domain (when present), then cap at [`MAX_PTR_NAMES`].
pub fn filter_candidates(names: Vec<String>, restrict: Option<&str>) -> Vec<String> {
    let mut names = names;
    if let Some(domain) = restrict {
        names.retain(|n| crate::dns::is_in_zone(n, domain));
    }
    names.truncate(MAX_PTR_NAMES);
    names
}

/// Drives the "take the next candidate name, forward-resolve it, check
/// whether it matches the client IP" loop. The evaluator owns one of these
/// per in-flight `ptr` mechanism or `%{p}` resolution.
#[derive(Debug, Clone)]
pub struct PtrValidation {
    pub client_ip: IpAddr,
    pub restrict: Option<String>,
    candidates: Vec<String>,
    cursor: usize,
}

/// What to do after supplying the PTR answer or a forward-lookup answer.
pub enum PtrProgress {
    /// Query the given name's forward record next.
    NeedForward(String),
    /// No candidate validated; the calling mechanism is a non-match.
    NotValidated,
    /// This name's forward lookup contains the client IP: validated.
    Validated(String),
}

impl PtrValidation {
    pub fn new(client_ip: IpAddr, restrict: Option<String>) -> Self {
        Self {
            client_ip,
            restrict,
            candidates: Vec::new(),
            cursor: 0,
        }
    }

    pub fn reverse_query(&self) -> String {
        ptr_query_name(self.client_ip)
    }

    /// Feed the PTR answer (reverse lookup) and get the next step.
    pub fn on_ptr_answer(&mut self, names: Vec<String>) -> PtrProgress {
        self.candidates = filter_candidates(names, self.restrict.as_deref());
        self.cursor = 0;
        self.advance()
    }

    /// Feed a forward-lookup answer for the most recently requested
    /// candidate and get the next step.
    pub fn on_forward_answer(&mut self, addresses: &[IpAddr]) -> PtrProgress {
        if addresses.iter().any(|&ip| ip == self.client_ip) {
            let name = self.candidates[self.cursor].clone();
            return PtrProgress::Validated(name);
        }
        self.cursor += 1;
        self.advance()
    }

    fn advance(&self) -> PtrProgress {
        match self.candidates.get(self.cursor) {
            Some(name) => PtrProgress::NeedForward(name.clone()),
            None => PtrProgress::NotValidated,
        }
    }
}

impl fmt::Display for PtrValidation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ptr validation for {}", self.client_ip)
    }
}

/// Choose the `%{p}` macro value: an exact domain match first, then any
/// validated name within the domain's zone, then any validated name at
/// all, from the full set of names validated so far for `client_ip`.
pub fn choose_p_macro<'a>(
    validated: impl Iterator<Item = (&'a IpAddr, &'a str, bool)>,
    client_ip: IpAddr,
    domain: &str,
) -> Option<String> {
    let mut exact = None;
    let mut sub = None;
    let mut any = None;

    for (ip, name, ok) in validated {
        if *ip != client_ip || !ok {
            continue;
        }
        if name.eq_ignore_ascii_case(domain) {
            exact = Some(name.to_owned());
        } else if crate::dns::is_in_zone(name, domain) {
            sub.get_or_insert_with(|| name.to_owned());
        } else {
            any.get_or_insert_with(|| name.to_owned());
        }
    }

    exact.or(sub).or(any)
}
