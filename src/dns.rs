//! DNS I/O protocol (C7): the call/response contract between the evaluator
//! and an external resolver. The evaluator never performs I/O itself — it
//! emits [`Question`]s and consumes [`DnsAnswer`]s that the caller supplies
//! after driving its own resolver.

use bstr::BString;
use hickory_proto::rr::Name;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QuestionKind {
    A,
    Aaaa,
    Txt,
    Spf,
    Mx,
    Ptr,
}

impl fmt::Display for QuestionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Txt => "TXT",
            Self::Spf => "SPF",
            Self::Mx => "MX",
            Self::Ptr => "PTR",
        })
    }
}

/// A `(name, type, class=IN)` question descriptor the caller must resolve
/// and echo back via [`DnsAnswer`], tagged with the `callback_id` the
/// evaluator returned alongside it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Question {
    pub name: String,
    pub kind: QuestionKind,
}

impl Question {
    pub fn new(name: impl Into<String>, kind: QuestionKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Only `NOERROR` and `NXDOMAIN` are interpreted; everything else is
/// treated as transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rcode {
    NoError,
    NxDomain,
    Other,
}

/// A single resolved record, typed loosely enough to cover every record
/// kind the engine consumes. `Mx`/`Ptr`/`Cname` payloads reuse
/// `hickory_proto::rr::Name` for parsing/zone-membership convenience; `Txt`
/// is carried as raw bytes (`bstr::BString`) since TXT data is not
/// guaranteed to be valid UTF-8.
#[derive(Debug, Clone)]
pub enum RecordData {
    A(std::net::Ipv4Addr),
    Aaaa(std::net::Ipv6Addr),
    Mx { preference: u16, exchange: Name },
    Ptr(Name),
    Txt(Vec<BString>),
    Cname(Name),
}

#[derive(Debug, Clone)]
pub struct ResourceRecord {
    pub name: String,
    pub data: RecordData,
}

/// An opaque carrier for one DNS response: the question it answers, the
/// header rcode, and the answer/additional sections. CNAME chains are
/// followed by pairing an answer-section CNAME with the matching
/// additional-section record.
#[derive(Debug, Clone)]
pub struct DnsPacket {
    pub question: Question,
    pub rcode: Rcode,
    pub answers: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl DnsPacket {
    pub fn new(question: Question, rcode: Rcode) -> Self {
        Self {
            question,
            rcode,
            answers: Vec::new(),
            additional: Vec::new(),
        }
    }

    pub fn with_answers(mut self, answers: Vec<ResourceRecord>) -> Self {
        self.answers = answers;
        self
    }

    pub fn with_additional(mut self, additional: Vec<ResourceRecord>) -> Self {
        self.additional = additional;
        self
    }

    /// Addresses directly in the answer section, plus addresses found in
    /// the additional section for any CNAME target named in the answers —
    /// this is how `a`/`mx`/`exists`/PTR-forward lookups see through a
    /// single CNAME hop.
    pub fn resolved_addresses(&self) -> Vec<IpAddr> {
        let mut out = Vec::new();
        let mut cname_targets = Vec::new();

        for rr in &self.answers {
            match &rr.data {
                RecordData::A(addr) => out.push(IpAddr::V4(*addr)),
                RecordData::Aaaa(addr) => out.push(IpAddr::V6(*addr)),
                RecordData::Cname(target) => cname_targets.push(target.to_utf8()),
                _ => {}
            }
        }

        if !cname_targets.is_empty() {
            for rr in &self.additional {
                if !cname_targets.iter().any(|t| names_equal(t, &rr.name)) {
                    continue;
                }
                match &rr.data {
                    RecordData::A(addr) => out.push(IpAddr::V4(*addr)),
                    RecordData::Aaaa(addr) => out.push(IpAddr::V6(*addr)),
                    _ => {}
                }
            }
        }

        out
    }

    pub fn mx_exchanges(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter_map(|rr| match &rr.data {
                RecordData::Mx { exchange, .. } => Some(exchange.to_utf8()),
                _ => None,
            })
            .collect()
    }

    pub fn ptr_names(&self) -> Vec<String> {
        self.answers
            .iter()
            .filter_map(|rr| match &rr.data {
                RecordData::Ptr(name) => Some(name.to_utf8()),
                _ => None,
            })
            .collect()
    }

    pub fn txt_strings(&self) -> Vec<String> {
        self.answers
            .iter()
            .flat_map(|rr| match &rr.data {
                RecordData::Txt(chunks) => chunks.iter().map(|c| c.to_string()).collect(),
                _ => Vec::new(),
            })
            .collect()
    }
}

fn names_equal(a: &str, b: &str) -> bool {
    a.trim_end_matches('.').eq_ignore_ascii_case(b.trim_end_matches('.'))
}

/// Whether `name` is equal to, or a sub-domain of, `zone` — used to filter
/// PTR answers to a restricting domain and to decide PTR-name zone
/// membership. Both arguments are DNS presentation names.
pub fn is_in_zone(name: &str, zone: &str) -> bool {
    match (
        Name::from_str(name.trim_end_matches('.')),
        Name::from_str(zone.trim_end_matches('.')),
    ) {
        (Ok(name), Ok(zone)) => zone.zone_of(&name),
        _ => {
            let name = name.trim_end_matches('.').to_ascii_lowercase();
            let zone = zone.trim_end_matches('.').to_ascii_lowercase();
            name == zone || name.ends_with(&format!(".{zone}"))
        }
    }
}

/// One outbound query's lifecycle: has a matching response arrived yet.
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub question: Question,
    pub done: bool,
}

/// Either a normally-decoded packet, or a signal that the resolver itself
/// failed to produce one (timeout, SERVFAIL, transport error, ...).
#[derive(Debug, Clone)]
pub enum DnsAnswer {
    Packet(DnsPacket),
    Failure { question: Question, reason: String },
}

impl DnsAnswer {
    pub fn question(&self) -> &Question {
        match self {
            DnsAnswer::Packet(p) => &p.question,
            DnsAnswer::Failure { question, .. } => question,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cname_chain_resolves_through_additional() {
        let q = Question::new("example.com", QuestionKind::A);
        let packet = DnsPacket::new(q, Rcode::NoError)
            .with_answers(vec![ResourceRecord {
                name: "example.com".into(),
                data: RecordData::Cname(Name::from_str("mail.example.com").unwrap()),
            }])
            .with_additional(vec![ResourceRecord {
                name: "mail.example.com".into(),
                data: RecordData::A("192.0.2.9".parse().unwrap()),
            }]);

        assert_eq!(
            packet.resolved_addresses(),
            vec!["192.0.2.9".parse::<IpAddr>().unwrap()]
        );
    }

    #[test]
    fn zone_membership() {
        assert!(is_in_zone("mail.example.com", "example.com"));
        assert!(is_in_zone("example.com", "example.com"));
        assert!(!is_in_zone("example.org", "example.com"));
    }
}
