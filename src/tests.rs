//! End-to-end scenarios (C10): drives [`Evaluator::step`] against a
//! synchronous, script-configured fake resolver instead of a real one.

use crate::dns::{DnsAnswer, DnsPacket, QuestionKind, Question, Rcode, RecordData, ResourceRecord};
use crate::eval::{Evaluator, StepInput, StepOutcome};
use crate::{SpfDisposition, SpfResult};
use bstr::BString;
use hickory_proto::rr::Name;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

#[derive(Default)]
struct Zone {
    spf_rr: Option<String>,
    txt: Vec<String>,
    a: Vec<Ipv4Addr>,
    aaaa: Vec<Ipv6Addr>,
    mx: Vec<(u16, String)>,
    ptr: Vec<String>,
}

#[derive(Default)]
struct FakeResolver {
    zones: HashMap<String, Zone>,
    failures: Vec<(String, QuestionKind)>,
}

fn normalize(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl FakeResolver {
    fn zone(&mut self, name: &str) -> &mut Zone {
        self.zones.entry(normalize(name)).or_default()
    }

    fn with_spf(mut self, name: &str, text: &str) -> Self {
        self.zone(name).txt.push(text.to_owned());
        self
    }

    fn with_spf_rr(mut self, name: &str, text: &str) -> Self {
        self.zone(name).spf_rr = Some(text.to_owned());
        self
    }

    fn with_txt(mut self, name: &str, text: &str) -> Self {
        self.zone(name).txt.push(text.to_owned());
        self
    }

    fn with_a(mut self, name: &str, addr: &str) -> Self {
        self.zone(name).a.push(addr.parse().unwrap());
        self
    }

    fn with_aaaa(mut self, name: &str, addr: &str) -> Self {
        self.zone(name).aaaa.push(addr.parse().unwrap());
        self
    }

    fn with_mx(mut self, name: &str, preference: u16, exchange: &str) -> Self {
        self.zone(name).mx.push((preference, exchange.to_owned()));
        self
    }

    fn with_ptr(mut self, reverse_name: &str, target: &str) -> Self {
        self.zone(reverse_name).ptr.push(target.to_owned());
        self
    }

    fn with_failure(mut self, name: &str, kind: QuestionKind) -> Self {
        self.failures.push((normalize(name), kind));
        self
    }

    fn answer(&self, question: &Question) -> DnsAnswer {
        if self.failures.contains(&(normalize(&question.name), question.kind)) {
            return DnsAnswer::Failure {
                question: question.clone(),
                reason: "simulated resolver failure".to_owned(),
            };
        }
        let key = normalize(&question.name);
        let Some(zone) = self.zones.get(&key) else {
            return DnsAnswer::Packet(DnsPacket::new(question.clone(), Rcode::NxDomain));
        };

        let answers = match question.kind {
            QuestionKind::Spf => zone
                .spf_rr
                .iter()
                .map(|t| ResourceRecord {
                    name: question.name.clone(),
                    data: RecordData::Txt(vec![BString::from(t.as_str())]),
                })
                .collect(),
            QuestionKind::Txt => zone
                .txt
                .iter()
                .map(|t| ResourceRecord {
                    name: question.name.clone(),
                    data: RecordData::Txt(vec![BString::from(t.as_str())]),
                })
                .collect(),
            QuestionKind::A => zone
                .a
                .iter()
                .map(|addr| ResourceRecord {
                    name: question.name.clone(),
                    data: RecordData::A(*addr),
                })
                .collect(),
            QuestionKind::Aaaa => zone
                .aaaa
                .iter()
                .map(|addr| ResourceRecord {
                    name: question.name.clone(),
                    data: RecordData::Aaaa(*addr),
                })
                .collect(),
            QuestionKind::Mx => zone
                .mx
                .iter()
                .map(|(preference, exchange)| ResourceRecord {
                    name: question.name.clone(),
                    data: RecordData::Mx {
                        preference: *preference,
                        exchange: Name::from_str(exchange).unwrap(),
                    },
                })
                .collect(),
            QuestionKind::Ptr => zone
                .ptr
                .iter()
                .map(|target| ResourceRecord {
                    name: question.name.clone(),
                    data: RecordData::Ptr(Name::from_str(target).unwrap()),
                })
                .collect(),
        };

        DnsAnswer::Packet(DnsPacket::new(question.clone(), Rcode::NoError).with_answers(answers))
    }
}

fn run(resolver: &FakeResolver, client_ip: IpAddr, mail_from: &str, helo: &str) -> SpfResult {
    let mut evaluator = Evaluator::new(client_ip, mail_from, helo, Some("mx.relay.example"));
    let mut outcome = evaluator.step(StepInput::Start);
    loop {
        match outcome {
            StepOutcome::Done(result) => return result,
            StepOutcome::Ignored => panic!("harness stalled: got Ignored with no further queries"),
            StepOutcome::Queries { queries, callback_id } => {
                let mut next = StepOutcome::Ignored;
                for question in &queries {
                    let answer = resolver.answer(question);
                    next = evaluator.step(StepInput::Response { callback_id, answer });
                }
                outcome = next;
            }
        }
    }
}

#[test]
fn no_record_is_none() {
    let resolver = FakeResolver::default();
    let result = run(&resolver, "192.0.2.1".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::None);
}

#[test]
fn ip4_mechanism_passes_without_further_dns() {
    let resolver = FakeResolver::default().with_spf("example.com", "v=spf1 ip4:192.0.2.0/24 -all");
    let result = run(&resolver, "192.0.2.17".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);

    let result = run(&resolver, "198.51.100.9".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Fail);
}

#[test]
fn fail_result_resolves_explanation() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 -all exp=explain.example.com")
        .with_txt("explain.example.com", "%{i} is not one of %{d}'s allowed senders");
    let result = run(&resolver, "198.51.100.9".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Fail);
    assert_eq!(result.comment, "198.51.100.9 is not one of example.com's allowed senders");
    assert_eq!(result.problem, None);
}

#[test]
fn redirect_chain_is_followed() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 redirect=_spf.example.net")
        .with_spf("_spf.example.net", "v=spf1 ip4:192.0.2.0/24 -all");
    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn redirect_to_domain_with_no_record_is_permerror() {
    let resolver = FakeResolver::default().with_spf("example.com", "v=spf1 redirect=nowhere.example.net");
    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::PermError);
    assert_eq!(result.problem.as_deref(), Some("redirect target has no SPF record"));
}

#[test]
fn include_pass_promotes_to_enclosing_qualifier() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 include:_spf.example.net -all")
        .with_spf("_spf.example.net", "v=spf1 ip4:192.0.2.0/24 -all");
    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn include_fail_falls_through_to_next_mechanism() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 include:_spf.example.net ip4:198.51.100.0/24 -all")
        .with_spf("_spf.example.net", "v=spf1 -all");
    let result = run(&resolver, "198.51.100.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn include_with_no_record_is_permerror() {
    let resolver = FakeResolver::default().with_spf("example.com", "v=spf1 include:nowhere.example.net -all");
    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::PermError);
}

#[test]
fn dns_mechanism_budget_exhausts_into_permerror() {
    let mechanisms: String = (1..=11)
        .map(|n| format!(" exists:void{n}.example.com"))
        .collect();
    let policy = format!("v=spf1{mechanisms} -all");
    let resolver = FakeResolver::default().with_spf("example.com", &policy);

    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::PermError);
    assert_eq!(result.problem.as_deref(), Some("Number of DNS mechanism exceeded"));
}

#[test]
fn multiple_spf_records_is_permerror() {
    let resolver = FakeResolver::default()
        .with_txt("example.com", "v=spf1 -all")
        .with_txt("example.com", "v=spf1 +all");
    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::PermError);
    assert_eq!(result.problem.as_deref(), Some("multiple SPF records"));
}

#[test]
fn a_mechanism_matches_resolved_address() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 a -all")
        .with_a("example.com", "192.0.2.10");
    let result = run(&resolver, "192.0.2.10".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn mx_mechanism_checks_each_exchange_in_turn() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 mx -all")
        .with_mx("example.com", 10, "mail-a.example.com")
        .with_mx("example.com", 20, "mail-b.example.com")
        .with_a("mail-a.example.com", "192.0.2.129")
        .with_a("mail-b.example.com", "192.0.2.130");
    let result = run(&resolver, "192.0.2.130".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn ptr_mechanism_validates_forward_and_reverse() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 ptr -all")
        .with_ptr("3.2.0.192.in-addr.arpa", "mail.example.com")
        .with_a("mail.example.com", "192.0.2.3");
    let result = run(&resolver, "192.0.2.3".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn ptr_mechanism_rejects_when_forward_lookup_disagrees() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 ptr -all")
        .with_ptr("3.2.0.192.in-addr.arpa", "mail.evil.example")
        .with_a("mail.evil.example", "203.0.113.9");
    let result = run(&resolver, "192.0.2.3".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Fail);
}

#[test]
fn null_sender_uses_helo_domain() {
    let resolver = FakeResolver::default().with_spf("mx1.example.com", "v=spf1 ip4:192.0.2.0/24 -all");
    let result = run(&resolver, "192.0.2.5".parse().unwrap(), "", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn ipv4_mapped_address_is_normalized_before_evaluation() {
    let resolver = FakeResolver::default().with_spf("example.com", "v=spf1 ip4:192.0.2.0/24 -all");
    let mapped: IpAddr = "::ffff:192.0.2.17".parse().unwrap();
    let result = run(&resolver, mapped, "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}

#[test]
fn bare_ptr_rejects_name_outside_current_domain_zone() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 ptr -all")
        .with_ptr("3.2.0.192.in-addr.arpa", "mail.attacker.test")
        .with_a("mail.attacker.test", "192.0.2.3");
    let result = run(&resolver, "192.0.2.3".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Fail);
}

#[test]
fn explain_lookup_failure_keeps_original_fail() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 -all exp=explain.example.com")
        .with_failure("explain.example.com", QuestionKind::Txt);
    let result = run(&resolver, "198.51.100.9".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Fail);
    assert_eq!(result.comment, "matches default");
    assert_eq!(result.problem, None);
}

#[test]
fn redirect_with_deferred_p_macro_is_followed() {
    let resolver = FakeResolver::default()
        .with_spf("example.com", "v=spf1 redirect=%{p}")
        .with_ptr("9.2.0.192.in-addr.arpa", "mail.example.com")
        .with_a("mail.example.com", "192.0.2.9")
        .with_spf("mail.example.com", "v=spf1 ip4:192.0.2.0/24 -all");
    let result = run(&resolver, "192.0.2.9".parse().unwrap(), "sender@example.com", "mx1.example.com");
    assert_eq!(result.disposition, SpfDisposition::Pass);
}
