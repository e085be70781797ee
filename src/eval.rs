//! Evaluator state machine (C6): the heart of the engine. Drives the
//! mechanism list, the `include` stack, the `redirect` jump, the DNS
//! mechanism budget, and final-result folding with the `exp` explain
//! lookup — all without ever blocking on I/O. The caller drives every
//! transition through [`Evaluator::step`].

use crate::cidr::DualCidrLength;
use crate::dns::{DnsAnswer, DnsPacket, PendingQuery, Question, QuestionKind, Rcode};
use crate::domain::{validate_post_expansion, validate_pre_expansion};
use crate::error::SpfError;
use crate::macros::{MacroContext, MacroString, PtrMacroState};
use crate::ptr::{choose_p_macro, PtrProgress, PtrValidation};
use crate::record::{Directive, Mechanism, Qualifier, Record};
use crate::{SpfDisposition, SpfResult};
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

/// Starting value of `dnsMechanismBudget`.
pub const INITIAL_DNS_BUDGET: i32 = 10;

/// Either the initial call (no prior DNS activity) or a response to a
/// previously emitted query, tagged with the `callback_id` it answers.
pub enum StepInput {
    Start,
    Response { callback_id: u64, answer: DnsAnswer },
}

/// What the caller must do next.
pub enum StepOutcome {
    /// The evaluation has concluded.
    Done(SpfResult),
    /// Resolve these questions and feed the answers back via
    /// `StepInput::Response { callback_id, .. }`.
    Queries {
        queries: Vec<Question>,
        callback_id: u64,
    },
    /// The input was stale, a duplicate, or we are waiting on a sibling
    /// response; nothing further to do right now.
    Ignored,
}

#[derive(Debug, Clone)]
struct Frame {
    domain: String,
    mechanisms: VecDeque<Directive>,
    redirect: Option<MacroString>,
    explain: Option<MacroString>,
    qualifier: Qualifier,
}

#[derive(Debug, Clone)]
enum RecordSlot {
    Pending,
    NoRecord,
    Usable(String),
    Ambiguous,
}

#[derive(Debug, Clone, Copy)]
enum RecordFetchKind {
    Initial,
    Redirect,
    Include,
}

/// What triggered a deferred `%{p}` PTR resolution, so we know how to
/// resume once it completes.
#[derive(Debug, Clone)]
enum PtrResume {
    Mechanism(Directive),
    Redirect(MacroString),
    Explain { failed_comment: String },
}

enum Awaiting {
    Record {
        spf: RecordSlot,
        txt: RecordSlot,
        kind: RecordFetchKind,
    },
    A {
        qualifier: Qualifier,
        cidr: DualCidrLength,
    },
    Mx {
        qualifier: Qualifier,
        cidr: DualCidrLength,
    },
    MxExchange {
        qualifier: Qualifier,
        cidr: DualCidrLength,
        exchanges: VecDeque<String>,
    },
    Exists {
        qualifier: Qualifier,
    },
    Ptr {
        qualifier: Qualifier,
        validation: PtrValidation,
    },
    ResolvingPMacro {
        validation: PtrValidation,
        resume: PtrResume,
    },
    ExplainTxt {
        failed_comment: String,
    },
}

enum PtrDriveResult {
    Query(PtrValidation, String),
    Validated(String),
    NotValidated,
}

/// One evaluation in progress. Constructed once per SPF check; every
/// transition happens through [`step`](Evaluator::step).
pub struct Evaluator {
    client_ip: IpAddr,
    sender: String,
    local_part: String,
    sender_domain: String,
    domain: String,
    helo: String,
    my_host_name: String,

    mechanisms: VecDeque<Directive>,
    redirect: Option<MacroString>,
    explain: Option<MacroString>,
    include_stack: Vec<Frame>,

    pending: Vec<PendingQuery>,
    callback_id: u64,
    budget: i32,

    validated: HashMap<(IpAddr, String), bool>,
    ptr_validation_done: bool,

    awaiting: Option<Awaiting>,
}

impl Evaluator {
    /// `mail_from` is the bare `local@domain`, angle brackets and any
    /// trailing parameters already stripped by the caller; empty denotes a
    /// null-sender bounce, in which case `helo` supplies the domain.
    pub fn new(client_ip: IpAddr, mail_from: &str, helo: &str, my_host_name: Option<&str>) -> Self {
        let client_ip = normalize_v4_mapped(client_ip);
        let (local_part, sender_domain) = if mail_from.is_empty() {
            ("postmaster".to_owned(), helo.to_owned())
        } else {
            match mail_from.split_once('@') {
                Some((l, d)) => (l.to_owned(), d.to_owned()),
                None => ("postmaster".to_owned(), mail_from.to_owned()),
            }
        };
        let sender = format!("{local_part}@{sender_domain}");

        Self {
            client_ip,
            domain: sender_domain.clone(),
            sender,
            local_part,
            sender_domain,
            helo: helo.to_owned(),
            my_host_name: my_host_name.unwrap_or("unknown").to_owned(),
            mechanisms: VecDeque::new(),
            redirect: None,
            explain: None,
            include_stack: Vec::new(),
            pending: Vec::new(),
            callback_id: 0,
            budget: INITIAL_DNS_BUDGET,
            validated: HashMap::new(),
            ptr_validation_done: false,
            awaiting: None,
        }
    }

    pub fn step(&mut self, input: StepInput) -> StepOutcome {
        match input {
            StepInput::Start => self.begin(),
            StepInput::Response { callback_id, answer } => self.on_response(callback_id, answer),
        }
    }

    fn begin(&mut self) -> StepOutcome {
        if validate_post_expansion(&self.domain).is_err() {
            tracing::debug!(domain = %self.domain, "initial domain invalid; returning None");
            return StepOutcome::Done(SpfResult {
                disposition: SpfDisposition::None,
                comment: "not a domain name".to_owned(),
                problem: None,
            });
        }
        self.fetch_record(RecordFetchKind::Initial)
    }

    fn fetch_record(&mut self, kind: RecordFetchKind) -> StepOutcome {
        tracing::debug!(domain = %self.domain, "fetching SPF record");
        let queries = vec![
            Question::new(self.domain.clone(), QuestionKind::Spf),
            Question::new(self.domain.clone(), QuestionKind::Txt),
        ];
        self.awaiting = Some(Awaiting::Record {
            spf: RecordSlot::Pending,
            txt: RecordSlot::Pending,
            kind,
        });
        self.emit(queries)
    }

    fn emit(&mut self, queries: Vec<Question>) -> StepOutcome {
        self.callback_id += 1;
        self.pending = queries
            .iter()
            .cloned()
            .map(|question| PendingQuery { question, done: false })
            .collect();
        StepOutcome::Queries {
            queries,
            callback_id: self.callback_id,
        }
    }

    fn on_response(&mut self, callback_id: u64, answer: DnsAnswer) -> StepOutcome {
        if callback_id != self.callback_id {
            tracing::trace!(callback_id, current = self.callback_id, "stale response, discarding");
            return StepOutcome::Ignored;
        }

        let question = answer.question().clone();
        let Some(slot) = self.pending.iter_mut().find(|p| p.question == question) else {
            tracing::warn!(%question, "response does not match any pending query");
            return self.terminal_err(SpfError::UnexpectedResponse);
        };
        if slot.done {
            tracing::trace!(%question, "duplicate response, discarding");
            return StepOutcome::Ignored;
        }
        slot.done = true;

        let answer = normalize_transient_rcode(answer);

        if let DnsAnswer::Failure { reason, .. } = &answer {
            if self.pending.iter().any(|p| !p.done) {
                tracing::trace!(%question, "resolver failure, awaiting sibling query");
                return StepOutcome::Ignored;
            }
            if let Some(Awaiting::ExplainTxt { failed_comment }) = &self.awaiting {
                tracing::debug!(%question, "explain lookup failed, keeping prior Fail");
                return StepOutcome::Done(SpfResult {
                    disposition: SpfDisposition::Fail,
                    comment: failed_comment.clone(),
                    problem: None,
                });
            }
            return self.terminal_err(SpfError::TempError(reason.clone()));
        }

        let packet = match answer {
            DnsAnswer::Packet(p) => p,
            DnsAnswer::Failure { .. } => unreachable!("handled above"),
        };

        match self.awaiting.take() {
            Some(Awaiting::Record { spf, txt, kind }) => self.on_record_answer(spf, txt, kind, question, packet),
            Some(Awaiting::A { qualifier, cidr }) => self.on_a_answer(qualifier, cidr, packet),
            Some(Awaiting::Mx { qualifier, cidr }) => self.on_mx_answer(qualifier, cidr, packet),
            Some(Awaiting::MxExchange { qualifier, cidr, exchanges }) => {
                self.on_mx_exchange_answer(qualifier, cidr, exchanges, packet)
            }
            Some(Awaiting::Exists { qualifier }) => self.on_exists_answer(qualifier, packet),
            Some(Awaiting::Ptr { qualifier, validation }) => self.on_ptr_answer(qualifier, validation, packet),
            Some(Awaiting::ResolvingPMacro { validation, resume }) => {
                self.on_p_macro_answer(validation, resume, packet)
            }
            Some(Awaiting::ExplainTxt { failed_comment }) => self.on_explain_txt_answer(failed_comment, packet),
            None => self.terminal_err(SpfError::TempError("response with no pending operation".to_owned())),
        }
    }

    // ---- record fetch (initial / redirect / include) --------------------

    fn on_record_answer(
        &mut self,
        mut spf: RecordSlot,
        mut txt: RecordSlot,
        kind: RecordFetchKind,
        question: Question,
        packet: DnsPacket,
    ) -> StepOutcome {
        let slot = classify_record_slot(&packet);
        match question.kind {
            QuestionKind::Spf => spf = slot,
            QuestionKind::Txt => txt = slot,
            _ => unreachable!("record fetch only issues SPF/TXT questions"),
        }

        if let Some(outcome) = self.try_resolve_record(&spf, &txt, kind) {
            return outcome;
        }

        self.awaiting = Some(Awaiting::Record { spf, txt, kind });
        StepOutcome::Ignored
    }

    fn try_resolve_record(&mut self, spf: &RecordSlot, txt: &RecordSlot, kind: RecordFetchKind) -> Option<StepOutcome> {
        if matches!(spf, RecordSlot::Ambiguous) || matches!(txt, RecordSlot::Ambiguous) {
            return Some(self.terminal_err(SpfError::MultipleRecords));
        }
        if let (RecordSlot::Usable(a), RecordSlot::Usable(b)) = (spf, txt) {
            return Some(if a != b {
                self.terminal_err(SpfError::MultipleRecords)
            } else {
                self.on_record_text(a.clone())
            });
        }
        if let RecordSlot::Usable(text) = spf {
            return Some(self.on_record_text(text.clone()));
        }
        if let RecordSlot::Usable(text) = txt {
            return Some(self.on_record_text(text.clone()));
        }
        if matches!(spf, RecordSlot::NoRecord) && matches!(txt, RecordSlot::NoRecord) {
            return Some(self.on_no_record(kind));
        }
        None
    }

    fn on_no_record(&mut self, kind: RecordFetchKind) -> StepOutcome {
        match kind {
            RecordFetchKind::Initial => StepOutcome::Done(SpfResult {
                disposition: SpfDisposition::None,
                comment: "no SPF record found".to_owned(),
                problem: None,
            }),
            RecordFetchKind::Redirect => self.terminal_err(SpfError::NoRecordForRedirect),
            RecordFetchKind::Include => self.conclude_frame(SpfDisposition::None, "no SPF record found".to_owned()),
        }
    }

    fn on_record_text(&mut self, text: String) -> StepOutcome {
        match Record::parse(&text, self.client_ip) {
            Ok(record) => {
                self.mechanisms = record.directives.into_iter().collect();
                self.redirect = record.redirect;
                self.explain = record.explanation;
                self.dispatch_next_or_conclude()
            }
            Err(err) => self.terminal_err(err),
        }
    }

    // ---- mechanism dispatch loop ----------------------------------------

    fn dispatch_next_or_conclude(&mut self) -> StepOutcome {
        match self.mechanisms.pop_front() {
            Some(directive) => self.dispatch(directive),
            None => self.on_mechanisms_exhausted(),
        }
    }

    fn on_mechanisms_exhausted(&mut self) -> StepOutcome {
        if let Some(redirect) = self.redirect.take() {
            return self.start_redirect(redirect);
        }
        if !self.include_stack.is_empty() {
            let frame = self.include_stack.pop().unwrap();
            self.restore_frame(frame);
            return self.dispatch_next_or_conclude();
        }
        self.conclude_frame(SpfDisposition::Neutral, "default result".to_owned())
    }

    fn restore_frame(&mut self, frame: Frame) {
        self.domain = frame.domain;
        self.mechanisms = frame.mechanisms;
        self.redirect = frame.redirect;
        self.explain = frame.explain;
    }

    fn start_redirect(&mut self, redirect: MacroString) -> StepOutcome {
        if self.budget <= 0 {
            return self.terminal_err(SpfError::BudgetExceeded);
        }
        if redirect.needs_ptr() && !self.ptr_validation_done {
            return self.begin_ptr_for_macro(PtrResume::Redirect(redirect));
        }
        let domain = match self.expand_domain(&redirect) {
            Ok(d) => d,
            Err(outcome) => return outcome,
        };
        self.budget -= 1;
        self.domain = domain;
        self.fetch_record(RecordFetchKind::Redirect)
    }

    fn dispatch(&mut self, directive: Directive) -> StepOutcome {
        tracing::debug!(mechanism = %directive.mechanism, budget = self.budget, "dispatching mechanism");

        if directive.mechanism.is_dns_mechanism() {
            if self.budget <= 0 {
                return self.terminal_err(SpfError::BudgetExceeded);
            }
            if mechanism_domain_spec(&directive.mechanism)
                .map(MacroString::needs_ptr)
                .unwrap_or(false)
                && !self.ptr_validation_done
            {
                return self.begin_ptr_for_macro(PtrResume::Mechanism(directive));
            }
        }

        match directive.mechanism {
            Mechanism::All => self.conclude_match(directive.qualifier, "matches default".to_owned()),
            Mechanism::Ip4 { network, cidr } => {
                let matched = DualCidrLength::v4_only(cidr).matches(self.client_ip, IpAddr::V4(network));
                self.finish_sync_mechanism(matched, directive.qualifier, format!("matches ip4:{network}/{cidr}"))
            }
            Mechanism::Ip6 { network, cidr } => {
                let matched = DualCidrLength::v6_only(cidr).matches(self.client_ip, IpAddr::V6(network));
                self.finish_sync_mechanism(matched, directive.qualifier, format!("matches ip6:{network}/{cidr}"))
            }
            Mechanism::A { domain, cidr } => {
                self.budget -= 1;
                let domain = match self.resolve_mechanism_domain(domain.as_ref()) {
                    Ok(d) => d,
                    Err(outcome) => return outcome,
                };
                self.awaiting = Some(Awaiting::A { qualifier: directive.qualifier, cidr });
                self.emit(vec![Question::new(domain, self.address_kind())])
            }
            Mechanism::Mx { domain, cidr } => {
                self.budget -= 1;
                let domain = match self.resolve_mechanism_domain(domain.as_ref()) {
                    Ok(d) => d,
                    Err(outcome) => return outcome,
                };
                self.awaiting = Some(Awaiting::Mx { qualifier: directive.qualifier, cidr });
                self.emit(vec![Question::new(domain, QuestionKind::Mx)])
            }
            Mechanism::Exists { domain } => {
                self.budget -= 1;
                let domain = match self.resolve_mechanism_domain(Some(&domain)) {
                    Ok(d) => d,
                    Err(outcome) => return outcome,
                };
                self.awaiting = Some(Awaiting::Exists { qualifier: directive.qualifier });
                self.emit(vec![Question::new(domain, QuestionKind::A)])
            }
            Mechanism::Ptr { domain } => {
                self.budget -= 1;
                let restrict = match domain {
                    Some(d) => match self.resolve_mechanism_domain(Some(&d)) {
                        Ok(d) => Some(d),
                        Err(outcome) => return outcome,
                    },
                    None => Some(self.domain.clone()),
                };
                let validation = PtrValidation::new(self.client_ip, restrict);
                let query = validation.reverse_query();
                self.awaiting = Some(Awaiting::Ptr { qualifier: directive.qualifier, validation });
                self.emit(vec![Question::new(query, QuestionKind::Ptr)])
            }
            Mechanism::Include { domain } => {
                self.budget -= 1;
                let target = match self.resolve_mechanism_domain(Some(&domain)) {
                    Ok(d) => d,
                    Err(outcome) => return outcome,
                };
                self.include_stack.push(Frame {
                    domain: self.domain.clone(),
                    mechanisms: std::mem::take(&mut self.mechanisms),
                    redirect: self.redirect.take(),
                    explain: self.explain.take(),
                    qualifier: directive.qualifier,
                });
                self.domain = target;
                self.fetch_record(RecordFetchKind::Include)
            }
        }
    }

    fn finish_sync_mechanism(&mut self, matched: bool, qualifier: Qualifier, comment: String) -> StepOutcome {
        if matched {
            self.conclude_match(qualifier, comment)
        } else {
            self.dispatch_next_or_conclude()
        }
    }

    fn conclude_match(&mut self, qualifier: Qualifier, comment: String) -> StepOutcome {
        self.conclude_frame(SpfDisposition::from(qualifier), comment)
    }

    fn address_kind(&self) -> QuestionKind {
        if self.client_ip.is_ipv4() {
            QuestionKind::A
        } else {
            QuestionKind::Aaaa
        }
    }

    /// Expand (and validate) a mechanism's domain argument, or fall back to
    /// the current `domain` when none was given.
    fn resolve_mechanism_domain(&mut self, spec: Option<&MacroString>) -> Result<String, StepOutcome> {
        match spec {
            Some(spec) => self.expand_domain(spec),
            None => Ok(self.domain.clone()),
        }
    }

    fn expand_domain(&mut self, spec: &MacroString) -> Result<String, StepOutcome> {
        let raw = spec.to_string();
        if validate_pre_expansion(&raw).is_err() {
            return Err(self.terminal_err(SpfError::InvalidDomain {
                domain: raw,
                reason: "malformed before macro expansion",
            }));
        }
        match spec.expand(self, true, true) {
            Ok(domain) => {
                if validate_post_expansion(&domain).is_err() {
                    Err(self.terminal_err(SpfError::InvalidDomain {
                        domain,
                        reason: "malformed after macro expansion",
                    }))
                } else {
                    Ok(domain)
                }
            }
            Err(err) => Err(self.terminal_err(err)),
        }
    }

    // ---- `a` mechanism ----------------------------------------------------

    fn on_a_answer(&mut self, qualifier: Qualifier, cidr: DualCidrLength, packet: DnsPacket) -> StepOutcome {
        let matched = packet
            .resolved_addresses()
            .iter()
            .any(|&ip| cidr.matches(self.client_ip, ip));
        self.finish_sync_mechanism(matched, qualifier, "matches 'a'".to_owned())
    }

    // ---- `mx` mechanism ----------------------------------------------------

    fn on_mx_answer(&mut self, qualifier: Qualifier, cidr: DualCidrLength, packet: DnsPacket) -> StepOutcome {
        let mut exchanges: VecDeque<String> = packet.mx_exchanges().into();
        match exchanges.pop_front() {
            Some(name) => {
                self.awaiting = Some(Awaiting::MxExchange { qualifier, cidr, exchanges });
                self.emit(vec![Question::new(name, self.address_kind())])
            }
            None => self.dispatch_next_or_conclude(),
        }
    }

    fn on_mx_exchange_answer(
        &mut self,
        qualifier: Qualifier,
        cidr: DualCidrLength,
        mut exchanges: VecDeque<String>,
        packet: DnsPacket,
    ) -> StepOutcome {
        let matched = packet
            .resolved_addresses()
            .iter()
            .any(|&ip| cidr.matches(self.client_ip, ip));
        if matched {
            return self.conclude_match(qualifier, "matches 'mx'".to_owned());
        }
        match exchanges.pop_front() {
            Some(name) => {
                self.awaiting = Some(Awaiting::MxExchange { qualifier, cidr, exchanges });
                self.emit(vec![Question::new(name, self.address_kind())])
            }
            None => self.dispatch_next_or_conclude(),
        }
    }

    // ---- `exists` mechanism -------------------------------------------------

    fn on_exists_answer(&mut self, qualifier: Qualifier, packet: DnsPacket) -> StepOutcome {
        let matched = !packet.resolved_addresses().is_empty();
        self.finish_sync_mechanism(matched, qualifier, "matches 'exists'".to_owned())
    }

    // ---- `ptr` mechanism and deferred `%{p}` resolution --------------------

    fn on_ptr_answer(&mut self, qualifier: Qualifier, mut validation: PtrValidation, packet: DnsPacket) -> StepOutcome {
        let progress = self.progress_from_packet(&mut validation, &packet);
        match self.drive_ptr(validation, progress) {
            PtrDriveResult::Validated(_) => self.conclude_match(qualifier, "matches 'ptr'".to_owned()),
            PtrDriveResult::NotValidated => self.dispatch_next_or_conclude(),
            PtrDriveResult::Query(validation, name) => {
                self.awaiting = Some(Awaiting::Ptr { qualifier, validation });
                self.emit(vec![Question::new(name, self.address_kind())])
            }
        }
    }

    fn begin_ptr_for_macro(&mut self, resume: PtrResume) -> StepOutcome {
        let validation = PtrValidation::new(self.client_ip, None);
        let query = validation.reverse_query();
        self.awaiting = Some(Awaiting::ResolvingPMacro { validation, resume });
        self.emit(vec![Question::new(query, QuestionKind::Ptr)])
    }

    fn on_p_macro_answer(&mut self, mut validation: PtrValidation, resume: PtrResume, packet: DnsPacket) -> StepOutcome {
        let progress = self.progress_from_packet(&mut validation, &packet);
        match self.drive_ptr(validation, progress) {
            PtrDriveResult::Query(validation, name) => {
                self.awaiting = Some(Awaiting::ResolvingPMacro { validation, resume });
                self.emit(vec![Question::new(name, self.address_kind())])
            }
            _ => {
                self.ptr_validation_done = true;
                self.resume_after_ptr_macro(resume)
            }
        }
    }

    fn resume_after_ptr_macro(&mut self, resume: PtrResume) -> StepOutcome {
        match resume {
            PtrResume::Mechanism(directive) => self.dispatch(directive),
            PtrResume::Redirect(redirect) => self.start_redirect(redirect),
            PtrResume::Explain { failed_comment } => self.begin_explain(failed_comment),
        }
    }

    /// Turn the just-arrived packet into the next [`PtrProgress`] step,
    /// recording a fresh (non-memoized) forward-lookup result into
    /// `validated` as it goes.
    fn progress_from_packet(&mut self, validation: &mut PtrValidation, packet: &DnsPacket) -> PtrProgress {
        match packet.question.kind {
            QuestionKind::Ptr => validation.on_ptr_answer(packet.ptr_names()),
            _ => {
                let candidate = packet.question.name.clone();
                let progress = validation.on_forward_answer(&packet.resolved_addresses());
                if !matches!(&progress, PtrProgress::Validated(name) if name == &candidate) {
                    self.validated.insert((self.client_ip, candidate), false);
                }
                progress
            }
        }
    }

    /// Shared plumbing for both the `ptr` mechanism and `%{p}` macro
    /// resolution: consult the per-`(ip, name)` memo before issuing a
    /// forward lookup, and record the outcome once a fresh one runs.
    fn drive_ptr(&mut self, mut validation: PtrValidation, mut progress: PtrProgress) -> PtrDriveResult {
        loop {
            match progress {
                PtrProgress::NotValidated => return PtrDriveResult::NotValidated,
                PtrProgress::Validated(name) => {
                    self.validated.insert((self.client_ip, name.clone()), true);
                    return PtrDriveResult::Validated(name);
                }
                PtrProgress::NeedForward(name) => match self.validated.get(&(self.client_ip, name.clone())) {
                    Some(true) => progress = PtrProgress::Validated(name),
                    Some(false) => progress = validation.on_forward_answer(&[]),
                    None => return PtrDriveResult::Query(validation, name),
                },
            }
        }
    }

    // ---- explain ------------------------------------------------------------

    fn begin_explain(&mut self, failed_comment: String) -> StepOutcome {
        let Some(explain) = self.explain.clone() else {
            return StepOutcome::Done(SpfResult {
                disposition: SpfDisposition::Fail,
                comment: failed_comment,
                problem: None,
            });
        };

        if explain.needs_ptr() && !self.ptr_validation_done {
            // If resolving `exp`'s `%{p}` would itself require a PTR
            // validation we have not already performed, skip explanation
            // entirely rather than spend another DNS round trip on a
            // comment string.
            return StepOutcome::Done(SpfResult {
                disposition: SpfDisposition::Fail,
                comment: failed_comment,
                problem: None,
            });
        }

        let domain = match self.expand_domain(&explain) {
            Ok(d) => d,
            Err(_) => {
                return StepOutcome::Done(SpfResult {
                    disposition: SpfDisposition::Fail,
                    comment: failed_comment,
                    problem: None,
                })
            }
        };

        self.awaiting = Some(Awaiting::ExplainTxt { failed_comment });
        self.emit(vec![Question::new(domain, QuestionKind::Txt)])
    }

    fn on_explain_txt_answer(&mut self, failed_comment: String, packet: DnsPacket) -> StepOutcome {
        let texts = packet.txt_strings();
        let comment = if texts.len() == 1 {
            MacroString::parse(&texts[0])
                .ok()
                .and_then(|spec| spec.expand(self, true, false).ok())
                .map(|s| restrict_to_printable_ascii(&s))
        } else {
            None
        };

        StepOutcome::Done(SpfResult {
            disposition: SpfDisposition::Fail,
            comment: comment.unwrap_or(failed_comment),
            problem: None,
        })
    }

    // ---- include / top-level folding ----------------------------------------

    /// Fold a record's natural conclusion (a matched mechanism, or the
    /// `Neutral` default when mechanisms are exhausted with no redirect)
    /// through the `include` stack, or finish at the top level.
    fn conclude_frame(&mut self, disposition: SpfDisposition, comment: String) -> StepOutcome {
        if self.include_stack.is_empty() {
            return self.finalize_top_level(disposition, comment);
        }

        let (disposition, comment) = if disposition == SpfDisposition::None {
            (SpfDisposition::PermError, SpfError::NoneInsideInclude.to_string())
        } else {
            (disposition, comment)
        };

        match disposition {
            SpfDisposition::TempError | SpfDisposition::PermError => self.terminal(disposition, comment),
            SpfDisposition::Pass => {
                let frame = self.include_stack.pop().unwrap();
                let qualifier = frame.qualifier;
                self.restore_frame(frame);
                self.conclude_frame(SpfDisposition::from(qualifier), "included".to_owned())
            }
            SpfDisposition::Fail | SpfDisposition::SoftFail | SpfDisposition::Neutral => {
                let frame = self.include_stack.pop().unwrap();
                self.restore_frame(frame);
                self.dispatch_next_or_conclude()
            }
            SpfDisposition::None => unreachable!("promoted to PermError above"),
        }
    }

    fn finalize_top_level(&mut self, disposition: SpfDisposition, comment: String) -> StepOutcome {
        if disposition == SpfDisposition::Fail {
            return self.begin_explain(comment);
        }
        StepOutcome::Done(SpfResult { disposition, comment, problem: None })
    }

    fn terminal(&mut self, disposition: SpfDisposition, problem: String) -> StepOutcome {
        StepOutcome::Done(SpfResult {
            comment: problem.clone(),
            problem: Some(problem),
            disposition,
        })
    }

    fn terminal_err(&mut self, err: SpfError) -> StepOutcome {
        self.terminal(err.disposition(), err.to_string())
    }
}

fn mechanism_domain_spec(mechanism: &Mechanism) -> Option<&MacroString> {
    match mechanism {
        Mechanism::A { domain, .. } | Mechanism::Mx { domain, .. } | Mechanism::Ptr { domain } => domain.as_ref(),
        Mechanism::Exists { domain } | Mechanism::Include { domain } => Some(domain),
        Mechanism::All | Mechanism::Ip4 { .. } | Mechanism::Ip6 { .. } => None,
    }
}

fn classify_record_slot(packet: &DnsPacket) -> RecordSlot {
    if packet.rcode != Rcode::NoError {
        return RecordSlot::NoRecord;
    }
    let candidates: Vec<String> = packet
        .txt_strings()
        .into_iter()
        .filter(|s| s.to_ascii_lowercase().starts_with("v=spf1"))
        .collect();
    match candidates.len() {
        0 => RecordSlot::NoRecord,
        1 => RecordSlot::Usable(candidates.into_iter().next().unwrap()),
        _ => RecordSlot::Ambiguous,
    }
}

fn normalize_transient_rcode(answer: DnsAnswer) -> DnsAnswer {
    match answer {
        DnsAnswer::Packet(packet) if packet.rcode == Rcode::Other => DnsAnswer::Failure {
            question: packet.question.clone(),
            reason: "non-NOERROR/NXDOMAIN response code".to_owned(),
        },
        other => other,
    }
}

fn normalize_v4_mapped(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

fn restrict_to_printable_ascii(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii() && !c.is_ascii_control()).collect()
}

impl MacroContext for Evaluator {
    fn sender(&self) -> &str {
        &self.sender
    }
    fn local_part(&self) -> &str {
        &self.local_part
    }
    fn sender_domain(&self) -> &str {
        &self.sender_domain
    }
    fn domain(&self) -> &str {
        &self.domain
    }
    fn client_ip_is_v4(&self) -> bool {
        self.client_ip.is_ipv4()
    }
    fn ip_dotted(&self) -> String {
        match self.client_ip {
            IpAddr::V4(v4) => v4.to_string(),
            IpAddr::V6(v6) => {
                let mut out = String::new();
                for segment in v6.segments() {
                    for ch in format!("{segment:04x}").chars() {
                        if !out.is_empty() {
                            out.push('.');
                        }
                        out.push(ch);
                    }
                }
                out
            }
        }
    }
    fn client_ip_presentation(&self) -> String {
        self.client_ip.to_string()
    }
    fn helo(&self) -> &str {
        &self.helo
    }
    fn relaying_host_name(&self) -> &str {
        &self.my_host_name
    }
    fn now_unix(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
    fn validated_ptr_name(&self) -> PtrMacroState {
        if !self.ptr_validation_done {
            return PtrMacroState::NotYetAttempted;
        }
        let chosen = choose_p_macro(
            self.validated.iter().map(|(key, ok)| (&key.0, key.1.as_str(), *ok)),
            self.client_ip,
            &self.domain,
        );
        PtrMacroState::Resolved(chosen)
    }
}
