//! The query pipeline.
//!
//! Turns one request into one reply: local records first, then the cache,
//! then the upstream. Every failure inside the pipeline becomes a DNS error
//! reply; nothing here panics on a bad query.

use std::sync::Arc;

use log::{debug, warn};

use crate::cache::DnsCache;
use crate::config::{ResolverSettings, SettingsHandle};
use crate::db::{LocalAnswer, RecordStore};
use crate::dns::{patch_forwarded_reply, Header, Message, Question, Rcode, OPCODE_QUERY};
use crate::errors::{DnsError, ForwardError};
use crate::forwarder::Upstream;
use crate::record::{DnsRecord, RecordType};
use crate::responder::{build_reply, error_reply, truncate_reply, udp_limit, ReplyFlags};
use crate::stats::Stats;

/// How a request reached the server; decides the reply size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    fn reply_limit(self, request: &Message) -> usize {
        match self {
            Transport::Udp => udp_limit(request),
            Transport::Tcp => u16::MAX as usize,
        }
    }
}

/// Shared state a query is resolved against.
#[derive(Clone)]
pub struct QueryPipeline {
    records: Arc<RecordStore>,
    cache: Arc<DnsCache>,
    settings: Arc<SettingsHandle>,
    upstream: Arc<dyn Upstream>,
    stats: Arc<Stats>,
}

impl QueryPipeline {
    pub fn new(
        records: Arc<RecordStore>,
        cache: Arc<DnsCache>,
        settings: Arc<SettingsHandle>,
        upstream: Arc<dyn Upstream>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            records,
            cache,
            settings,
            upstream,
            stats,
        }
    }

    pub fn records(&self) -> &Arc<RecordStore> {
        &self.records
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn settings(&self) -> &Arc<SettingsHandle> {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Handle one raw request.
    ///
    /// # Arguments
    /// * `raw` - The request bytes, without TCP length prefix.
    /// * `transport` - Where the request came from.
    ///
    /// # Returns
    /// The reply to send, or `None` if the request should be dropped.
    pub async fn handle(&self, raw: &[u8], transport: Transport) -> Option<Vec<u8>> {
        if raw.len() < 2 {
            debug!("Dropping runt packet of {} bytes", raw.len());
            return None;
        }
        if raw.get(2).is_some_and(|flags| flags & 0x80 != 0) {
            debug!("Dropping packet with QR set");
            return None;
        }
        self.stats.record_query();

        let request = match Message::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!("Received malformed query: {}", e);
                return error_reply(raw, Rcode::FormErr);
            }
        };
        if request.header.opcode() != OPCODE_QUERY {
            debug!("Unsupported opcode {}", request.header.opcode());
            return error_reply(raw, Rcode::NotImp);
        }
        let question = match request.questions.as_slice() {
            [] => return error_reply(raw, Rcode::FormErr),
            [question] => question.clone(),
            _ => return error_reply(raw, Rcode::NotImp),
        };

        // Settings are fixed for the lifetime of this query.
        let settings = self.settings.resolver();
        let limit = transport.reply_limit(&request);

        match self
            .resolve(raw, &request, &question, &settings, limit)
            .await
        {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(
                    "Failed to resolve {} {}: {}",
                    question.name,
                    question.record_type(),
                    e
                );
                error_reply(raw, Rcode::ServFail)
            }
        }
    }

    async fn resolve(
        &self,
        raw: &[u8],
        request: &Message,
        question: &Question,
        settings: &ResolverSettings,
        limit: usize,
    ) -> Result<Vec<u8>, DnsError> {
        let qname = question.normalized_name();
        let qtype = question.qtype;
        let class = question.class();
        debug!("Query for {} {} {}", qname, question.record_type(), class);

        match self.local_answer(&qname, question, settings) {
            LocalAnswer::Found(answers) => {
                self.stats.record_local_answer();
                return build_reply(
                    request,
                    Rcode::NoError,
                    &answers,
                    ReplyFlags::authoritative(),
                    limit,
                );
            }
            LocalAnswer::NoData => {
                self.stats.record_local_answer();
                return build_reply(
                    request,
                    Rcode::NoError,
                    &[],
                    ReplyFlags::authoritative(),
                    limit,
                );
            }
            LocalAnswer::Missing => {}
        }

        if settings.cache_enabled {
            if let Some(answers) = self.cache.resolve(&qname, qtype, class) {
                debug!("Cache hit for {} {}", qname, question.record_type());
                self.stats.record_cache_hit();
                return build_reply(
                    request,
                    Rcode::NoError,
                    &answers,
                    ReplyFlags::recursive(),
                    limit,
                );
            }
        }

        if question.record_type() == RecordType::PTR && !settings.forward_ptr_queries {
            debug!("Not forwarding PTR query for {}", qname);
            return build_reply(
                request,
                Rcode::NxDomain,
                &[],
                ReplyFlags::authoritative(),
                limit,
            );
        }

        self.stats.record_forward();
        let mut reply = match self.upstream.forward(raw, settings).await {
            Ok(reply) => reply,
            Err(e) => {
                self.stats.record_forward_failure();
                return Err(e.into());
            }
        };

        let parsed = Message::parse(&reply).map_err(|e| {
            self.stats.record_forward_failure();
            ForwardError::MalformedReply(e.to_string())
        })?;
        if settings.cache_enabled {
            self.cache_answers(&parsed);
        }

        patch_forwarded_reply(&mut reply, request.header.id)?;
        truncate_reply(reply, limit)
    }

    /// Look the question up in the record store, synthesising PTRs if enabled.
    fn local_answer(
        &self,
        qname: &str,
        question: &Question,
        settings: &ResolverSettings,
    ) -> LocalAnswer {
        let answer = self.records.lookup(qname, question.qtype, question.class());
        if matches!(answer, LocalAnswer::Found(_))
            || question.record_type() != RecordType::PTR
            || !settings.auto_build_ptr_from_a
        {
            return answer;
        }
        match self.records.synthesize_ptr(qname) {
            Some(ptr) => LocalAnswer::Found(vec![ptr]),
            None => answer,
        }
    }

    /// Store the answer section of an upstream reply.
    fn cache_answers(&self, reply: &Message) {
        let cacheable = match reply.header.rcode() {
            Rcode::NoError => !reply.answers.is_empty(),
            Rcode::NxDomain => true,
            _ => false,
        };
        if !cacheable || reply.header.has(Header::TC) {
            return;
        }
        let records: Vec<DnsRecord> = reply
            .answers
            .iter()
            .filter(|rr| !rr.is_opt())
            .filter_map(|rr| match rr.to_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    debug!("Not caching undecodable {} record: {}", rr.name, e);
                    None
                }
            })
            .collect();
        if !records.is_empty() {
            self.cache.put_all(records);
        }
    }
}
