use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use async_recursion::async_recursion;
use hickory_server::proto::{
    op::{Message, MessageType, OpCode, ResponseCode},
    rr::{rdata, Name, RData, Record, RecordType},
};
use tracing::{instrument, Span};

use crate::{
    config::Options,
    dns::record::{construct_rdata, parse_name},
    geo::{CacheKey, Geo, GeoCache},
    zone::{GeoDistZone, RecordSpec, ServerEntry, ServerState, Zone, ZoneKind},
    Error,
};

/// Which section of the reply a record lands in. The recursion carries
/// this explicitly: answers by default, authority during the parent
/// walk, additionals when chasing NS targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Answer,
    Authority,
    Additional,
}

/// Per-query scratch state. Lives only for the duration of reply
/// assembly and is never shared.
struct RequestState {
    client: SocketAddr,
    qname: String,

    /// (name, qtype) pairs already visited, guarding against CNAME/NS
    /// loops in the zone data.
    chain: HashSet<(String, RecordType)>,

    /// String forms of rdata already inserted, for duplicate
    /// suppression across all sections.
    added: HashSet<String>,

    answers: Vec<Record>,
    authority: Vec<Record>,
    additionals: Vec<Record>,
}

impl RequestState {
    fn new(client: SocketAddr, qname: String) -> Self {
        Self {
            client,
            qname,
            chain: HashSet::new(),
            added: HashSet::new(),
            answers: Vec::new(),
            authority: Vec::new(),
            additionals: Vec::new(),
        }
    }

    fn add_record(&mut self, section: Section, record: Record) -> bool {
        let Some(data) = record.data() else {
            return false;
        };

        let key = format!("{} {}", record.record_type(), data);
        if !self.added.insert(key) {
            return false;
        }

        match section {
            Section::Answer => self.answers.push(record),
            Section::Authority => self.authority.push(record),
            Section::Additional => self.additionals.push(record),
        }

        true
    }
}

fn fqdn_string(name: &Name) -> String {
    let name = name.to_string();
    if name.ends_with('.') {
        name
    } else {
        format!("{name}.")
    }
}

fn ensure_trailing_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

/// The parent of a name: the leftmost label dropped, bottoming out at
/// the root label.
fn parent_name(name: &str) -> String {
    match name.split_once('.') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => ".".to_string(),
    }
}

/// The client address used for geo lookups and cache keys. IPv4
/// clients arrive on the dual-stack socket mapped as `::ffff:a.b.c.d`;
/// the embedded address is recovered.
fn client_key(client: &SocketAddr) -> String {
    let ip = client.ip().to_string();
    match ip.strip_prefix("::ffff:") {
        Some(v4) => v4.to_string(),
        None => ip,
    }
}

fn type_matches(qtype: RecordType, rtype: RecordType) -> bool {
    if qtype == RecordType::ANY || qtype == rtype {
        return true;
    }

    // An A or AAAA query also collects CNAMEs so a chain of aliases
    // resolves naturally.
    matches!(qtype, RecordType::A | RecordType::AAAA) && rtype == RecordType::CNAME
}

/// Interprets DNS questions against the zone and server tables and
/// assembles replies.
#[derive(Clone)]
pub(crate) struct Dispatcher {
    state: ServerState,
    geo: Option<Arc<Geo>>,
    cache: Arc<GeoCache>,
    options: Options,
}

impl Dispatcher {
    pub(crate) fn new(
        state: ServerState,
        geo: Option<Arc<Geo>>,
        cache: Arc<GeoCache>,
        options: Options,
    ) -> Self {
        Self {
            state,
            geo,
            cache,
            options,
        }
    }

    /// Handles one raw DNS packet, returning the raw reply. `None`
    /// means no reply is sent: the packet did not decode, or assembly
    /// failed partway.
    #[instrument(name = "request", fields(
        client = %client,
        qname = tracing::field::Empty,
        qtype = tracing::field::Empty,
        response_code = tracing::field::Empty,
    ), skip_all)]
    pub(crate) async fn handle(&self, data: &[u8], client: SocketAddr) -> Option<Vec<u8>> {
        let request = match Message::from_vec(data) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable packet");
                return None;
            }
        };

        // Only the first question is answered.
        let Some(query) = request.queries().first().cloned() else {
            tracing::debug!("Dropping packet with no question");
            return None;
        };

        let qname = fqdn_string(query.name());
        let qtype = query.query_type();

        let span = Span::current();
        span.record("qname", qname.as_str());
        span.record("qtype", tracing::field::display(qtype));

        let mut state = RequestState::new(client, qname.clone());
        let result = self
            .handle_zone(&qname, qtype, &mut state, Section::Answer)
            .await;

        let mut reply = Message::new();
        reply
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_authoritative(true)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(false);
        reply.add_query(query);

        let response_code = match result {
            Err(e) => {
                tracing::warn!(error = %e, "Refusing query");
                ResponseCode::Refused
            }
            // A recursion cycle in the zone data; answer nothing.
            Ok(None) => ResponseCode::Refused,
            Ok(Some(true)) => {
                // Attach authority from the closest enclosing zone
                // that knows its name servers; absence is fine.
                self.add_authority(RecordType::NS, &mut state).await;
                ResponseCode::NoError
            }
            Ok(Some(false)) => {
                if self.add_authority(RecordType::SOA, &mut state).await {
                    ResponseCode::NoError
                } else {
                    ResponseCode::Refused
                }
            }
        };

        reply.set_response_code(response_code);
        span.record("response_code", response_code.to_str());

        reply.insert_answers(state.answers);
        reply.insert_name_servers(state.authority);
        reply.insert_additionals(state.additionals);

        match reply.to_vec() {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode reply");
                None
            }
        }
    }

    /// Walks from the query name towards the root looking for a zone
    /// that answers `qtype`, adding what it finds to the authority
    /// section. Returns whether any zone answered.
    async fn add_authority(&self, qtype: RecordType, state: &mut RequestState) -> bool {
        let mut name = state.qname.clone();

        loop {
            if let Ok(Some(true)) = self
                .handle_zone(&name, qtype, state, Section::Authority)
                .await
            {
                return true;
            }

            if name == "." {
                return false;
            }
            name = parent_name(&name);
        }
    }

    /// Resolves one name against the zone table. Returns `None` when
    /// this (name, qtype) pair was already visited, `Some(false)` when
    /// the name is not served or nothing matched, `Some(true)` when at
    /// least one record matched.
    #[async_recursion]
    async fn handle_zone(
        &self,
        name: &str,
        qtype: RecordType,
        state: &mut RequestState,
        section: Section,
    ) -> Result<Option<bool>, Error> {
        let key = (name.to_string(), qtype);
        if state.chain.contains(&key) {
            return Ok(None);
        }
        state.chain.insert(key);

        // Clone the zone out so the lock is released before dispatch.
        let Some(zone) = self.state.zone(name).await else {
            return Ok(Some(false));
        };

        match &zone.kind {
            ZoneKind::Static(inner) => self
                .handle_static(name, &zone, &inner.rr, qtype, state, section)
                .await
                .map(Some),
            ZoneKind::GeoDist(inner) => self
                .handle_geo_dist(name, &zone, inner, qtype, state, section)
                .await
                .map(Some),
        }
    }

    async fn handle_static(
        &self,
        name: &str,
        zone: &Zone,
        rr: &[RecordSpec],
        qtype: RecordType,
        state: &mut RequestState,
        section: Section,
    ) -> Result<bool, Error> {
        let Some(owner) = parse_name(name) else {
            return Ok(false);
        };

        let ttl = zone.ttl.unwrap_or(self.options.default_ttl);
        let mut matched = false;
        let mut chase: Vec<RecordSpec> = Vec::new();

        for spec in rr {
            if !type_matches(qtype, spec.record_type()) {
                continue;
            }

            let Some(rdata) = construct_rdata(spec) else {
                continue;
            };
            matched = true;

            let record = Record::from_rdata(owner.clone(), ttl, rdata);
            if state.add_record(section, record)
                && matches!(
                    qtype,
                    RecordType::A | RecordType::AAAA | RecordType::NS | RecordType::ANY
                )
            {
                chase.push(spec.clone());
            }
        }

        for spec in chase {
            self.check_additional(&spec, qtype, state, section).await?;
        }

        Ok(matched)
    }

    /// For records that point at another name, chases the target
    /// through the zone table. NS targets are resolved as glue into
    /// the additional section.
    async fn check_additional(
        &self,
        spec: &RecordSpec,
        qtype: RecordType,
        state: &mut RequestState,
        section: Section,
    ) -> Result<(), Error> {
        let (target, is_ns) = match spec {
            RecordSpec::Mx { value, .. } => (value, false),
            RecordSpec::Cname { value } => (value, false),
            RecordSpec::Ns { value } => (value, true),
            _ => return Ok(()),
        };

        let target = ensure_trailing_dot(target);

        if is_ns {
            self.handle_zone(&target, RecordType::A, state, Section::Additional)
                .await?;
            self.handle_zone(&target, RecordType::AAAA, state, Section::Additional)
                .await?;
        } else if qtype == RecordType::ANY {
            self.handle_zone(&target, RecordType::A, state, section)
                .await?;
            self.handle_zone(&target, RecordType::AAAA, state, section)
                .await?;
        } else {
            self.handle_zone(&target, qtype, state, section).await?;
        }

        Ok(())
    }

    async fn handle_geo_dist(
        &self,
        name: &str,
        zone: &Zone,
        geo_zone: &GeoDistZone,
        qtype: RecordType,
        state: &mut RequestState,
        section: Section,
    ) -> Result<bool, Error> {
        if !matches!(
            qtype,
            RecordType::A | RecordType::AAAA | RecordType::ANY
        ) {
            return Ok(false);
        }

        let mut set_name = geo_zone.servers.as_deref().unwrap_or("default");
        let mut servers = self.state.server_set(set_name).await;

        if servers.is_none() && set_name != "default" {
            set_name = "default";
            servers = self.state.server_set(set_name).await;
        }

        if let (Some(geo), Some(servers)) = (&self.geo, &servers) {
            let client = client_key(&state.client);
            let cache_key = CacheKey {
                client: client.clone(),
                set: set_name.to_string(),
                params: geo_zone.params.cache_key(),
            };

            let mut params = geo_zone.params.clone();
            if params.precision.is_none() {
                params.precision = Some(self.options.distance_precision);
            }

            let selected = match self.cache.get(&cache_key).await {
                Some(selected) => Some(selected),
                None => {
                    let selected = geo.find_closest_server(servers, &client, &params)?;

                    if let Some(ref selected) = selected {
                        let ttl = geo_zone.geo_cache_ttl.unwrap_or(self.options.geo_cache_ttl);
                        self.cache
                            .insert(cache_key, selected.clone(), Duration::from_secs(ttl))
                            .await;
                    }

                    selected
                }
            };

            if let Some(selected) = selected {
                if !selected.is_empty() {
                    self.add_geo_answers(name, zone, geo_zone, &selected, qtype, state, section);
                    return Ok(true);
                }
            }
        }

        // Fall through to any static records if the geo machinery is
        // unavailable or came up empty.
        if let Some(rr) = &geo_zone.rr {
            return self
                .handle_static(name, zone, rr, qtype, state, section)
                .await;
        }

        Ok(false)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_geo_answers(
        &self,
        name: &str,
        zone: &Zone,
        geo_zone: &GeoDistZone,
        selected: &[ServerEntry],
        qtype: RecordType,
        state: &mut RequestState,
        section: Section,
    ) {
        let Some(owner) = parse_name(name) else {
            return;
        };

        let ttl = zone.ttl.unwrap_or(self.options.default_ttl);

        for server in selected {
            if matches!(qtype, RecordType::A | RecordType::ANY) {
                if let Some(addrs) = &server.ipv4 {
                    for addr in addrs.iter() {
                        let record =
                            Record::from_rdata(owner.clone(), ttl, RData::A(rdata::A(*addr)));
                        state.add_record(section, record);
                    }
                }
            }

            if matches!(qtype, RecordType::AAAA | RecordType::ANY) {
                if let Some(addrs) = &server.ipv6 {
                    for addr in addrs.iter() {
                        let record =
                            Record::from_rdata(owner.clone(), ttl, RData::AAAA(rdata::AAAA(*addr)));
                        state.add_record(section, record);
                    }
                }
            }
        }

        if geo_zone.debug && matches!(qtype, RecordType::TXT | RecordType::ANY) {
            for server in selected {
                let txt = rdata::TXT::new(vec![
                    format!("name: {}", server.name),
                    format!("city: {}", server.city.as_deref().unwrap_or("")),
                ]);
                let record = Record::from_rdata(owner.clone(), ttl, RData::TXT(txt));
                state.add_record(section, record);
            }
        }
    }
}
