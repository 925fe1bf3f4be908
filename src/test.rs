use std::{
    net::{Ipv4Addr, Ipv6Addr, SocketAddr},
    str::FromStr,
    sync::Arc,
};

use hickory_server::proto::{
    op::{Message, MessageType, Query},
    rr::{Name, RecordType},
};

use crate::{
    config::Options,
    dns::Dispatcher,
    geo::{Geo, GeoCache},
    zone::{OneOrMany, ServerEntry, ServerState, Zone},
};

pub(crate) fn name(n: &str) -> Name {
    Name::from_str(n).unwrap()
}

pub(crate) fn client() -> SocketAddr {
    "192.0.2.99:4096".parse().unwrap()
}

pub(crate) fn zone_json(json: &str) -> Zone {
    serde_json::from_str(json).unwrap()
}

pub(crate) fn query_packet(qname: &str, qtype: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message
        .set_id(4242)
        .set_message_type(MessageType::Query)
        .set_recursion_desired(true);
    message.add_query(Query::query(name(qname), qtype));

    message.to_vec().unwrap()
}

pub(crate) fn parse_reply(data: &[u8]) -> Message {
    Message::from_vec(data).unwrap()
}

pub(crate) fn dispatcher(state: ServerState, geo: Option<Arc<Geo>>) -> Dispatcher {
    Dispatcher::new(state, geo, Arc::new(GeoCache::new()), Options::default())
}

pub(crate) fn server_entry(
    name: &str,
    lat: f64,
    lon: f64,
    ipv4: &[&str],
    ipv6: &[&str],
) -> ServerEntry {
    let ipv4: Vec<Ipv4Addr> = ipv4.iter().map(|addr| addr.parse().unwrap()).collect();
    let ipv6: Vec<Ipv6Addr> = ipv6.iter().map(|addr| addr.parse().unwrap()).collect();

    ServerEntry {
        name: name.to_string(),
        city: None,
        lat,
        lon,
        ipv4: (!ipv4.is_empty()).then_some(OneOrMany::Many(ipv4)),
        ipv6: (!ipv6.is_empty()).then_some(OneOrMany::Many(ipv6)),
        load: None,
        ts: None,
    }
}
