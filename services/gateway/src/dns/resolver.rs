//! Private-zone answering.
//!
//! Pure query-to-answer logic; the listener owns sockets and framing.

use std::net::Ipv4Addr;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{rdata, Name, RData, Record, RecordType};
use tracing::warn;

use crate::store::{RecordKind, Zone};

/// Fixed TTL for private-zone answers.
pub const RECORD_TTL: u32 = 60;

/// Outcome of answering a query inside a matched zone.
#[derive(Debug)]
pub enum ZoneAnswer {
    /// The CN is not in the zone's access list. An unauthorized peer
    /// learns only that it is unauthorized, not whether the name exists.
    Refused,
    /// The label resolved; answers may be empty for a type mismatch.
    Records(Vec<Record>),
    /// The zone is authoritative and the label does not exist.
    NxDomain,
}

/// Answer a query for `qname` inside the zone it matched.
///
/// The label below the zone apex is looked up directly, then through the
/// `*` wildcard. A-records answer only A queries; CNAME records answer
/// any query type.
pub fn answer_zone_query(
    qname: &str,
    query: &Query,
    zone_name: &str,
    zone: &Zone,
    cn: &str,
) -> ZoneAnswer {
    if !zone.allows(cn) {
        return ZoneAnswer::Refused;
    }

    let label = if qname == zone_name {
        "@"
    } else {
        qname
            .strip_suffix(zone_name)
            .map(|l| l.trim_end_matches('.'))
            .unwrap_or(qname)
    };

    let records = zone
        .records
        .get(label)
        .or_else(|| zone.records.get("*"));

    let Some(records) = records else {
        return ZoneAnswer::NxDomain;
    };

    let qtype = query.query_type();
    let mut answers = Vec::new();
    for record in records {
        match record.kind {
            RecordKind::A if qtype == RecordType::A => {
                let Ok(addr) = record.value.parse::<Ipv4Addr>() else {
                    warn!(zone = zone_name, label, value = %record.value, "Unparseable A record");
                    continue;
                };
                answers.push(Record::from_rdata(
                    query.name().clone(),
                    RECORD_TTL,
                    RData::A(rdata::A(addr)),
                ));
            }
            RecordKind::Cname => {
                let target = format!("{}.", record.value.trim_end_matches('.'));
                let Ok(target) = Name::from_ascii(&target) else {
                    warn!(zone = zone_name, label, value = %record.value, "Unparseable CNAME record");
                    continue;
                };
                answers.push(Record::from_rdata(
                    query.name().clone(),
                    RECORD_TTL,
                    RData::CNAME(rdata::CNAME(target)),
                ));
            }
            RecordKind::A => {}
        }
    }

    ZoneAnswer::Records(answers)
}

/// Build a response mirroring the request's id and flags (QR=1, AA=1,
/// RA=0) with the given code and answers.
pub fn build_response(request: &Message, code: ResponseCode, answers: Vec<Record>) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_authoritative(true);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(false);
    response.set_response_code(code);
    for query in request.queries() {
        response.add_query(query.clone());
    }
    for answer in answers {
        response.add_answer(answer);
    }
    response
}

/// Build a minimal error response for a message that did not parse,
/// recovering the transaction id from the raw header when possible.
pub fn build_raw_error(raw: &[u8], code: ResponseCode) -> Option<Vec<u8>> {
    if raw.len() < 2 {
        return None;
    }
    let mut response = Message::new();
    response.set_id(u16::from_be_bytes([raw[0], raw[1]]));
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_response_code(code);
    response.to_vec().ok()
}
