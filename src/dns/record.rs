use hickory_server::proto::rr::{rdata, Name, RData};

use crate::zone::RecordSpec;

pub(super) fn parse_name(value: &str) -> Option<Name> {
    match Name::from_utf8(value) {
        Ok(mut name) => {
            name.set_fqdn(true);
            Some(name)
        }
        Err(e) => {
            tracing::warn!(value, error = %e, "Invalid domain name in record data");
            None
        }
    }
}

/// Builds the wire rdata for a record spec. Returns `None` (after
/// logging) when the spec holds an unparseable name.
pub(super) fn construct_rdata(spec: &RecordSpec) -> Option<RData> {
    match spec {
        RecordSpec::Soa {
            mname,
            rname,
            times,
        } => {
            let (serial, refresh, retry, expire, minimum) = *times;
            Some(RData::SOA(rdata::SOA::new(
                parse_name(mname)?,
                parse_name(rname)?,
                serial,
                refresh,
                retry,
                expire,
                minimum,
            )))
        }
        RecordSpec::A { value } => Some(RData::A(rdata::A(*value))),
        RecordSpec::Aaaa { value } => Some(RData::AAAA(rdata::AAAA(*value))),
        RecordSpec::Ns { value } => Some(RData::NS(rdata::NS(parse_name(value)?))),
        RecordSpec::Cname { value } => Some(RData::CNAME(rdata::CNAME(parse_name(value)?))),
        RecordSpec::Txt { value } => Some(RData::TXT(rdata::TXT::new(vec![value.clone()]))),
        RecordSpec::Ptr { value } => Some(RData::PTR(rdata::PTR(parse_name(value)?))),
        RecordSpec::Mx { value, pref } => {
            Some(RData::MX(rdata::MX::new(*pref, parse_name(value)?)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::name;

    #[test]
    fn address_records() {
        let rdata = construct_rdata(&RecordSpec::A {
            value: "10.0.0.1".parse().unwrap(),
        })
        .unwrap();
        assert_eq!(rdata, RData::A(rdata::A("10.0.0.1".parse().unwrap())));

        let rdata = construct_rdata(&RecordSpec::Aaaa {
            value: "2001:db8::1".parse().unwrap(),
        })
        .unwrap();
        assert_eq!(
            rdata,
            RData::AAAA(rdata::AAAA("2001:db8::1".parse().unwrap()))
        );
    }

    #[test]
    fn name_records() {
        let rdata = construct_rdata(&RecordSpec::Cname {
            value: "www.example.".to_string(),
        })
        .unwrap();
        assert_eq!(rdata, RData::CNAME(rdata::CNAME(name("www.example."))));

        let rdata = construct_rdata(&RecordSpec::Mx {
            value: "mail.example.".to_string(),
            pref: 10,
        })
        .unwrap();
        assert_eq!(rdata, RData::MX(rdata::MX::new(10, name("mail.example."))));

        // Relative names are treated as absolute.
        let rdata = construct_rdata(&RecordSpec::Ns {
            value: "ns1.example".to_string(),
        })
        .unwrap();
        assert_eq!(rdata, RData::NS(rdata::NS(name("ns1.example."))));
    }

    #[test]
    fn soa_record() {
        let rdata = construct_rdata(&RecordSpec::Soa {
            mname: "ns.example.".to_string(),
            rname: "hostmaster.example.".to_string(),
            times: (2024010101, 7200, 3600, 604800, 300),
        })
        .unwrap();

        let RData::SOA(soa) = rdata else {
            panic!("expected SOA rdata");
        };
        assert_eq!(*soa.mname(), name("ns.example."));
        assert_eq!(soa.serial(), 2024010101);
        assert_eq!(soa.minimum(), 300);
    }

    #[test]
    fn invalid_name_rejected() {
        // Labels are limited to 63 octets.
        let overlong = format!("{}.example.", "x".repeat(70));
        assert_eq!(
            construct_rdata(&RecordSpec::Cname { value: overlong }),
            None
        );
    }
}
