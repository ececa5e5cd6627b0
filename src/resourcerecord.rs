use crate::enums::{RecordClass, RecordType};
use crate::error::YakNsError;
use crate::utils::{check_long_labels, name_as_bytes, MAX_NAME_LENGTH};

use regex::RegexBuilder;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::LazyLock;

// We use a regex instead of the public suffix list here to allow for
// internal domains that do not end in a "real" TLD.
static DOMAIN_VALIDATOR: LazyLock<regex::Regex> = LazyLock::new(|| {
    RegexBuilder::new(r"^(?:[a-z0-9\-_]+\.)+(?:[a-z0-9\-_]+)\.?$")
        .case_insensitive(true)
        .build()
        .expect("domain validator regex failed to compile")
});

const CAA_VALID_TAGS: [&str; 3] = ["issue", "issuewild", "iodef"];

/// Default record time-to-live in seconds.
pub const DEFAULT_TTL: u32 = 300;
/// NS and CAA records change rarely, give them a longer default.
pub const DEFAULT_NS_TTL: u32 = 3600;
pub const DEFAULT_CAA_TTL: u32 = 3600;
pub const DEFAULT_SOA_TTL: u32 = 3600;
pub const DEFAULT_SOA_REFRESH: u32 = 86400;
pub const DEFAULT_SOA_RETRY: u32 = 7200;
pub const DEFAULT_SOA_EXPIRE: u32 = 3600000;
pub const DEFAULT_SOA_MINIMUM: u32 = 172800;
pub const DEFAULT_MX_PREFERENCE: u16 = 10;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DomainName {
    pub name: String,
}

impl DomainName {
    /// Push the DomainName through the name_as_bytes function
    pub fn as_bytes(
        &self,
        compress_target: Option<u16>,
        compress_reference: Option<&[u8]>,
    ) -> Vec<u8> {
        name_as_bytes(self.name.as_bytes(), compress_target, compress_reference)
    }
}

impl From<&str> for DomainName {
    /// `admin@example.com` is encoded on the wire as `admin.example.com`,
    /// which is how SOA RNAME fields carry the zone contact.
    fn from(input: &str) -> Self {
        let name = match input.contains('@') {
            false => String::from(input),
            true => input.replace('@', "."),
        };
        DomainName { name }
    }
}

impl From<String> for DomainName {
    fn from(name: String) -> Self {
        DomainName::from(name.as_str())
    }
}

/// <character-string> is a single length octet followed by that number of
/// characters, so the data is capped at 255 octets.
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct CharacterString {
    pub data: Vec<u8>,
}

impl TryFrom<&str> for CharacterString {
    type Error = YakNsError;

    fn try_from(input: &str) -> Result<Self, Self::Error> {
        if input.len() > 255 {
            return Err(YakNsError::InvalidValue(format!(
                "character-string must be at most 255 octets, got {}",
                input.len()
            )));
        }
        Ok(CharacterString { data: input.into() })
    }
}

impl CharacterString {
    /// Returns the bytes for a packet, ie - the length and then the string
    fn as_bytes(&self) -> Vec<u8> {
        let mut res: Vec<u8> = vec![self.data.len() as u8];
        res.extend(&self.data);
        res
    }
}

/// The answer, authority, and additional sections all share the same
/// format: a variable number of resource records, where the number of
/// records is specified in the corresponding count field in the header.
///
/// Ref [RFC1035 Section 4.1.3](https://www.rfc-editor.org/rfc/rfc1035.html#section-4.1.3)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceRecord {
    /// A domain name to which this resource record pertains, in presentation form.
    pub name: Vec<u8>,
    /// Two octets containing one of the RR type codes.
    pub record_type: RecordType,
    /// Two octets which specify the class of the data in the RDATA field.
    pub class: RecordClass,
    /// A 32 bit unsigned integer that specifies the time interval (in seconds) that the resource record may be cached before it should be discarded.
    pub ttl: u32,
    /// A variable length string of octets that describes the resource.
    pub rdata: Vec<u8>,
}

impl ResourceRecord {
    pub fn as_bytes(
        &self,
        compress_target: Option<u16>,
        compress_reference: Option<&[u8]>,
    ) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];

        let record_name_bytes = name_as_bytes(&self.name, compress_target, compress_reference);
        retval.extend(record_name_bytes);
        // type
        retval.extend((self.record_type as u16).to_be_bytes());
        // class
        retval.extend((self.class as u16).to_be_bytes());
        // reply ttl
        retval.extend(self.ttl.to_be_bytes());
        // reply data length
        retval.extend((self.rdata.len() as u16).to_be_bytes());
        // rdata
        retval.extend(&self.rdata);

        retval
    }
}

/// A typed resource record as built by rule handlers. Construction validates
/// addresses, domains and tags so that nothing malformed ever reaches a
/// middleware stack or the wire.
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Record {
    /// A single host address
    A {
        name: String,
        address: Ipv4Addr,
        ttl: u32,
    },
    /// IPv6 host address, ref [RFC3596](https://www.rfc-editor.org/rfc/rfc3596#section-2.1)
    AAAA {
        name: String,
        address: Ipv6Addr,
        ttl: u32,
    },
    /// Mail exchange. Note: the exchange must not point at a CNAME record.
    MX {
        name: String,
        preference: u16,
        exchange: DomainName,
        ttl: u32,
    },
    /// Text strings. Values over 255 octets are split into multiple
    /// character-strings within the one record.
    TXT {
        name: String,
        txtdata: String,
        ttl: u32,
    },
    /// The canonical name for an alias
    CNAME {
        name: String,
        cname: DomainName,
        ttl: u32,
    },
    /// An authoritative name server
    NS {
        name: String,
        nsdname: DomainName,
        ttl: u32,
    },
    /// A domain name pointer
    PTR {
        name: String,
        ptrdname: DomainName,
        ttl: u32,
    },
    /// Marks the start of a zone of authority. The `rname` is the
    /// domain-encoded mailbox of the zone contact.
    SOA {
        zone: String,
        mname: DomainName,
        rname: DomainName,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
        ttl: u32,
    },
    /// Service location, ref [RFC2782](https://www.rfc-editor.org/rfc/rfc2782)
    SRV {
        name: String,
        priority: u16,
        weight: u16,
        port: u16,
        target: DomainName,
        ttl: u32,
    },
    // [RFC8659](https://www.rfc-editor.org/rfc/rfc8659) - CAA Record
    CAA {
        name: String,
        flag: u8,
        /// One of `issue`, `issuewild` or `iodef`.
        tag: CharacterString,
        value: Vec<u8>,
        ttl: u32,
    },
}

/// Owner-name validation shared by every constructor.
fn validate_resource_name(name: &str) -> Result<(), YakNsError> {
    if check_long_labels(name) {
        return Err(YakNsError::InvalidValue(format!(
            "at least one label is of length over 63 in name {name}"
        )));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(YakNsError::InvalidValue(format!(
            "the length of name {name} is over {MAX_NAME_LENGTH} octets ({})",
            name.len()
        )));
    }
    Ok(())
}

fn validate_target_domain(domain: &str) -> Result<(), YakNsError> {
    if !DOMAIN_VALIDATOR.is_match(domain) {
        return Err(YakNsError::InvalidValue(format!(
            "{domain:?} is not a valid domain"
        )));
    }
    Ok(())
}

impl Record {
    pub fn a(name: &str, ip: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        let address = Ipv4Addr::from_str(ip).map_err(|error| {
            YakNsError::InvalidValue(format!(
                "failed to parse {ip:?} into an IPv4 address: {error:?}"
            ))
        })?;
        Ok(Record::A {
            name: name.to_string(),
            address,
            ttl: DEFAULT_TTL,
        })
    }

    /// IPv4 addresses also come in 32-bit form.
    pub fn a_from_bits(name: &str, bits: u32) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        Ok(Record::A {
            name: name.to_string(),
            address: Ipv4Addr::from(bits),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn aaaa(name: &str, ip: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        let address = Ipv6Addr::from_str(ip).map_err(|error| {
            YakNsError::InvalidValue(format!(
                "failed to parse {ip:?} into an IPv6 address: {error:?}"
            ))
        })?;
        Ok(Record::AAAA {
            name: name.to_string(),
            address,
            ttl: DEFAULT_TTL,
        })
    }

    pub fn mx(name: &str, exchange: &str) -> Result<Record, YakNsError> {
        Self::mx_with_preference(name, exchange, DEFAULT_MX_PREFERENCE)
    }

    pub fn mx_with_preference(
        name: &str,
        exchange: &str,
        preference: u16,
    ) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        Ok(Record::MX {
            name: name.to_string(),
            preference,
            exchange: DomainName::from(exchange),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn txt(name: &str, text: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        // every 255-octet chunk picks up a length octet, and the whole lot
        // still has to fit in a 16-bit RDLENGTH
        let chunks = text.len().div_ceil(255).max(1);
        if text.len() + chunks > u16::MAX as usize {
            return Err(YakNsError::InvalidValue(format!(
                "TXT value of {} octets cannot fit in a single record",
                text.len()
            )));
        }
        Ok(Record::TXT {
            name: name.to_string(),
            txtdata: text.to_string(),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn cname(name: &str, domain: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        validate_target_domain(domain)?;
        Ok(Record::CNAME {
            name: name.to_string(),
            cname: DomainName::from(domain),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn ns(name: &str, domain: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        validate_target_domain(domain)?;
        Ok(Record::NS {
            name: name.to_string(),
            nsdname: DomainName::from(domain),
            ttl: DEFAULT_NS_TTL,
        })
    }

    pub fn ptr(name: &str, domain: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        validate_target_domain(domain)?;
        Ok(Record::PTR {
            name: name.to_string(),
            ptrdname: DomainName::from(domain),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn soa(
        zone: &str,
        primary_name_server: &str,
        admin_email: &str,
        serial: u32,
    ) -> Result<Record, YakNsError> {
        validate_resource_name(zone)?;
        Ok(Record::SOA {
            zone: zone.to_string(),
            mname: DomainName::from(primary_name_server),
            rname: DomainName::from(admin_email),
            serial,
            refresh: DEFAULT_SOA_REFRESH,
            retry: DEFAULT_SOA_RETRY,
            expire: DEFAULT_SOA_EXPIRE,
            minimum: DEFAULT_SOA_MINIMUM,
            ttl: DEFAULT_SOA_TTL,
        })
    }

    pub fn srv(
        name: &str,
        target: &str,
        port: u16,
        priority: u16,
        weight: u16,
    ) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        Ok(Record::SRV {
            name: name.to_string(),
            priority,
            weight,
            port,
            target: DomainName::from(target),
            ttl: DEFAULT_TTL,
        })
    }

    pub fn caa(name: &str, flag: u8, tag: &str, value: &str) -> Result<Record, YakNsError> {
        validate_resource_name(name)?;
        if !CAA_VALID_TAGS.contains(&tag) {
            return Err(YakNsError::InvalidValue(format!(
                "invalid tag {tag} must be one of {CAA_VALID_TAGS:?}"
            )));
        }
        Ok(Record::CAA {
            name: name.to_string(),
            flag,
            tag: CharacterString::try_from(tag)?,
            value: value.as_bytes().to_vec(),
            ttl: DEFAULT_CAA_TTL,
        })
    }

    /// Override the default time-to-live.
    pub fn with_ttl(mut self, new_ttl: u32) -> Record {
        match &mut self {
            Record::A { ttl, .. }
            | Record::AAAA { ttl, .. }
            | Record::MX { ttl, .. }
            | Record::TXT { ttl, .. }
            | Record::CNAME { ttl, .. }
            | Record::NS { ttl, .. }
            | Record::PTR { ttl, .. }
            | Record::SOA { ttl, .. }
            | Record::SRV { ttl, .. }
            | Record::CAA { ttl, .. } => *ttl = new_ttl,
        }
        self
    }

    /// The owner name of the record.
    pub fn name(&self) -> &str {
        match self {
            Record::A { name, .. }
            | Record::AAAA { name, .. }
            | Record::MX { name, .. }
            | Record::TXT { name, .. }
            | Record::CNAME { name, .. }
            | Record::NS { name, .. }
            | Record::PTR { name, .. }
            | Record::SRV { name, .. }
            | Record::CAA { name, .. } => name,
            Record::SOA { zone, .. } => zone,
        }
    }

    pub fn ttl(&self) -> u32 {
        match self {
            Record::A { ttl, .. }
            | Record::AAAA { ttl, .. }
            | Record::MX { ttl, .. }
            | Record::TXT { ttl, .. }
            | Record::CNAME { ttl, .. }
            | Record::NS { ttl, .. }
            | Record::PTR { ttl, .. }
            | Record::SOA { ttl, .. }
            | Record::SRV { ttl, .. }
            | Record::CAA { ttl, .. } => *ttl,
        }
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            Record::A { .. } => RecordType::A,
            Record::AAAA { .. } => RecordType::AAAA,
            Record::MX { .. } => RecordType::MX,
            Record::TXT { .. } => RecordType::TXT,
            Record::CNAME { .. } => RecordType::CNAME,
            Record::NS { .. } => RecordType::NS,
            Record::PTR { .. } => RecordType::PTR,
            Record::SOA { .. } => RecordType::SOA,
            Record::SRV { .. } => RecordType::SRV,
            Record::CAA { .. } => RecordType::CAA,
        }
    }

    /// The RDATA field for this record. Names inside RDATA are written
    /// uncompressed.
    pub fn rdata_as_bytes(&self) -> Vec<u8> {
        match self {
            Record::A { address, .. } => address.octets().to_vec(),
            Record::AAAA { address, .. } => address.octets().to_vec(),
            Record::TXT { txtdata, .. } => {
                let mut result: Vec<u8> = vec![];
                if txtdata.is_empty() {
                    result.push(0);
                } else {
                    for chunk in txtdata.as_bytes().chunks(255) {
                        result.push(chunk.len() as u8);
                        result.extend(chunk);
                    }
                }
                result
            }
            Record::CNAME { cname, .. } => cname.as_bytes(None, None),
            Record::NS { nsdname, .. } => nsdname.as_bytes(None, None),
            Record::PTR { ptrdname, .. } => ptrdname.as_bytes(None, None),
            Record::MX {
                preference,
                exchange,
                ..
            } => {
                let mut mx_bytes: Vec<u8> = preference.to_be_bytes().into();
                mx_bytes.extend(exchange.as_bytes(None, None));
                mx_bytes
            }
            Record::SOA {
                mname,
                rname,
                serial,
                refresh,
                retry,
                expire,
                minimum,
                ..
            } => {
                let mut res: Vec<u8> = mname.as_bytes(None, None);
                res.extend(rname.as_bytes(None, None));
                res.extend(serial.to_be_bytes());
                res.extend(refresh.to_be_bytes());
                res.extend(retry.to_be_bytes());
                res.extend(expire.to_be_bytes());
                res.extend(minimum.to_be_bytes());
                res
            }
            Record::SRV {
                priority,
                weight,
                port,
                target,
                ..
            } => {
                let mut res: Vec<u8> = priority.to_be_bytes().into();
                res.extend(weight.to_be_bytes());
                res.extend(port.to_be_bytes());
                res.extend(target.as_bytes(None, None));
                res
            }
            Record::CAA {
                flag, tag, value, ..
            } => {
                let mut result: Vec<u8> = vec![*flag];
                // add the tag
                result.extend(tag.as_bytes());
                // the value runs to the end of RDATA, no length octet
                result.extend(value);
                result
            }
        }
    }

    /// Convert to a wire-format record ready for a reply section.
    pub fn to_wire(&self) -> ResourceRecord {
        ResourceRecord {
            name: self.name().as_bytes().to_vec(),
            record_type: self.record_type(),
            class: RecordClass::Internet,
            ttl: self.ttl(),
            rdata: self.rdata_as_bytes(),
        }
    }
}

impl PartialEq<RecordType> for Record {
    fn eq(&self, other: &RecordType) -> bool {
        self.record_type() == *other
    }
}
