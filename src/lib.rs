use crate::enums::*;
use crate::error::YakNsError;
use crate::utils::{name_as_bytes, parse_name};
use packed_struct::prelude::*;
use std::fmt::Display;

/// The application run loop
pub mod application;
/// Code related to CLI things
pub mod cli;
/// Configuration handling for the server
pub mod config;
pub mod enums;
pub mod error;
pub mod logging;
/// The two-layer middleware pipeline
pub mod middleware;
/// Query and Response model used by rule handlers
pub mod models;
pub mod reply;
pub mod resourcerecord;
/// The rule match engine
pub mod rules;
pub mod server;
pub mod transport;
pub mod utils;
#[cfg(test)]
mod tests;

/// The size of a DNS message header
pub const HEADER_BYTES: usize = 12;
/// The classic DNS datagram limit, ref [RFC1035 2.3.4](https://www.rfc-editor.org/rfc/rfc1035#section-2.3.4).
/// EDNS0 is not negotiated, so larger UDP replies get the truncated flag instead.
pub const UDP_BUFFER_SIZE: usize = 512;

/// The header of a DNS transmission, either a Query or Reply. Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.1) section 4.1.1.
#[derive(Debug, PackedStruct, PartialEq, Clone)]
#[packed_struct(bit_numbering = "msb0", size_bytes = "12")]
pub struct Header {
    /// The query ID
    #[packed_field(bits = "0..=15", endian = "msb")]
    pub id: u16,
    // Is it a query or response
    #[packed_field(bits = "16", ty = "enum")]
    pub qr: PacketType, // bit 16
    // Kept as a raw four-bit field so that unknown opcodes survive parsing
    // and can be answered with NOTIMP rather than being dropped.
    #[packed_field(bits = "17..=20")]
    opcode: Integer<u8, packed_bits::Bits<4>>, // 17-20 actually 4 bits
    #[packed_field(bits = "21")]
    pub authoritative: bool, // 21
    #[packed_field(bits = "22")]
    pub truncated: bool, // 22
    // RD - Recursion Desired - this bit may be set in a query and is copied into the response.
    #[packed_field(bits = "23")]
    pub recursion_desired: bool, // 23
    #[packed_field(bits = "24")]
    pub recursion_available: bool, // 24
    /// reserved, must be all 0's
    #[packed_field(bits = "25")]
    pub z: bool, // 25-27 -
    #[packed_field(bits = "26")]
    pub ad: bool,
    #[packed_field(bits = "27")]
    pub cd: bool,
    #[packed_field(bits = "28..=31")]
    rcode: Integer<u8, packed_bits::Bits<4>>, // bits 28-31
    /// an unsigned 16 bit integer specifying the number of entries in the question section.
    #[packed_field(bits = "32..=47", endian = "msb")]
    pub qdcount: u16, // bits 32-47
    /// an unsigned 16 bit integer specifying the number of entries in the answer section.
    #[packed_field(bits = "48..=63", endian = "msb")]
    pub ancount: u16, // 48-63
    /// an unsigned 16 bit integer specifying the number of name server resource records in the authority records section.
    #[packed_field(bits = "64..=79", endian = "msb")]
    pub nscount: u16, // 64-79
    /// an unsigned 16 bit integer specifying the number of resource records in the additional records section.
    #[packed_field(bits = "80..=95", endian = "msb")]
    pub arcount: u16, // 80-95
}

impl Default for Header {
    fn default() -> Self {
        Header {
            id: 0,
            qr: PacketType::Query,
            opcode: (OpCode::Query as u8).into(),
            // we *are* an authoritative DNS server after all
            authoritative: true,
            truncated: false,
            recursion_desired: false,
            recursion_available: false,
            z: false,
            ad: false,
            cd: false,
            rcode: (Rcode::NoError as u8).into(),
            qdcount: 0,
            ancount: 0,
            nscount: 0,
            arcount: 0,
        }
    }
}

impl Header {
    pub fn opcode(&self) -> OpCode {
        (*self.opcode).into()
    }

    pub fn set_opcode(&mut self, opcode: OpCode) {
        self.opcode = (opcode as u8).into();
    }

    pub fn rcode(&self) -> Rcode {
        (*self.rcode).into()
    }

    pub fn set_rcode(&mut self, rcode: Rcode) {
        self.rcode = (rcode as u8).into();
    }

    /// A query header for the given id with one question, mostly useful when
    /// hand-building requests.
    pub fn query(id: u16) -> Header {
        Header {
            id,
            authoritative: false,
            qdcount: 1,
            ..Default::default()
        }
    }

    pub fn as_answer(self) -> Header {
        let mut response = self;
        response.qr = PacketType::Answer;
        response
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A DNS Question section, from Ref [RFC1035](https://www.rfc-editor.org/rfc/rfc1035#section-4.1.2) section 4.1.2 "Question section format".
pub struct Question {
    /// The name which is being queried, in presentation form with no trailing dot.
    pub qname: String,
    /// The Record type that is being requested, eg A, NS, MX, TXT etc.
    pub qtype: RecordType,
    /// The class, (typically IN for "Internet")
    pub qclass: RecordClass,
    // Unknown qtypes still get echoed back verbatim in FORMERR replies.
    raw_qtype: u16,
}

impl Display for Question {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!(
            "QNAME={} QTYPE={:?} QCLASS={}",
            self.qname, self.qtype, self.qclass,
        ))
    }
}

impl Question {
    pub fn new(qname: impl Into<String>, qtype: RecordType, qclass: RecordClass) -> Self {
        Question {
            qname: qname.into(),
            qtype,
            qclass,
            raw_qtype: qtype as u16,
        }
    }

    /// hand it the post-header buffer, and get back a [Question]
    pub fn from_wire(buf: &[u8]) -> Result<Self, YakNsError> {
        let (qname, read_pointer) = parse_name(buf)?;

        if buf.len() < read_pointer + 4 {
            return Err(YakNsError::InvalidValue(format!(
                "question not long enough, looked for {}, got {}",
                read_pointer + 4,
                buf.len()
            )));
        }
        let mut qtype_bytes: [u8; 2] = [0; 2];
        qtype_bytes.copy_from_slice(&buf[read_pointer..read_pointer + 2]);
        let raw_qtype = u16::from_be_bytes(qtype_bytes);
        let mut qclass_bytes: [u8; 2] = [0; 2];
        qclass_bytes.copy_from_slice(&buf[read_pointer + 2..read_pointer + 4]);
        let qclass: RecordClass = RecordClass::from(&u16::from_be_bytes(qclass_bytes));

        Ok(Question {
            qname,
            qtype: RecordType::from(&raw_qtype),
            qclass,
            raw_qtype,
        })
    }

    /// turn a question into a vec of bytes to send back to the user
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut retval: Vec<u8> = vec![];

        let name_bytes = name_as_bytes(self.qname.as_bytes(), None, None);
        retval.extend(name_bytes);
        retval.extend(self.raw_qtype.to_be_bytes());
        retval.extend((self.qclass as u16).to_be_bytes());
        retval
    }
}

/// A parsed incoming DNS message: the header plus the first question, if one
/// was present. This is what raw middleware operates on.
#[derive(Clone, Debug)]
pub struct Message {
    pub header: Header,
    pub question: Option<Question>,
}

impl Message {
    /// Parse raw wire bytes. Failures here mean the peer sent something that
    /// is not DNS - the transport wraps them in
    /// [YakNsError::InvalidMessage](crate::error::YakNsError::InvalidMessage).
    pub fn parse(buf: &[u8]) -> Result<Self, YakNsError> {
        if buf.len() < HEADER_BYTES {
            return Err(YakNsError::InvalidValue(format!(
                "message too short to hold a header: {} bytes",
                buf.len()
            )));
        }
        let mut split_header: [u8; HEADER_BYTES] = [0; HEADER_BYTES];
        split_header.copy_from_slice(&buf[0..HEADER_BYTES]);
        let header = Header::unpack(&split_header)?;

        // Only the first question is decoded - requests with any other
        // question count are answered REFUSED further up the stack.
        let question = match header.qdcount {
            0 => None,
            _ => Some(Question::from_wire(&buf[HEADER_BYTES..])?),
        };

        Ok(Message { header, question })
    }

    /// An empty reply to this message: same id and opcode, answer flag set,
    /// question echoed.
    pub fn reply(&self) -> crate::reply::Reply {
        let header = Header {
            id: self.header.id,
            // the opcode is echoed back raw, even ones we refuse to serve
            opcode: self.header.opcode,
            recursion_desired: self.header.recursion_desired,
            qdcount: match self.question {
                Some(_) => 1,
                None => 0,
            },
            ..Default::default()
        }
        .as_answer();

        crate::reply::Reply {
            header,
            question: self.question.clone(),
            answers: vec![],
            authorities: vec![],
            additional: vec![],
        }
    }

    /// Build a one-question query message, mostly useful in tests and clients.
    pub fn question(id: u16, qname: &str, qtype: RecordType) -> Message {
        Message {
            header: Header::query(id),
            question: Some(Question::new(qname, qtype, RecordClass::Internet)),
        }
    }

    /// Serialize to wire bytes.
    pub fn as_bytes(&self) -> Result<Vec<u8>, YakNsError> {
        let mut retval: Vec<u8> = vec![];
        retval.extend(self.header.pack()?);
        if let Some(question) = &self.question {
            retval.extend(question.to_bytes());
        }
        Ok(retval)
    }
}
