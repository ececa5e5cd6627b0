use crate::error::YakNsError;
use crate::resourcerecord::ResourceRecord;
use crate::{Header, Question, HEADER_BYTES, UDP_BUFFER_SIZE};
use packed_struct::prelude::*;

/// A wire-level DNS response: the header, the echoed question and the three
/// record sections. This is what the raw middleware layer produces and what
/// transports serialize.
#[derive(Clone, Debug)]
pub struct Reply {
    pub header: Header,
    pub question: Option<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authorities: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl Reply {
    /// Serialize to wire bytes. Section counts come from the section lengths,
    /// not whatever the header happened to hold.
    pub fn as_bytes(&self) -> Result<Vec<u8>, YakNsError> {
        let mut retval: Vec<u8> = vec![];

        let mut header = self.header.clone();
        header.ancount = self.answers.len() as u16;
        header.nscount = self.authorities.len() as u16;
        header.arcount = self.additional.len() as u16;

        retval.extend(header.pack()?);

        let mut question_bytes: Option<Vec<u8>> = None;
        if let Some(question) = &self.question {
            retval.extend(question.to_bytes());
            question_bytes = Some(question.qname.as_bytes().to_vec());
        }

        // Owner names that repeat the question name become a pointer back at
        // the question, everything else is written in full.
        for record in self
            .answers
            .iter()
            .chain(self.authorities.iter())
            .chain(self.additional.iter())
        {
            if record.rdata.len() > u16::MAX as usize {
                return Err(YakNsError::InvalidValue(format!(
                    "rdata of {} octets is too long for a resource record",
                    record.rdata.len()
                )));
            }
            retval.extend(
                record.as_bytes(Some(HEADER_BYTES as u16), question_bytes.as_deref()),
            );
        }

        Ok(retval)
    }

    /// Serialize for a UDP datagram: replies that do not fit in
    /// [UDP_BUFFER_SIZE] are cut back to the bare header and question with
    /// the truncated flag set, inviting the client to retry over TCP.
    pub fn as_bytes_udp(&self) -> Result<Vec<u8>, YakNsError> {
        let full = self.as_bytes()?;
        if full.len() <= UDP_BUFFER_SIZE {
            return Ok(full);
        }

        let truncated = Reply {
            header: self.clone().set_truncated().header,
            question: self.question.clone(),
            answers: vec![],
            authorities: vec![],
            additional: vec![],
        };
        truncated.as_bytes()
    }

    /// Set the truncated flag.
    pub fn set_truncated(self) -> Self {
        let mut header = self.header;
        header.truncated = true;
        Self { header, ..self }
    }
}
