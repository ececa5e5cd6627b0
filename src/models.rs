use crate::enums::{Rcode, RecordType};
use crate::error::YakNsError;
use crate::resourcerecord::{Record, ResourceRecord};
use crate::Question;
use std::fmt::Display;

/// Simplified version of a DNS query: the question type plus the question
/// name with any trailing dot stripped (the root is the empty string).
/// Immutable once built - rule handlers only ever read it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub qtype: RecordType,
    pub name: String,
}

impl Query {
    pub fn new(qtype: RecordType, name: impl Into<String>) -> Result<Self, YakNsError> {
        if !qtype.supported() {
            return Err(YakNsError::InvalidValue(format!(
                "unsupported QTYPE {qtype:?}"
            )));
        }
        Ok(Query {
            qtype,
            name: name.into(),
        })
    }
}

impl TryFrom<&Question> for Query {
    type Error = YakNsError;

    fn try_from(question: &Question) -> Result<Self, Self::Error> {
        Query::new(
            question.qtype,
            question.qname.trim_end_matches('.').to_string(),
        )
    }
}

impl Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("Query({}, {:?})", self.qtype, self.name))
    }
}

/// Simplified version of a DNS response as built by rule handlers. The
/// middleware stack turns this into a wire-level [Reply](crate::reply::Reply).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Response {
    pub answers: Vec<Record>,
    pub additional: Vec<Record>,
    pub authority: Vec<Record>,
    pub error_code: Rcode,
}

impl Response {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_error_code(error_code: Rcode) -> Self {
        Response {
            error_code,
            ..Default::default()
        }
    }

    /// Wire-format records for the answer section.
    pub fn answer_records(&self) -> Vec<ResourceRecord> {
        self.answers.iter().map(Record::to_wire).collect()
    }

    /// Wire-format records for the additional section.
    pub fn additional_records(&self) -> Vec<ResourceRecord> {
        self.additional.iter().map(Record::to_wire).collect()
    }

    /// Wire-format records for the authority section.
    pub fn authority_records(&self) -> Vec<ResourceRecord> {
        self.authority.iter().map(Record::to_wire).collect()
    }
}

impl From<Record> for Response {
    fn from(record: Record) -> Self {
        Response {
            answers: vec![record],
            ..Default::default()
        }
    }
}

impl From<Vec<Record>> for Response {
    fn from(records: Vec<Record>) -> Self {
        Response {
            answers: records,
            ..Default::default()
        }
    }
}

/// What a rule handler or `before_query` hook may produce. Everything here
/// coerces to a [Response] on its way out of the stack.
#[derive(Clone, Debug)]
pub enum RuleResult {
    /// No answer records and NOERROR - useful to suppress the NXDOMAIN a
    /// missed dispatch would otherwise produce.
    None,
    Record(Record),
    Records(Vec<Record>),
    Response(Response),
}

impl RuleResult {
    pub fn is_none(&self) -> bool {
        matches!(self, RuleResult::None)
    }
}

impl From<Record> for RuleResult {
    fn from(record: Record) -> Self {
        RuleResult::Record(record)
    }
}

impl From<Vec<Record>> for RuleResult {
    fn from(records: Vec<Record>) -> Self {
        RuleResult::Records(records)
    }
}

impl From<Response> for RuleResult {
    fn from(response: Response) -> Self {
        RuleResult::Response(response)
    }
}

impl From<Option<Record>> for RuleResult {
    fn from(record: Option<Record>) -> Self {
        match record {
            Some(record) => RuleResult::Record(record),
            None => RuleResult::None,
        }
    }
}
