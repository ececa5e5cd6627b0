use crate::enums::RecordType;
use crate::error::{HandlerError, YakNsError};
use crate::models::{Query, RuleResult};
use crate::server::Blueprint;

use log::warn;
use regex::{Regex, RegexBuilder};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::{Arc, LazyLock};

/// All query types the framework can dispatch on.
pub static ALL_QTYPES: LazyLock<Vec<RecordType>> = LazyLock::new(|| {
    enum_iterator::all::<RecordType>()
        .filter(|qtype| qtype.supported())
        .collect()
});

static WILDCARD_STRING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[*]|\{base_domain\}").expect("wildcard detection regex failed to compile")
});

/// The function invoked when a rule matches a query. Handlers are opaque
/// values: anything callable with a query that produces a [RuleResult].
pub type ResponseFunction =
    Arc<dyn Fn(&Query) -> Result<RuleResult, HandlerError> + Send + Sync + 'static>;

/// Which query types a rule will consider.
#[derive(Clone, Debug)]
pub enum QtypeFilter {
    /// Match any query type.
    Any,
    Only(HashSet<RecordType>),
}

impl QtypeFilter {
    pub fn allows(&self, qtype: RecordType) -> bool {
        match self {
            QtypeFilter::Any => true,
            QtypeFilter::Only(set) => set.contains(&qtype),
        }
    }
}

impl From<&[RecordType]> for QtypeFilter {
    fn from(qtypes: &[RecordType]) -> Self {
        QtypeFilter::Only(qtypes.iter().copied().collect())
    }
}

impl<const N: usize> From<[RecordType; N]> for QtypeFilter {
    fn from(qtypes: [RecordType; N]) -> Self {
        QtypeFilter::Only(qtypes.into_iter().collect())
    }
}

impl From<Vec<RecordType>> for QtypeFilter {
    fn from(qtypes: Vec<RecordType>) -> Self {
        QtypeFilter::Only(qtypes.into_iter().collect())
    }
}

impl From<&Vec<RecordType>> for QtypeFilter {
    fn from(qtypes: &Vec<RecordType>) -> Self {
        QtypeFilter::Only(qtypes.iter().copied().collect())
    }
}

/// Shorthand input for [smart_make_rule]: a name-ish string or a compiled
/// pattern.
pub enum RuleSpec {
    Name(String),
    Pattern(Regex),
}

impl From<&str> for RuleSpec {
    fn from(input: &str) -> Self {
        RuleSpec::Name(input.to_string())
    }
}

impl From<String> for RuleSpec {
    fn from(input: String) -> Self {
        RuleSpec::Name(input)
    }
}

impl From<Regex> for RuleSpec {
    fn from(input: Regex) -> Self {
        RuleSpec::Pattern(input)
    }
}

/// Create a rule using shorthand notation.
///
/// A string containing `*` or `{base_domain}` becomes a wildcard rule, any
/// other string a static rule, and a compiled pattern a regex rule. The
/// first substring hit decides.
pub fn smart_make_rule(
    spec: impl Into<RuleSpec>,
    allowed_qtypes: impl Into<QtypeFilter>,
    func: ResponseFunction,
    case_sensitive: bool,
) -> Result<Rule, YakNsError> {
    match spec.into() {
        RuleSpec::Name(name) => {
            if WILDCARD_STRING_REGEX.is_match(&name) {
                Rule::wildcard(&name, allowed_qtypes, func, case_sensitive)
            } else {
                Rule::static_rule(&name, allowed_qtypes, func, case_sensitive)
            }
        }
        RuleSpec::Pattern(regex) => Rule::regex(regex, allowed_qtypes, func, case_sensitive),
    }
}

/// How a rule decides whether a query name is one of its own.
#[derive(Clone, Debug)]
pub enum RuleMatcher {
    /// Exact string equality. O(1) and the cheapest option for fixed names.
    Static(String),
    /// The zone itself or any name beneath it. The empty zone is the DNS
    /// root and matches every name.
    Zone(String),
    /// A compiled pattern applied with full-match semantics.
    Regex(Regex),
    /// A wildcard string: literal labels, `*` (one label), `**` (one or more
    /// labels), and `{base_domain}` (the registrable domain of the query
    /// name per the Public Suffix List).
    Wildcard(String),
}

impl RuleMatcher {
    pub fn zone(zone: &str) -> RuleMatcher {
        RuleMatcher::Zone(zone.to_string())
    }

    pub fn static_match(name: &str) -> RuleMatcher {
        RuleMatcher::Static(name.to_string())
    }

    pub fn wildcard(pattern: &str) -> RuleMatcher {
        RuleMatcher::Wildcard(pattern.to_string())
    }
}

/// What a matched rule does: run a handler, or consult a nested rule
/// container.
#[derive(Clone)]
pub(crate) enum RuleAction {
    Function(ResponseFunction),
    Blueprint(Arc<Blueprint>),
}

/// A registered rule: a name matcher, a query-type filter, and the action to
/// take on a hit. Immutable once registered.
#[derive(Clone)]
pub struct Rule {
    matcher: RuleMatcher,
    allowed_qtypes: QtypeFilter,
    case_sensitive: bool,
    action: RuleAction,
}

impl Rule {
    /// Rule that matches only the given string.
    ///
    /// More efficient than a wildcard rule for fixed names.
    pub fn static_rule(
        match_string: &str,
        allowed_qtypes: impl Into<QtypeFilter>,
        func: ResponseFunction,
        case_sensitive: bool,
    ) -> Result<Rule, YakNsError> {
        Rule::with_action(
            RuleMatcher::Static(match_string.to_string()),
            allowed_qtypes.into(),
            case_sensitive,
            RuleAction::Function(func),
        )
    }

    /// Rule that matches the given domain or any subdomain.
    ///
    /// An empty zone (`""`) will match any domain as this refers to the
    /// domain root (`.`).
    pub fn zone(
        zone: &str,
        allowed_qtypes: impl Into<QtypeFilter>,
        func: ResponseFunction,
        case_sensitive: bool,
    ) -> Result<Rule, YakNsError> {
        Rule::with_action(
            RuleMatcher::Zone(zone.to_string()),
            allowed_qtypes.into(),
            case_sensitive,
            RuleAction::Function(func),
        )
    }

    /// Rule that uses the provided regex to attempt to match the query name.
    ///
    /// When `case_sensitive` is false the pattern is recompiled
    /// case-insensitively; the query name is left untouched.
    pub fn regex(
        regex: Regex,
        allowed_qtypes: impl Into<QtypeFilter>,
        func: ResponseFunction,
        case_sensitive: bool,
    ) -> Result<Rule, YakNsError> {
        Rule::with_action(
            RuleMatcher::Regex(regex),
            allowed_qtypes.into(),
            case_sensitive,
            RuleAction::Function(func),
        )
    }

    /// Rule that allows a more concise way of matching query names.
    ///
    /// The following substitutions can be made:
    ///
    /// - `*` will match a single domain label
    /// - `**` will match one or more domain labels
    /// - `{base_domain}` will match the registered domain using the Public
    ///   Suffix List
    ///
    /// Examples: `_dmarc.{base_domain}`, `*._dkim.**`, `foo.*.bar.com`
    pub fn wildcard(
        wildcard_string: &str,
        allowed_qtypes: impl Into<QtypeFilter>,
        func: ResponseFunction,
        case_sensitive: bool,
    ) -> Result<Rule, YakNsError> {
        Rule::with_action(
            RuleMatcher::Wildcard(wildcard_string.to_string()),
            allowed_qtypes.into(),
            case_sensitive,
            RuleAction::Function(func),
        )
    }

    pub(crate) fn with_action(
        matcher: RuleMatcher,
        allowed_qtypes: QtypeFilter,
        case_sensitive: bool,
        action: RuleAction,
    ) -> Result<Rule, YakNsError> {
        let matcher = match matcher {
            RuleMatcher::Static(name) => RuleMatcher::Static(match case_sensitive {
                true => name,
                false => name.to_lowercase(),
            }),
            RuleMatcher::Zone(zone) => {
                let zone = zone.trim_matches('.').to_string();
                RuleMatcher::Zone(match case_sensitive {
                    true => zone,
                    false => zone.to_lowercase(),
                })
            }
            RuleMatcher::Regex(regex) => {
                // anchor so the whole name has to match, not a substring
                let anchored = RegexBuilder::new(&format!("^(?:{})$", regex.as_str()))
                    .case_insensitive(!case_sensitive)
                    .build()?;
                RuleMatcher::Regex(anchored)
            }
            RuleMatcher::Wildcard(pattern) => RuleMatcher::Wildcard(match case_sensitive {
                true => pattern,
                false => pattern.to_lowercase(),
            }),
        };

        Ok(Rule {
            matcher,
            allowed_qtypes,
            case_sensitive,
            action,
        })
    }

    /// From the given query return the function to run, if any.
    ///
    /// `None` means the rule does not apply and dispatch moves to the next
    /// rule in registration order.
    pub fn get_func(&self, query: &Query) -> Option<ResponseFunction> {
        if !self.allowed_qtypes.allows(query.qtype) {
            return None;
        }
        if !self.matches_name(&query.name) {
            return None;
        }
        match &self.action {
            RuleAction::Function(func) => Some(func.clone()),
            RuleAction::Blueprint(blueprint) => blueprint.lookup(query),
        }
    }

    fn matches_name(&self, name: &str) -> bool {
        match &self.matcher {
            RuleMatcher::Static(match_string) => match self.case_sensitive {
                true => name == match_string,
                false => name.to_lowercase() == *match_string,
            },
            RuleMatcher::Zone(zone) => {
                if zone.is_empty() {
                    return true;
                }
                let check_string = match self.case_sensitive {
                    true => name.to_string(),
                    false => name.to_lowercase(),
                };
                check_string == *zone || check_string.ends_with(&format!(".{zone}"))
            }
            RuleMatcher::Regex(regex) => regex.is_match(name),
            RuleMatcher::Wildcard(pattern) => {
                let check_string = match self.case_sensitive {
                    true => name.to_string(),
                    false => name.to_lowercase(),
                };
                match wildcard_regex(pattern, &check_string, self.case_sensitive) {
                    Ok(regex) => regex.is_match(&check_string),
                    Err(error) => {
                        warn!("failed to build matcher for wildcard {pattern:?}: {error}");
                        false
                    }
                }
            }
        }
    }
}

impl Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (kind, value) = match &self.matcher {
            RuleMatcher::Static(value) => ("StaticRule", value.clone()),
            RuleMatcher::Zone(value) => ("ZoneRule", value.clone()),
            RuleMatcher::Regex(value) => ("RegexRule", value.as_str().to_string()),
            RuleMatcher::Wildcard(value) => ("WildcardStringRule", value.clone()),
        };
        f.write_fmt(format_args!("{kind}({value:?}, {:?})", self.allowed_qtypes))
    }
}

/// The effective registrable domain of a query name: the Public Suffix List
/// registrable domain when the name ends in a known public suffix, otherwise
/// the final label (internal names have no registry).
pub fn base_domain(name: &str) -> &str {
    let lowered = name.to_ascii_lowercase();
    // the implicit `*` rule makes every name have a suffix, only listed
    // ones count here
    let known_suffix = psl::suffix(lowered.as_bytes())
        .map(|suffix| suffix.is_known())
        .unwrap_or(false);
    if !known_suffix {
        return name.rsplit('.').next().unwrap_or("");
    }
    match psl::domain(lowered.as_bytes()) {
        // psl hands back a trailing slice, map it onto the original-cased
        // input
        Some(domain) => &name[name.len() - domain.as_bytes().len()..],
        // the name is a bare public suffix
        None => "",
    }
}

/// Given a query name, produce the regex used for wildcard matching.
///
/// A separate function to make testing easier.
pub(crate) fn wildcard_regex(
    pattern: &str,
    query_name: &str,
    case_sensitive: bool,
) -> Result<Regex, YakNsError> {
    let substituted = match pattern.contains("{base_domain}") {
        true => pattern.replace("{base_domain}", base_domain(query_name)),
        false => pattern.to_string(),
    };

    let single_label = match case_sensitive {
        true => r"[a-zA-Z0-9\-_]+",
        false => r"[a-z0-9\-_]+",
    };
    let multi_label = match case_sensitive {
        true => r"(?:[a-zA-Z0-9\-_]+\.)*(?:[a-zA-Z0-9\-_]+)",
        false => r"(?:[a-z0-9\-_]+\.)*(?:[a-z0-9\-_]+)",
    };

    let regex_parts: Vec<String> = substituted
        .split('.')
        .map(|part| match part {
            "*" => single_label.to_string(),
            "**" => multi_label.to_string(),
            other => regex::escape(other),
        })
        .collect();

    Ok(Regex::new(&format!(
        "^(?:{})$",
        regex_parts.join(r"\.")
    ))?)
}
