//! Declarative network rule conversion
//!
//! Converts network filters into the platform's declarative rule format for
//! browsers where requests cannot be intercepted imperatively. Conversion is
//! best effort: filters that cannot be expressed are reported next to the
//! rules that did convert.

use serde::{Deserialize, Serialize};
use ts_rs::TS;

use crate::filter::{Filter, FilterError, NetworkFilter, NetworkOption};

// =============================================================================
// Request Types (bit mask for type filtering)
// =============================================================================

bitflags::bitflags! {
    /// Request type bit mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct RequestType: u32 {
        const OTHER = 1 << 0;
        const SCRIPT = 1 << 1;
        const IMAGE = 1 << 2;
        const STYLESHEET = 1 << 3;
        const OBJECT = 1 << 4;
        const SUB_FRAME = 1 << 5;
        const MAIN_FRAME = 1 << 6;
        const XMLHTTPREQUEST = 1 << 7;
        const WEBSOCKET = 1 << 8;
        const FONT = 1 << 9;
        const MEDIA = 1 << 10;
        const PING = 1 << 11;
        const CSP_REPORT = 1 << 12;

        /// All request types
        const ALL = (1 << 13) - 1;
    }
}

impl RequestType {
    /// Map a filter option name to its type bit.
    pub fn from_option(name: &str) -> Option<Self> {
        match name {
            "script" => Some(Self::SCRIPT),
            "image" => Some(Self::IMAGE),
            "stylesheet" | "css" => Some(Self::STYLESHEET),
            "object" => Some(Self::OBJECT),
            "subdocument" | "frame" => Some(Self::SUB_FRAME),
            "document" | "doc" | "main_frame" => Some(Self::MAIN_FRAME),
            "xmlhttprequest" | "xhr" => Some(Self::XMLHTTPREQUEST),
            "websocket" => Some(Self::WEBSOCKET),
            "font" => Some(Self::FONT),
            "media" => Some(Self::MEDIA),
            "ping" | "beacon" => Some(Self::PING),
            "csp_report" => Some(Self::CSP_REPORT),
            "other" => Some(Self::OTHER),
            _ => None,
        }
    }

    /// Declarative resource type names, in bit order.
    pub fn resource_types(self) -> Vec<String> {
        const NAMES: [(RequestType, &str); 13] = [
            (RequestType::OTHER, "other"),
            (RequestType::SCRIPT, "script"),
            (RequestType::IMAGE, "image"),
            (RequestType::STYLESHEET, "stylesheet"),
            (RequestType::OBJECT, "object"),
            (RequestType::SUB_FRAME, "sub_frame"),
            (RequestType::MAIN_FRAME, "main_frame"),
            (RequestType::XMLHTTPREQUEST, "xmlhttprequest"),
            (RequestType::WEBSOCKET, "websocket"),
            (RequestType::FONT, "font"),
            (RequestType::MEDIA, "media"),
            (RequestType::PING, "ping"),
            (RequestType::CSP_REPORT, "csp_report"),
        ];
        NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| name.to_string())
            .collect()
    }
}

bitflags::bitflags! {
    /// Party (first-party / third-party) mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PartyMask: u8 {
        const FIRST_PARTY = 1 << 0;
        const THIRD_PARTY = 1 << 1;
        const ALL = Self::FIRST_PARTY.bits() | Self::THIRD_PARTY.bits();
    }
}

impl PartyMask {
    pub fn from_option(name: &str) -> Option<Self> {
        match name {
            "third-party" | "thirdparty" | "3p" => Some(Self::THIRD_PARTY),
            "first-party" | "firstparty" | "1p" => Some(Self::FIRST_PARTY),
            _ => None,
        }
    }
}

// =============================================================================
// Declarative Rules
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct DnrRule {
    pub id: u32,
    pub priority: u32,
    pub action: DnrAction,
    pub condition: DnrCondition,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
pub struct DnrAction {
    #[serde(rename = "type")]
    pub kind: DnrActionType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub enum DnrActionType {
    Block,
    Allow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub enum DomainType {
    FirstParty,
    ThirdParty,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
pub struct DnrCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub regex_filter: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_url_filter_case_sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_initiator_domains: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub excluded_resource_types: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_type: Option<DomainType>,
}

/// A filter that could not be converted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionError {
    pub filter: String,
    pub error: FilterError,
}

/// Outcome of a batch conversion; partial success is normal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Conversion {
    pub rules: Vec<DnrRule>,
    pub errors: Vec<ConversionError>,
}

const PRIORITY_BLOCK: u32 = 1;
const PRIORITY_ALLOW: u32 = 2;
const PRIORITY_IMPORTANT: u32 = 3;

/// Convert filter lines, numbering rules from `first_id`. Blank and comment
/// lines are skipped silently.
pub fn convert_filters<'a, I>(lines: I, first_id: u32) -> Conversion
where
    I: IntoIterator<Item = &'a str>,
{
    let mut conversion = Conversion::default();
    let mut next_id = Some(first_id);

    for line in lines {
        let result = line
            .parse::<Filter>()
            .and_then(|filter| match filter {
                Filter::Network(network) => {
                    let id = next_id.ok_or(FilterError::RuleIdsExhausted)?;
                    convert_filter(&network, id)
                }
                Filter::Cosmetic(_) => Err(FilterError::CosmeticNotConvertible),
            });

        match result {
            Ok(rule) => {
                conversion.rules.push(rule);
                next_id = next_id.and_then(|id| id.checked_add(1));
            }
            Err(FilterError::Empty | FilterError::Comment) => {}
            Err(error) => conversion.errors.push(ConversionError {
                filter: line.trim().to_string(),
                error,
            }),
        }
    }

    if !conversion.errors.is_empty() {
        log::debug!(
            "Converted {} filters, {} could not be converted",
            conversion.rules.len(),
            conversion.errors.len()
        );
    }

    conversion
}

/// Convert one network filter into a declarative rule.
pub fn convert_filter(filter: &NetworkFilter, id: u32) -> Result<DnrRule, FilterError> {
    let mut condition = DnrCondition::default();
    let mut important = false;
    let mut type_include = RequestType::empty();
    let mut type_exclude = RequestType::empty();
    let mut party = PartyMask::empty();

    for option in &filter.options {
        let raw = match option {
            NetworkOption::Domain(domains) => {
                let (excluded, included): (Vec<&String>, Vec<&String>) =
                    domains.iter().partition(|d| d.starts_with('~'));
                if !included.is_empty() {
                    condition.initiator_domains = Some(included.into_iter().cloned().collect());
                }
                if !excluded.is_empty() {
                    condition.excluded_initiator_domains =
                        Some(excluded.iter().map(|d| d[1..].to_string()).collect());
                }
                continue;
            }
            NetworkOption::Flag(raw) => raw.to_ascii_lowercase(),
        };

        match raw.as_str() {
            "important" => {
                important = true;
                continue;
            }
            "match-case" | "match_case" => {
                condition.is_url_filter_case_sensitive = Some(true);
                continue;
            }
            _ => {}
        }

        let (negated, name) = match raw.strip_prefix('~') {
            Some(rest) => (true, rest),
            None => (false, raw.as_str()),
        };

        if let Some(bit) = RequestType::from_option(name) {
            if negated {
                type_exclude |= bit;
            } else {
                type_include |= bit;
            }
            continue;
        }

        if let Some(mask) = PartyMask::from_option(name) {
            // ~third-party is first-party and vice versa
            party |= if negated { PartyMask::ALL.difference(mask) } else { mask };
            continue;
        }

        return Err(FilterError::UnsupportedOption(raw));
    }

    if !type_include.is_empty() {
        let types = type_include.difference(type_exclude);
        if types.is_empty() {
            return Err(FilterError::NoResourceTypes);
        }
        condition.resource_types = Some(types.resource_types());
    } else if !type_exclude.is_empty() {
        condition.excluded_resource_types = Some(type_exclude.resource_types());
    }

    if party == PartyMask::THIRD_PARTY {
        condition.domain_type = Some(DomainType::ThirdParty);
    } else if party == PartyMask::FIRST_PARTY {
        condition.domain_type = Some(DomainType::FirstParty);
    }

    let pattern = filter.pattern.as_str();
    if pattern.len() > 1 && pattern.starts_with('/') && pattern.ends_with('/') {
        condition.regex_filter = Some(pattern[1..pattern.len() - 1].to_string());
    } else if !pattern.is_empty() && pattern != "*" {
        condition.url_filter = Some(pattern.to_string());
    }

    let (kind, priority) = match (filter.exception, important) {
        (true, _) => (DnrActionType::Allow, PRIORITY_ALLOW),
        (false, true) => (DnrActionType::Block, PRIORITY_IMPORTANT),
        (false, false) => (DnrActionType::Block, PRIORITY_BLOCK),
    };

    Ok(DnrRule {
        id,
        priority,
        action: DnrAction { kind },
        condition,
    })
}
