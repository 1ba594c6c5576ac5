use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Cluster tag of an endpoint inside a region.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GroupTag {
    A,
    B,
}

impl GroupTag {
    /// Parse a raw tag; anything but `A`/`B` (case-insensitive) is untagged.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            t if t.eq_ignore_ascii_case("a") => Some(GroupTag::A),
            t if t.eq_ignore_ascii_case("b") => Some(GroupTag::B),
            _ => None,
        }
    }
}

/// One game server instance of a region, as produced by the server list.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: String,
    pub ip: String,
    pub port: u16,
    pub group: Option<GroupTag>,
    pub sequence_index: usize,
}

impl Endpoint {
    /// Untagged endpoints belong to group A.
    pub fn effective_group(&self) -> GroupTag {
        self.group.unwrap_or(GroupTag::A)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    #[default]
    Waiting,
    Measuring,
    Done,
    Timeout,
    Skipped,
}

impl ProbeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProbeStatus::Done | ProbeStatus::Timeout | ProbeStatus::Skipped)
    }
}

/// Probe state of a single endpoint. Terminal states are never left again.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProbeOutcome {
    pub ping: Option<u32>,
    pub status: ProbeStatus,
}

impl ProbeOutcome {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn start_measuring(&mut self) -> bool {
        if self.status != ProbeStatus::Waiting {
            return false;
        }
        self.status = ProbeStatus::Measuring;
        true
    }

    /// Record the probe result: `done` with a ping, `timeout` without one.
    pub fn finish(&mut self, ping: Option<u32>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.ping = ping;
        self.status = if ping.is_some() {
            ProbeStatus::Done
        } else {
            ProbeStatus::Timeout
        };
        true
    }

    pub fn skip(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.ping = None;
        self.status = ProbeStatus::Skipped;
        true
    }
}

/// Which group(s) of a region answered at least once.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveGroup {
    #[serde(rename = "A")]
    A,
    #[serde(rename = "B")]
    B,
    #[serde(rename = "A+B")]
    Both,
}

impl ActiveGroup {
    pub fn from_success_counts(a: u64, b: u64) -> Option<Self> {
        match (a > 0, b > 0) {
            (true, false) => Some(ActiveGroup::A),
            (false, true) => Some(ActiveGroup::B),
            (true, true) => Some(ActiveGroup::Both),
            (false, false) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActiveGroup::A => "A",
            ActiveGroup::B => "B",
            ActiveGroup::Both => "A+B",
        }
    }
}

/// Outcome of one region scan, keyed by endpoint sequence index.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct RegionResult {
    pub active_group: Option<ActiveGroup>,
    pub outcomes: BTreeMap<usize, ProbeOutcome>,
}

/// Per-region scan report. `error` is set when the server list could not be fetched.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RegionReport {
    pub region: String,
    pub scanned_at: String,
    pub endpoints: Vec<Endpoint>,
    pub result: Option<RegionResult>,
    pub error: Option<String>,
}

/// Canonical geolocation metadata for one IP.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoRecord {
    pub country_code: String,
    pub country: String,
    pub org: String,
}

impl GeoRecord {
    pub fn new(country_code: &str, country: &str, org: &str) -> Self {
        Self {
            country_code: country_code.trim().to_ascii_uppercase(),
            country: country.trim().to_string(),
            org: org.trim().to_string(),
        }
    }

    pub fn has_info(&self) -> bool {
        !(self.country_code.is_empty() && self.country.is_empty() && self.org.is_empty())
    }

    /// Still missing a display country or an organization.
    pub fn is_incomplete(&self) -> bool {
        self.country.is_empty() || self.org.is_empty()
    }

    /// Overlay `other` on top of `self`: non-empty fields of `other` win, empty ones never erase.
    pub fn merge(&self, other: &GeoRecord) -> GeoRecord {
        fn pick(base: &str, over: &str) -> String {
            let chosen = if over.is_empty() { base } else { over };
            chosen.to_string()
        }
        GeoRecord {
            country_code: pick(&self.country_code, &other.country_code),
            country: pick(&self.country, &other.country),
            org: pick(&self.org, &other.org),
        }
    }
}
