//! Topic classification
//!
//! Maps a topic delivered by the source broker to the identifier of the
//! device it concerns. Four pattern families are known: plain device topics
//! and the `$SYS` presence conventions of EMQ X, Mosquitto and VerneMQ.
//!
//! Each family has exactly one extraction pattern. The identifier is the
//! first capture group of the pattern; a topic that does not match (or
//! captures nothing) resolves to [`UNKNOWN_CLIENT_ID`]. The subscription that
//! received the message decides the family, so families never compete for a
//! topic.

pub mod filter;

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

pub use filter::topic_matches_filter;

/// Identifier used when a topic does not yield a device identity
pub const UNKNOWN_CLIENT_ID: &str = "unknown";

/// Topic pattern family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PatternFamily {
    /// `device/<id>` telemetry topics
    Device,
    /// EMQ X `$SYS/brokers/<node>/clients/<id>/<event>`
    EmqSys,
    /// Mosquitto `$SYS/broker/clients/<id>`
    MosquittoSys,
    /// VerneMQ `$SYS/<node>/mqtt/(connect|disconnect)/received`
    VerneSys,
}

impl PatternFamily {
    pub const ALL: [PatternFamily; 4] = [
        PatternFamily::Device,
        PatternFamily::EmqSys,
        PatternFamily::MosquittoSys,
        PatternFamily::VerneSys,
    ];

    /// Stable label used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternFamily::Device => "device",
            PatternFamily::EmqSys => "emq",
            PatternFamily::MosquittoSys => "mosquitto",
            PatternFamily::VerneSys => "vernemq",
        }
    }

    fn index(self) -> usize {
        match self {
            PatternFamily::Device => 0,
            PatternFamily::EmqSys => 1,
            PatternFamily::MosquittoSys => 2,
            PatternFamily::VerneSys => 3,
        }
    }

    /// Extraction pattern source for this family
    pub fn pattern(&self) -> &'static str {
        match self {
            PatternFamily::Device => r"device/(.+)",
            PatternFamily::EmqSys => r"\$SYS/brokers/.+/clients/(.+)/.+",
            PatternFamily::MosquittoSys => r"\$SYS/broker/clients/(.+)",
            // Group 2 only separates the alternatives; connectivity is decided
            // by substring checks on the topic, not by this capture.
            PatternFamily::VerneSys => r"\$SYS/(.+)/mqtt/(disconnect|connect)/received",
        }
    }
}

impl fmt::Display for PatternFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A compiled extraction rule
#[derive(Debug)]
struct Extractor {
    regex: Regex,
    group: usize,
}

/// Immutable table of extraction rules, one per family
#[derive(Debug)]
pub struct PatternTable {
    extractors: [Extractor; 4],
}

static BUILTIN: OnceLock<PatternTable> = OnceLock::new();

impl PatternTable {
    /// The process-wide table, compiled on first use
    pub fn builtin() -> &'static PatternTable {
        BUILTIN.get_or_init(|| {
            let compile = |family: PatternFamily| Extractor {
                // Patterns are compile-time constants covered by tests
                regex: Regex::new(family.pattern()).unwrap(),
                group: 1,
            };
            PatternTable {
                extractors: PatternFamily::ALL.map(compile),
            }
        })
    }

    /// Extract the device identifier from `topic` using the rule of `family`
    pub fn classify(&self, topic: &str, family: PatternFamily) -> String {
        let extractor = &self.extractors[family.index()];
        extractor
            .regex
            .captures(topic)
            .and_then(|caps| caps.get(extractor.group))
            .map(|m| m.as_str())
            .filter(|id| !id.is_empty())
            .unwrap_or(UNKNOWN_CLIENT_ID)
            .to_string()
    }
}

/// Classify a topic with the built-in pattern table
pub fn classify(topic: &str, family: PatternFamily) -> String {
    PatternTable::builtin().classify(topic, family)
}
