//! Partition catalog and identifier resolution.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::{info, warn};

use crate::pit::parser::PitParser;
use crate::protocol::constants::UNKNOWN_PARTITION_ID;
use crate::session::DeviceSession;
use crate::tool::HeimdallTool;
use crate::transport::BulkTransport;

/// A flashable partition as described by the PIT.
///
/// `name` is always non-empty and lowercase; it is the catalog key.
/// An unknown `id` stays `None` and resolves to the 0xFFFFFFFF sentinel,
/// never to 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub start: Option<u64>,
    pub length: Option<u64>,
    pub id: Option<u32>,
    pub filename: Option<String>,
}

impl Partition {
    /// Build a partition carrying only a (case-normalized) name.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_ascii_lowercase(),
            start: None,
            length: None,
            id: None,
            filename: None,
        }
    }
}

/// Conservative layout used when every parsing strategy comes back empty,
/// so the client stays usable in a degraded mode.
const COMMON_PARTITIONS: &[&str] = &["boot", "recovery", "system", "userdata", "cache", "modem"];

/// Well-known name-to-identifier mappings for partitions whose PIT entry
/// carried no id. `radio` is an alias of `modem`.
const WELL_KNOWN_IDS: &[(&str, u32)] = &[
    ("boot", 1),
    ("recovery", 2),
    ("system", 3),
    ("userdata", 4),
    ("cache", 5),
    ("modem", 6),
    ("radio", 6),
    ("efs", 7),
    ("param", 8),
    ("dtb", 9),
    ("dtbo", 10),
    ("vbmeta", 11),
    ("misc", 12),
];

/// Name-keyed partition mapping for one connected session.
#[derive(Debug, Default)]
pub struct PartitionCatalog {
    partitions: BTreeMap<String, Partition>,
    layout_detected: bool,
}

impl PartitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(&name.to_ascii_lowercase())
    }

    pub fn partitions(&self) -> &BTreeMap<String, Partition> {
        &self.partitions
    }

    pub fn is_detected(&self) -> bool {
        self.layout_detected
    }

    /// Install a parsed partition set, deduplicating by name (first wins).
    /// An empty set installs the built-in common-partition list instead.
    pub fn install(&mut self, parts: Vec<Partition>) {
        if parts.is_empty() {
            warn!("no partitions detected, substituting the common partition list");
            self.partitions = COMMON_PARTITIONS
                .iter()
                .map(|name| (name.to_string(), Partition::named(name)))
                .collect();
        } else {
            self.partitions.clear();
            for part in parts {
                self.partitions.entry(part.name.clone()).or_insert(part);
            }
        }
        self.layout_detected = true;
    }

    /// Detect the partition layout, trying the parsing strategies in order.
    ///
    /// Results are cached: repeated calls return immediately unless the
    /// cache is empty, in which case detection is retried.
    pub fn detect_layout<T: BulkTransport>(
        &mut self,
        parser: &PitParser,
        tool: Option<&HeimdallTool>,
        pit_path: Option<&Path>,
        session: &mut DeviceSession<T>,
    ) {
        if self.layout_detected && !self.partitions.is_empty() {
            return;
        }
        let parts = parser.parse_chain(tool, pit_path, None, session);
        info!(partitions = parts.len(), "partition layout detected");
        self.install(parts);
    }

    /// Resolve a partition name to a protocol identifier.
    ///
    /// An explicit id from the PIT wins; well-known names fall back to the
    /// static table; anything else resolves to [`UNKNOWN_PARTITION_ID`],
    /// which the transfer layer sends as-is and lets the device reject.
    pub fn guess_identifier(&self, name: &str) -> u32 {
        if let Some(part) = self.get(name) {
            if let Some(id) = part.id {
                return id;
            }
        }
        let lower = name.to_ascii_lowercase();
        WELL_KNOWN_IDS
            .iter()
            .find(|(known, _)| *known == lower)
            .map(|(_, id)| *id)
            .unwrap_or(UNKNOWN_PARTITION_ID)
    }

    /// Drop all session-scoped state.
    pub fn clear(&mut self) {
        self.partitions.clear();
        self.layout_detected = false;
    }
}
