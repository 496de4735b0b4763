use serde::{Deserialize, Serialize};

/// Index of a page within a page store. Pages chain to each other by id, never by address.
pub type PageId = u32;

/// Marks an absent page link (end of chain, unset list pointers).
pub const INVALID_PAGE: PageId = u32::MAX;

/// Identifier of a source row, stored verbatim in every index entry.
///
/// Block-organized sources pack a `(block, offset)` pair into the value; the
/// index itself only compares and copies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowRef(pub u64);

impl RowRef {
    pub const SIZE: usize = 8;

    pub fn new(block: u32, offset: u16) -> Self {
        RowRef(((block as u64) << 16) | offset as u64)
    }

    pub fn block(self) -> u32 {
        (self.0 >> 16) as u32
    }

    pub fn offset(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.0.to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 8]) -> Self {
        RowRef(u64::from_le_bytes(bytes))
    }
}

impl std::fmt::Display for RowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.block(), self.offset())
    }
}

/// Read consistency requested by a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Point-in-time view supplied by the caller; required by the scanner.
    #[default]
    Snapshot,
    /// Per-row visibility checks (dirty or self reads); rejected at scan start.
    Any,
}

/// How far a scan may widen beyond its first batch of probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterativeScan {
    /// Scan exactly `probes` lists.
    #[default]
    Off,
    /// Keep pulling batches of `probes` lists until `max_probes` are drained.
    RelaxedOrder,
}

impl std::fmt::Display for IterativeScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IterativeScan::Off => write!(f, "off"),
            IterativeScan::RelaxedOrder => write!(f, "relaxed_order"),
        }
    }
}

impl std::str::FromStr for IterativeScan {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "off" => Ok(IterativeScan::Off),
            "relaxed_order" => Ok(IterativeScan::RelaxedOrder),
            other => Err(format!("unknown iterative scan mode: {other}")),
        }
    }
}
