//! GATT blocklist.
//!
//! Services, characteristics and descriptors that must never be exposed
//! to an untrusted client, either entirely or for one access direction.
//! Entries are one per line, `uuid [exclude-reads|exclude-writes]`; a bare
//! UUID is excluded for everything. Extra lines can be appended through
//! the settings file.

use std::collections::HashMap;

use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exclusion {
    All,
    Reads,
    Writes,
}

const BUILTIN: &str = "\
00001812-0000-1000-8000-00805f9b34fb
00001530-1212-efde-1523-785feabcd123
f000ffc0-0451-4000-b000-000000000000
00060000-0000-1000-8000-00805f9b34fb
00002a02-0000-1000-8000-00805f9b34fb exclude-writes
00002a03-0000-1000-8000-00805f9b34fb
00002902-0000-1000-8000-00805f9b34fb exclude-writes
";

#[derive(Debug, Clone)]
pub struct Blocklist {
    entries: HashMap<Uuid, Exclusion>,
}

impl Blocklist {
    /// Built-in entries plus any extra lines from configuration.
    /// Malformed extra lines are logged and skipped.
    pub fn with_extra(extra: &[String]) -> Self {
        let mut entries = HashMap::new();
        for line in BUILTIN.lines() {
            if let Some((uuid, exclusion)) = parse_line(line) {
                entries.insert(uuid, exclusion);
            }
        }
        for line in extra {
            match parse_line(line) {
                Some((uuid, exclusion)) => {
                    entries.insert(uuid, exclusion);
                }
                None => warn!(line, "ignoring malformed blocklist line"),
            }
        }
        Self { entries }
    }

    pub fn is_blocklisted(&self, uuid: &Uuid) -> bool {
        self.entries.get(uuid) == Some(&Exclusion::All)
    }

    pub fn is_blocklisted_for_reads(&self, uuid: &Uuid) -> bool {
        matches!(self.entries.get(uuid), Some(Exclusion::All | Exclusion::Reads))
    }

    pub fn is_blocklisted_for_writes(&self, uuid: &Uuid) -> bool {
        matches!(self.entries.get(uuid), Some(Exclusion::All | Exclusion::Writes))
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::with_extra(&[])
    }
}

fn parse_line(line: &str) -> Option<(Uuid, Exclusion)> {
    let mut parts = line.split_whitespace();
    let uuid = Uuid::parse_str(parts.next()?).ok()?;
    let exclusion = match parts.next() {
        None => Exclusion::All,
        Some("exclude-reads") => Exclusion::Reads,
        Some("exclude-writes") => Exclusion::Writes,
        Some(_) => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((uuid, exclusion))
}
