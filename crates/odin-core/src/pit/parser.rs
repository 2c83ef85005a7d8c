//! PIT parsing strategies.
//!
//! Converts the external tool's textual `print-pit` output, raw PIT
//! bytes, or a session-downloaded PIT into a set of [`Partition`]s.
//! Strategies are tried in order of authority; every failure is logged
//! and swallowed so the next strategy gets its chance.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use regex::bytes;
use tracing::{debug, warn};

use crate::pit::catalog::Partition;
use crate::session::DeviceSession;
use crate::tool::HeimdallTool;
use crate::transport::BulkTransport;

/// Tokens that show up in PIT structural data but never name a partition.
const NOISE_TOKENS: &[&str] = &[
    "pit",
    "samsung",
    "android",
    "partition",
    "table",
    "header",
    "bootloader",
    "odinfw",
];

/// Smallest value the heuristic accepts as a partition size (4 KiB).
/// The documented upper bound of the plausible range is 4 GiB, which a
/// 4-byte little-endian value cannot exceed.
const MIN_PLAUSIBLE_SIZE: u32 = 0x1000;

/// Window searched around a name's first occurrence for a size value.
const SIZE_WINDOW_BEFORE: usize = 64;
const SIZE_WINDOW_AFTER: usize = 256;

pub struct PitParser {
    name_re: Regex,
    size_re: Regex,
    id_re: Regex,
    token_re: bytes::Regex,
}

impl PitParser {
    pub fn new() -> Self {
        Self {
            name_re: Regex::new(r#"Name:\s*['"]?([A-Za-z0-9_\-]+)['"]?"#).expect("static regex"),
            size_re: Regex::new(r"Size:\s*(?:0x)?([0-9A-Fa-f]+)").expect("static regex"),
            id_re: Regex::new(r"(?:Identifier|Id|ID):\s*([0-9]+)").expect("static regex"),
            token_re: bytes::Regex::new(r"([A-Za-z0-9_\-]{3,32})\x00").expect("static regex"),
        }
    }

    /// Run the parsing strategies in order; first non-empty result wins.
    ///
    /// 1. Tool `print-pit` on an on-disk PIT file
    /// 2. Tool `download-pit` to a temporary file, then strategy 1 on it
    /// 3. Heuristic scan of caller-supplied PIT bytes
    /// 4. Session raw download, then strategy 1 (tool present) or 3
    ///
    /// Returns an empty vector only when every strategy is exhausted.
    pub fn parse_chain<T: BulkTransport>(
        &self,
        tool: Option<&HeimdallTool>,
        pit_path: Option<&Path>,
        pit_bytes: Option<&[u8]>,
        session: &mut DeviceSession<T>,
    ) -> Vec<Partition> {
        if let (Some(tool), Some(path)) = (tool, pit_path) {
            if path.exists() {
                match self.parse_with_tool_file(tool, path) {
                    Ok(parts) if !parts.is_empty() => return parts,
                    Ok(_) => warn!(path = %path.display(), "tool parsed zero partitions from file"),
                    Err(e) => warn!(error = %e, "print-pit on local file failed"),
                }
            }
        }

        if let Some(tool) = tool {
            match self.parse_via_tool_device(tool) {
                Ok(parts) if !parts.is_empty() => return parts,
                Ok(_) => warn!("tool parsed zero partitions from device PIT"),
                Err(e) => warn!(error = %e, "tool-driven device PIT parse failed"),
            }
        }

        if let Some(data) = pit_bytes {
            let parts = self.parse_heuristic(data);
            if !parts.is_empty() {
                return parts;
            }
            warn!("heuristic scan of supplied bytes found no partitions");
        }

        match session.download_pit() {
            Ok(data) => {
                if let Some(tool) = tool {
                    match self.parse_downloaded_with_tool(tool, &data) {
                        Ok(parts) if !parts.is_empty() => return parts,
                        Ok(_) => warn!("tool parsed zero partitions from downloaded PIT"),
                        Err(e) => warn!(error = %e, "tool parse of downloaded PIT failed"),
                    }
                }
                let parts = self.parse_heuristic(&data);
                if !parts.is_empty() {
                    return parts;
                }
                warn!("heuristic scan of downloaded PIT found no partitions");
            }
            Err(e) => warn!(error = %e, "session PIT download failed"),
        }

        Vec::new()
    }

    /// Strategy 1: let the external tool pretty-print an on-disk PIT.
    fn parse_with_tool_file(&self, tool: &HeimdallTool, pit_path: &Path) -> Result<Vec<Partition>> {
        let output = tool.print_pit_file(pit_path)?;
        Ok(self.parse_text(&output))
    }

    /// Strategy 2: pull the PIT off the device with the tool, then parse.
    /// The temporary file is removed on drop whether or not parsing worked.
    fn parse_via_tool_device(&self, tool: &HeimdallTool) -> Result<Vec<Partition>> {
        let tmp = tempfile::Builder::new()
            .suffix(".pit")
            .tempfile()
            .context("creating temporary PIT file")?;
        tool.download_pit(tmp.path())?;
        self.parse_with_tool_file(tool, tmp.path())
    }

    /// Strategy 4's tool half: stage session-downloaded bytes for the tool.
    fn parse_downloaded_with_tool(&self, tool: &HeimdallTool, data: &[u8]) -> Result<Vec<Partition>> {
        let tmp = tempfile::Builder::new()
            .suffix(".pit")
            .tempfile()
            .context("creating temporary PIT file")?;
        fs::write(tmp.path(), data).context("staging downloaded PIT")?;
        self.parse_with_tool_file(tool, tmp.path())
    }

    /// Parse the external tool's `print-pit` textual output.
    ///
    /// A `Partition #`/`Entry #` line flushes the in-progress record and
    /// starts a new one; `Name:`, `Size:` and `Identifier:` lines are
    /// matched independently. A record with no name is discarded.
    pub fn parse_text(&self, text: &str) -> Vec<Partition> {
        let mut parts = Vec::new();
        let mut name: Option<String> = None;
        let mut size: Option<u64> = None;
        let mut id: Option<u32> = None;

        for line in text.lines() {
            let line = line.trim();

            if line.contains("Partition #") || line.contains("Entry #") {
                if let Some(n) = name.take() {
                    parts.push(Partition {
                        name: n,
                        start: None,
                        length: size,
                        id,
                        filename: None,
                    });
                }
                size = None;
                id = None;
                continue;
            }

            if let Some(caps) = self.name_re.captures(line) {
                name = Some(caps[1].to_ascii_lowercase());
                continue;
            }

            if let Some(caps) = self.size_re.captures(line) {
                let radix = if line.to_ascii_lowercase().contains("0x") {
                    16
                } else {
                    10
                };
                if let Ok(v) = u64::from_str_radix(&caps[1], radix) {
                    size = Some(v);
                }
                continue;
            }

            if let Some(caps) = self.id_re.captures(line) {
                if let Ok(v) = caps[1].parse::<u32>() {
                    id = Some(v);
                }
            }
        }

        // Flush the record in progress at end of input.
        if let Some(n) = name.take() {
            parts.push(Partition {
                name: n,
                start: None,
                length: size,
                id,
                filename: None,
            });
        }

        parts
    }

    /// Heuristic scan of raw PIT bytes.
    ///
    /// Collects zero-terminated ASCII tokens of length 3-32, rejects
    /// structural noise, deduplicates by name, and searches a bounded
    /// window around each name's first occurrence for a plausible
    /// little-endian size value.
    pub fn parse_heuristic(&self, data: &[u8]) -> Vec<Partition> {
        let mut parts = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for caps in self.token_re.captures_iter(data) {
            let Some(m) = caps.get(1) else { continue };
            // Tokens are ASCII by construction of the pattern.
            let name = String::from_utf8_lossy(m.as_bytes()).to_ascii_lowercase();

            if NOISE_TOKENS.contains(&name.as_str()) || seen.contains(&name) {
                continue;
            }
            seen.insert(name.clone());

            let length = self.find_size_near(data, m.start(), m.end());
            debug!(partition = %name, ?length, "heuristic candidate");
            parts.push(Partition {
                name,
                start: None,
                length,
                id: None,
                filename: None,
            });
        }

        parts
    }

    /// First plausible 4-byte LE size in the window around a name token.
    ///
    /// Windows overlapping the token span are skipped: the name's own
    /// ASCII bytes always decode to a "plausible" integer.
    fn find_size_near(&self, data: &[u8], token_start: usize, token_end: usize) -> Option<u64> {
        let start = token_start.saturating_sub(SIZE_WINDOW_BEFORE);
        let end = (token_start + SIZE_WINDOW_AFTER).min(data.len());
        for i in start..end.saturating_sub(3) {
            if i < token_end && i + 4 > token_start {
                continue;
            }
            let value = u32::from_le_bytes(data[i..i + 4].try_into().unwrap());
            if value >= MIN_PLAUSIBLE_SIZE {
                return Some(u64::from(value));
            }
        }
        None
    }
}

impl Default for PitParser {
    fn default() -> Self {
        Self::new()
    }
}
