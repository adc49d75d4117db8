//! Merge raw blocklist sources into one normalized set.

use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use tracing::{debug, info, warn};

use crate::error::RtbhError;
use crate::netset::DualStackSet;
use crate::utils::format_count;

/// Raw text downloaded or read for one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceBlob {
    /// Source name from the config, or `local:<file>` for custom entry files.
    pub id: String,
    pub content: String,
}

impl SourceBlob {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
        }
    }
}

/// A line that is neither blank, a comment, nor a valid address/CIDR.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub source_id: String,
    /// 1-based line number inside the source.
    pub line: usize,
    pub text: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}: cannot parse '{}'", self.source_id, self.line, self.text)
    }
}

impl From<ParseError> for RtbhError {
    fn from(e: ParseError) -> Self {
        RtbhError::Parse {
            source_id: e.source_id,
            line: e.line,
            text: e.text,
        }
    }
}

/// Per-source accounting for the run report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceSummary {
    pub id: String,
    /// Lines that parsed into a network.
    pub entries: usize,
    pub parse_errors: usize,
    /// Blocks left after normalizing this source on its own.
    pub blocks: usize,
}

impl SourceSummary {
    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }
}

/// Output of [`aggregate`].
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    pub set: DualStackSet,
    pub parse_errors: Vec<ParseError>,
    pub summaries: Vec<SourceSummary>,
}

impl Aggregation {
    /// Sources that contributed zero networks.
    pub fn empty_sources(&self) -> impl Iterator<Item = &SourceSummary> {
        self.summaries.iter().filter(|s| s.is_empty())
    }
}

/// Classification of a single list line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedLine {
    /// Blank or comment.
    Skip,
    Network(IpNet),
    Invalid,
}

/// Parse one list line.
///
/// Inline `#` comments and `;` annotations (Spamhaus DROP style) are
/// stripped. Bare addresses become /32 or /128, host bits in a CIDR are
/// masked off.
pub fn parse_line(line: &str) -> ParsedLine {
    let data = line.split('#').next().unwrap_or_default();
    let data = data.split(';').next().unwrap_or_default().trim();
    if data.is_empty() {
        return ParsedLine::Skip;
    }
    let parsed = if data.contains('/') {
        data.parse::<IpNet>().ok().map(|net| net.trunc())
    } else {
        data.parse::<IpAddr>().ok().map(IpNet::from)
    };
    parsed.map_or(ParsedLine::Invalid, ParsedLine::Network)
}

/// Parse a whole blob, collecting networks and per-line errors.
pub fn parse_source(blob: &SourceBlob) -> (Vec<IpNet>, Vec<ParseError>) {
    let mut nets = Vec::new();
    let mut errors = Vec::new();
    for (idx, line) in blob.content.lines().enumerate() {
        match parse_line(line) {
            ParsedLine::Skip => {}
            ParsedLine::Network(net) => nets.push(net),
            ParsedLine::Invalid => errors.push(ParseError {
                source_id: blob.id.clone(),
                line: idx + 1,
                text: line.trim().to_string(),
            }),
        }
    }
    (nets, errors)
}

/// Parse every source and fold all networks plus `local_entries` into one set.
///
/// Sources may arrive in any order (they come from concurrent downloads);
/// they are processed sorted by id so that error reports are reproducible.
/// Malformed lines never abort the run, they end up in `parse_errors`.
pub fn aggregate(sources: &[SourceBlob], local_entries: &[IpNet]) -> Result<Aggregation, RtbhError> {
    let mut ordered: Vec<&SourceBlob> = sources.iter().collect();
    ordered.sort_by(|a, b| a.id.cmp(&b.id).then_with(|| a.content.cmp(&b.content)));

    let mut result = Aggregation::default();
    let mut raw_total = 0usize;

    for blob in ordered {
        let (nets, errors) = parse_source(blob);
        let entries = nets.len();
        raw_total += entries;

        let source_set = DualStackSet::from_blocks(nets)?;
        debug!(
            "{}: {} entries -> {} blocks, {} unparsable lines",
            blob.id,
            entries,
            source_set.len(),
            errors.len()
        );
        if entries == 0 {
            warn!("Source {} contained no valid networks", blob.id);
        }

        result.summaries.push(SourceSummary {
            id: blob.id.clone(),
            entries,
            parse_errors: errors.len(),
            blocks: source_set.len(),
        });
        result.parse_errors.extend(errors);
        result.set = result.set.union(&source_set)?;
    }

    if !local_entries.is_empty() {
        raw_total += local_entries.len();
        let local = DualStackSet::from_blocks(local_entries.iter().copied())?;
        result.set = result.set.union(&local)?;
    }

    info!(
        "Aggregated {} entries -> {} blocks ({} unparsable lines)",
        format_count(raw_total),
        format_count(result.set.len()),
        result.parse_errors.len()
    );

    Ok(result)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn line_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            (0u8..=255, 0u8..=255, 0u8..=255, 0u8..=255)
                .prop_map(|(a, b, c, d)| format!("{a}.{b}.{c}.{d}")),
            (0u8..=255, 0u8..=255, 0u8..=32).prop_map(|(a, b, p)| format!("{a}.{b}.0.0/{p}")),
            Just("# comment".to_string()),
            Just(String::new()),
            "[a-z]{1,8}",
        ]
    }

    proptest! {
        /// Parsing is total: every non-comment line is either a network or an error.
        #[test]
        fn prop_every_line_accounted_for(lines in prop::collection::vec(line_strategy(), 0..80)) {
            let content = lines.join("\n");
            let blob = SourceBlob::new("p", content.clone());
            let (nets, errors) = parse_source(&blob);
            let meaningful = content
                .lines()
                .filter(|l| parse_line(l) != ParsedLine::Skip)
                .count();
            prop_assert_eq!(nets.len() + errors.len(), meaningful);
        }

        /// Every parsed network is covered by the aggregate.
        #[test]
        fn prop_aggregate_covers_inputs(lines in prop::collection::vec(line_strategy(), 0..60)) {
            let blob = SourceBlob::new("p", lines.join("\n"));
            let (nets, _) = parse_source(&blob);
            let agg = aggregate(&[blob], &[]).unwrap();
            for net in nets {
                prop_assert!(agg.set.contains_addr(&net.network()));
                prop_assert!(agg.set.contains_addr(&net.broadcast()));
            }
        }
    }
}
