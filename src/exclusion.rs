//! CIDR-aware removal of trusted networks from the aggregate.
//!
//! Exclusions are subtracted as address ranges, never matched as text: a
//! blocked /16 that contains a trusted /24 is split around it, and a blocked
//! network that merely shares digits with a trusted one is left alone.

use ipnet::IpNet;
use std::path::Path;
use tracing::{debug, info};

use crate::aggregator::{parse_source, SourceBlob};
use crate::config::{parse_entry, Config};
use crate::error::RtbhError;
use crate::netset::DualStackSet;

/// Trusted networks, read-only for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    set: DualStackSet,
}

impl ExclusionSet {
    pub fn from_blocks(blocks: impl IntoIterator<Item = IpNet>) -> Result<Self, RtbhError> {
        Ok(Self {
            set: DualStackSet::from_blocks(blocks)?,
        })
    }

    /// Parse an exclusion list: one network per line, comments allowed.
    ///
    /// Unlike blocklist sources, a malformed line here is fatal. Silently
    /// dropping a trusted network could null-route it.
    pub fn parse(source_id: &str, content: &str) -> Result<Self, RtbhError> {
        let (nets, errors) = parse_source(&SourceBlob::new(source_id, content));
        if let Some(first) = errors.into_iter().next() {
            return Err(first.into());
        }
        Self::from_blocks(nets)
    }

    /// Inline `exclusions` plus the optional `exclusions_file`.
    pub fn load(config: &Config) -> Result<Self, RtbhError> {
        let inline = config
            .exclusions
            .iter()
            .map(|e| parse_entry(e))
            .collect::<Result<Vec<_>, _>>()?;
        let mut exclusions = Self::from_blocks(inline)?;

        if let Some(ref path) = config.exclusions_file {
            let from_file = Self::read_file(path)?;
            exclusions = exclusions.merge(&from_file)?;
        }

        info!("Loaded {} exclusion blocks", exclusions.len());
        Ok(exclusions)
    }

    fn read_file(path: &Path) -> Result<Self, RtbhError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RtbhError::Config(format!("Cannot read exclusions file {:?}: {}", path, e))
        })?;
        Self::parse(&path.display().to_string(), &content)
    }

    fn merge(&self, other: &ExclusionSet) -> Result<Self, RtbhError> {
        Ok(Self {
            set: self.set.union(&other.set)?,
        })
    }

    pub fn set(&self) -> &DualStackSet {
        &self.set
    }

    /// Number of normalized exclusion blocks.
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}

/// Remove every excluded address from `aggregate`.
pub fn apply_exclusions(
    aggregate: &DualStackSet,
    exclusions: &ExclusionSet,
) -> Result<DualStackSet, RtbhError> {
    let result = aggregate.subtract(exclusions.set())?;
    debug!(
        "Exclusions: {} blocks ({} addresses) -> {} blocks ({} addresses)",
        aggregate.len(),
        aggregate.address_count(),
        result.len(),
        result.address_count()
    );
    Ok(result)
}
