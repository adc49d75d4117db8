//! Render a network set into router route directives.

use anyhow::{Context, Result};
use ipnet::{IpNet, Ipv4Net};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::config::{MaskFormat, RenderConfig};
use crate::netset::DualStackSet;

/// Leaves configuration mode once the device has executed the file.
const END_LINE: &str = "end";

/// One line of the rendered artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteCommand {
    /// Removes every previously installed route carrying the black-hole tag.
    ClearAll(String),
    Route {
        prefix: String,
        network: IpAddr,
        /// Device-native mask: `255.255.255.0`, `0.0.0.255` or `/24`
        mask: String,
        suffix: String,
    },
    End,
}

impl fmt::Display for RouteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteCommand::ClearAll(line) => f.write_str(line),
            RouteCommand::Route {
                prefix,
                network,
                mask,
                suffix,
            } => {
                if mask.starts_with('/') {
                    write!(f, "{} {}{} {}", prefix, network, mask, suffix)
                } else {
                    write!(f, "{} {} {} {}", prefix, network, mask, suffix)
                }
            }
            RouteCommand::End => f.write_str(END_LINE),
        }
    }
}

/// First line of every artifact.
pub fn clear_line(template: &RenderConfig) -> String {
    template.clear_command.clone().unwrap_or_else(|| {
        format!("no {} * {}", template.prefix.trim(), template.route_suffix())
    })
}

fn mask_text(net: &Ipv4Net, format: MaskFormat) -> String {
    match format {
        MaskFormat::Netmask => net.netmask().to_string(),
        MaskFormat::Wildcard => net.hostmask().to_string(),
        MaskFormat::Cidr => format!("/{}", net.prefix_len()),
    }
}

/// Render `set` into one clear command, one route per block, and `end`.
///
/// IPv4 blocks come first in ascending order, then IPv6 blocks, which are
/// always written in CIDR form.
pub fn render(set: &DualStackSet, template: &RenderConfig) -> Vec<RouteCommand> {
    let suffix = template.route_suffix();
    let mut commands = Vec::with_capacity(set.len() + 2);
    commands.push(RouteCommand::ClearAll(clear_line(template)));

    for net in set.iter() {
        commands.push(route_command(net, template, &suffix));
    }

    commands.push(RouteCommand::End);
    debug!("Rendered {} route commands", set.len());
    commands
}

fn route_command(net: &IpNet, template: &RenderConfig, suffix: &str) -> RouteCommand {
    let (prefix, mask) = match net {
        IpNet::V4(v4) => (template.prefix.trim(), mask_text(v4, template.mask)),
        IpNet::V6(v6) => (template.ipv6_prefix.trim(), format!("/{}", v6.prefix_len())),
    };
    RouteCommand::Route {
        prefix: prefix.to_string(),
        network: net.network(),
        mask,
        suffix: suffix.to_string(),
    }
}

/// Removal of one installed route, e.g. `no ipv6 route 2001:db8::/32 Null0 tag 66`.
///
/// The clear line only reaches IPv4 routes; IPv6 routes that left the set
/// have to be withdrawn one by one.
pub fn withdraw_line(net: &IpNet, template: &RenderConfig) -> String {
    format!("no {}", route_command(net, template, &template.route_suffix()))
}

/// Prefix length for a dotted mask written in `format`.
fn prefix_from_mask(mask: &str, format: MaskFormat) -> Option<u8> {
    let value = u32::from(mask.parse::<Ipv4Addr>().ok()?);
    let netmask = match format {
        MaskFormat::Netmask => value,
        MaskFormat::Wildcard => !value,
        MaskFormat::Cidr => return None,
    };
    // Contiguous ones from the left only.
    if netmask.leading_ones() + netmask.trailing_zeros() == 32 {
        Some(netmask.leading_ones() as u8)
    } else {
        None
    }
}

/// Parse one route line produced by [`render`] (or shown by the device)
/// back into its network. Returns `None` for any other line.
///
/// `mask` is the notation of dotted masks in the input; devices always
/// display netmasks regardless of how routes were entered.
pub fn parse_route_line(line: &str, template: &RenderConfig, mask: MaskFormat) -> Option<IpNet> {
    let line = line.trim();
    let suffix = template.route_suffix();
    let body = line.strip_suffix(suffix.as_str())?;

    let (body, is_v6) = if let Some(rest) = body.strip_prefix(template.ipv6_prefix.trim()) {
        (rest, true)
    } else {
        (body.strip_prefix(template.prefix.trim())?, false)
    };
    // The prefix must end on a word boundary ("ip route" must not match "ip routes").
    if !body.starts_with(char::is_whitespace) || !body.ends_with(char::is_whitespace) {
        return None;
    }

    let tokens: Vec<&str> = body.split_whitespace().collect();
    let net = match tokens.as_slice() {
        [cidr] if cidr.contains('/') => cidr.parse::<IpNet>().ok()?,
        [addr, dotted] if !is_v6 => {
            let addr: Ipv4Addr = addr.parse().ok()?;
            let len = prefix_from_mask(dotted, mask)?;
            IpNet::V4(Ipv4Net::new(addr, len).ok()?)
        }
        _ => return None,
    };
    match (is_v6, net) {
        (true, IpNet::V6(_)) | (false, IpNet::V4(_)) => Some(net),
        _ => None,
    }
}

/// Every tagged route in `text`, in order of appearance.
pub fn parse_routes(text: &str, template: &RenderConfig, mask: MaskFormat) -> Vec<IpNet> {
    text.lines()
        .filter_map(|line| parse_route_line(line, template, mask))
        .collect()
}

/// The rendered command file and its identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Newline-terminated, no blank lines
    pub text: String,
    /// Hex SHA-256 of `text`
    pub sha256: String,
    pub route_count: usize,
}

impl Artifact {
    pub fn from_commands(commands: &[RouteCommand]) -> Self {
        let mut text = String::new();
        for cmd in commands {
            text.push_str(&cmd.to_string());
            text.push('\n');
        }
        let route_count = commands
            .iter()
            .filter(|c| matches!(c, RouteCommand::Route { .. }))
            .count();
        Self {
            sha256: sha256_hex(text.as_bytes()),
            text,
            route_count,
        }
    }

    /// Copy of this artifact with `stale` routes withdrawn right after the
    /// clear line. The route count still describes the installed set.
    pub fn with_withdrawals(&self, stale: &[IpNet], template: &RenderConfig) -> Self {
        let mut lines = self.text.lines();
        let mut text = String::with_capacity(self.text.len() + stale.len() * 48);
        if let Some(clear) = lines.next() {
            text.push_str(clear);
            text.push('\n');
        }
        for net in stale {
            text.push_str(&withdraw_line(net, template));
            text.push('\n');
        }
        for line in lines {
            text.push_str(line);
            text.push('\n');
        }
        Self {
            sha256: sha256_hex(text.as_bytes()),
            text,
            route_count: self.route_count,
        }
    }

    pub fn line_count(&self) -> usize {
        self.text.lines().count()
    }

    /// Write the artifact atomically (temp file + rename).
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let parent_dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent_dir)
            .with_context(|| format!("Failed to create directory {:?}", parent_dir))?;

        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .context("Failed to create temporary file for artifact")?;
        temp_file.write_all(self.text.as_bytes())?;
        temp_file.as_file().sync_all()?;
        temp_file
            .persist(path)
            .with_context(|| format!("Failed to persist artifact: {:?}", path))?;

        info!(
            "Wrote {} route commands to {:?} (sha256 {})",
            self.route_count,
            path,
            &self.sha256[..12]
        );
        Ok(())
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
