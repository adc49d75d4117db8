//! Normalized CIDR sets with exact union and subtraction.
//!
//! Every block is handled as an inclusive numeric interval in the family's
//! integer space. Operations merge or cut intervals and then decompose the
//! result back into the minimal list of CIDR-aligned blocks, so two sets that
//! cover the same addresses always have identical block lists.

use ipnet::IpNet;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::RtbhError;

/// IP address family of a block or set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(net: &IpNet) -> Self {
        match net {
            IpNet::V4(_) => Family::V4,
            IpNet::V6(_) => Family::V6,
        }
    }

    pub fn of_addr(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Number of address bits (32 or 128).
    pub fn max_prefix(self) -> u8 {
        match self {
            Family::V4 => 32,
            Family::V6 => 128,
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::V4 => f.write_str("IPv4"),
            Family::V6 => f.write_str("IPv6"),
        }
    }
}

/// Inclusive address range `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Interval {
    start: u128,
    end: u128,
}

fn addr_value(addr: &IpAddr) -> u128 {
    match addr {
        IpAddr::V4(a) => u128::from(u32::from(*a)),
        IpAddr::V6(a) => u128::from(*a),
    }
}

fn to_interval(net: &IpNet) -> Interval {
    let net = net.trunc();
    Interval {
        start: addr_value(&net.network()),
        end: addr_value(&net.broadcast()),
    }
}

fn to_block(family: Family, start: u128, prefix: u8) -> Result<IpNet, RtbhError> {
    let addr = match family {
        // Callers only pass values taken from IPv4 intervals here.
        Family::V4 => IpAddr::V4(Ipv4Addr::from(start as u32)),
        Family::V6 => IpAddr::V6(Ipv6Addr::from(start)),
    };
    IpNet::new(addr, prefix).map_err(|e| RtbhError::InvalidOperand(format!("{addr}/{prefix}: {e}")))
}

/// Sort and merge overlapping or touching intervals.
fn merge(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_unstable();
    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for iv in intervals {
        match merged.last_mut() {
            Some(last) if iv.start <= last.end.saturating_add(1) => {
                last.end = last.end.max(iv.end);
            }
            _ => merged.push(iv),
        }
    }
    merged
}

/// Remove every address of `cut` from `base`. Both inputs must be merged.
fn cut_out(base: &[Interval], cut: &[Interval]) -> Vec<Interval> {
    let mut out = Vec::with_capacity(base.len());
    let mut j = 0;
    for iv in base {
        while j < cut.len() && cut[j].end < iv.start {
            j += 1;
        }
        let mut cursor = iv.start;
        let mut covered = false;
        let mut k = j;
        while k < cut.len() && cut[k].start <= iv.end {
            let ex = cut[k];
            if ex.start > cursor {
                out.push(Interval {
                    start: cursor,
                    end: ex.start - 1,
                });
            }
            if ex.end >= iv.end {
                covered = true;
                break;
            }
            cursor = ex.end + 1;
            k += 1;
        }
        if !covered {
            out.push(Interval {
                start: cursor,
                end: iv.end,
            });
        }
    }
    out
}

/// Split one interval into the minimal run of CIDR-aligned blocks.
fn decompose(family: Family, iv: Interval, out: &mut Vec<IpNet>) -> Result<(), RtbhError> {
    let bits = u32::from(family.max_prefix());
    let mut cursor = iv.start;
    loop {
        let align = if cursor == 0 {
            bits
        } else {
            cursor.trailing_zeros().min(bits)
        };
        let remaining = iv.end - cursor;
        let fit = if remaining == u128::MAX {
            128
        } else {
            127 - (remaining + 1).leading_zeros()
        };
        let size_bits = align.min(fit);
        out.push(to_block(family, cursor, (bits - size_bits) as u8)?);

        let span = if size_bits >= 128 {
            u128::MAX
        } else {
            (1u128 << size_bits) - 1
        };
        let last = cursor + span;
        if last >= iv.end {
            return Ok(());
        }
        cursor = last + 1;
    }
}

fn common_family(a: Option<Family>, b: Option<Family>) -> Result<Option<Family>, RtbhError> {
    match (a, b) {
        (Some(x), Some(y)) if x != y => Err(RtbhError::InvalidOperand(format!(
            "cannot combine {x} and {y} networks in one set operation"
        ))),
        (Some(x), _) | (None, Some(x)) => Ok(Some(x)),
        (None, None) => Ok(None),
    }
}

/// A normalized set of CIDR blocks of a single address family.
///
/// Blocks never overlap, are never mergeable into a larger aligned block and
/// are sorted by base address. Sets are immutable; every operation returns a
/// new set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NetworkSet {
    blocks: Vec<IpNet>,
}

impl NetworkSet {
    /// The empty set (compatible with either family).
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a normalized set from arbitrary blocks of one family.
    ///
    /// Host bits are truncated, duplicates and overlaps collapse. Mixing
    /// IPv4 and IPv6 blocks fails with `InvalidOperand`.
    pub fn from_blocks<I>(blocks: I) -> Result<Self, RtbhError>
    where
        I: IntoIterator<Item = IpNet>,
    {
        let mut family = None;
        let mut intervals = Vec::new();
        for net in blocks {
            family = common_family(family, Some(Family::of(&net)))?;
            intervals.push(to_interval(&net));
        }
        match family {
            Some(family) => Self::from_intervals(family, merge(intervals)),
            None => Ok(Self::new()),
        }
    }

    fn from_intervals(family: Family, intervals: Vec<Interval>) -> Result<Self, RtbhError> {
        let mut blocks = Vec::with_capacity(intervals.len());
        for iv in intervals {
            decompose(family, iv, &mut blocks)?;
        }
        Ok(Self { blocks })
    }

    fn intervals(&self) -> Vec<Interval> {
        self.blocks.iter().map(to_interval).collect()
    }

    /// Family of the blocks, `None` while empty.
    pub fn family(&self) -> Option<Family> {
        self.blocks.first().map(Family::of)
    }

    pub fn blocks(&self) -> &[IpNet] {
        &self.blocks
    }

    pub fn iter(&self) -> std::slice::Iter<'_, IpNet> {
        self.blocks.iter()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Every address covered by `self` or `other`.
    pub fn union(&self, other: &NetworkSet) -> Result<NetworkSet, RtbhError> {
        let Some(family) = common_family(self.family(), other.family())? else {
            return Ok(NetworkSet::new());
        };
        let mut intervals = self.intervals();
        intervals.extend(other.intervals());
        Self::from_intervals(family, merge(intervals))
    }

    /// Every address covered by `self` and not by `other`.
    ///
    /// Blocks partially covered by `other` are split at the exclusion
    /// boundaries; fully covered blocks disappear.
    pub fn subtract(&self, other: &NetworkSet) -> Result<NetworkSet, RtbhError> {
        let Some(family) = common_family(self.family(), other.family())? else {
            return Ok(NetworkSet::new());
        };
        if self.is_empty() || other.is_empty() {
            return Ok(self.clone());
        }
        // Own blocks are normalized, but adjacent blocks still need merging
        // back into one interval before cutting.
        let base = merge(self.intervals());
        let cut = merge(other.intervals());
        Self::from_intervals(family, cut_out(&base, &cut))
    }

    /// Check whether a single address is covered.
    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        if self.family() != Some(Family::of_addr(addr)) {
            return false;
        }
        let value = addr_value(addr);
        let idx = self
            .blocks
            .partition_point(|b| to_interval(b).start <= value);
        idx > 0 && to_interval(&self.blocks[idx - 1]).end >= value
    }

    /// Check whether every address of `net` is covered.
    pub fn covers(&self, net: &IpNet) -> bool {
        if self.family() != Some(Family::of(net)) {
            return false;
        }
        let target = to_interval(net);
        merge(self.intervals())
            .iter()
            .any(|iv| iv.start <= target.start && iv.end >= target.end)
    }

    /// Number of individual addresses covered (saturating for huge IPv6 sets).
    pub fn address_count(&self) -> u128 {
        self.blocks
            .iter()
            .map(|net| {
                let shift = u32::from(net.max_prefix_len() - net.prefix_len());
                if shift >= 128 {
                    u128::MAX
                } else {
                    1u128 << shift
                }
            })
            .fold(0u128, |acc, count| acc.saturating_add(count))
    }
}

impl<'a> IntoIterator for &'a NetworkSet {
    type Item = &'a IpNet;
    type IntoIter = std::slice::Iter<'a, IpNet>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.iter()
    }
}

/// One `NetworkSet` per address family.
///
/// Set operations run independently per family, so IPv4 and IPv6 never
/// meet in a single `NetworkSet` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DualStackSet {
    v4: NetworkSet,
    v6: NetworkSet,
}

impl DualStackSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from blocks of any family.
    pub fn from_blocks<I>(blocks: I) -> Result<Self, RtbhError>
    where
        I: IntoIterator<Item = IpNet>,
    {
        let (v4, v6): (Vec<IpNet>, Vec<IpNet>) = blocks
            .into_iter()
            .partition(|net| Family::of(net) == Family::V4);
        Ok(Self {
            v4: NetworkSet::from_blocks(v4)?,
            v6: NetworkSet::from_blocks(v6)?,
        })
    }

    pub fn v4(&self) -> &NetworkSet {
        &self.v4
    }

    pub fn v6(&self) -> &NetworkSet {
        &self.v6
    }

    pub fn get(&self, family: Family) -> &NetworkSet {
        match family {
            Family::V4 => &self.v4,
            Family::V6 => &self.v6,
        }
    }

    pub fn union(&self, other: &DualStackSet) -> Result<DualStackSet, RtbhError> {
        Ok(Self {
            v4: self.v4.union(&other.v4)?,
            v6: self.v6.union(&other.v6)?,
        })
    }

    pub fn subtract(&self, other: &DualStackSet) -> Result<DualStackSet, RtbhError> {
        Ok(Self {
            v4: self.v4.subtract(&other.v4)?,
            v6: self.v6.subtract(&other.v6)?,
        })
    }

    /// IPv4 blocks first, then IPv6, each in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = &IpNet> {
        self.v4.iter().chain(self.v6.iter())
    }

    pub fn len(&self) -> usize {
        self.v4.len() + self.v6.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    pub fn contains_addr(&self, addr: &IpAddr) -> bool {
        self.get(Family::of_addr(addr)).contains_addr(addr)
    }

    pub fn address_count(&self) -> u128 {
        self.v4
            .address_count()
            .saturating_add(self.v6.address_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> NetworkSet {
        NetworkSet::from_blocks(items.iter().map(|s| s.parse::<IpNet>().unwrap())).unwrap()
    }

    fn strings(s: &NetworkSet) -> Vec<String> {
        s.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_supernet_collapse() {
        let a = set(&["10.0.0.0/24"]);
        let b = set(&["10.0.0.128/25"]);
        assert_eq!(strings(&a.union(&b).unwrap()), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_adjacent_halves_merge() {
        let s = set(&["192.168.0.0/25", "192.168.0.128/25"]);
        assert_eq!(strings(&s), vec!["192.168.0.0/24"]);
    }

    #[test]
    fn test_adjacent_but_misaligned_stay_separate() {
        // 10.0.1.0/24 + 10.0.2.0/24 touch but do not form an aligned /23
        let s = set(&["10.0.1.0/24", "10.0.2.0/24"]);
        assert_eq!(strings(&s), vec!["10.0.1.0/24", "10.0.2.0/24"]);
    }

    #[test]
    fn test_unaligned_range_decomposes_minimally() {
        // .1 through .6
        let s = set(&[
            "10.0.0.1/32",
            "10.0.0.2/32",
            "10.0.0.3/32",
            "10.0.0.4/32",
            "10.0.0.5/32",
            "10.0.0.6/32",
        ]);
        assert_eq!(
            strings(&s),
            vec!["10.0.0.1/32", "10.0.0.2/31", "10.0.0.4/31", "10.0.0.6/32"]
        );
    }

    #[test]
    fn test_host_bits_are_truncated() {
        let s = set(&["10.0.0.77/24"]);
        assert_eq!(strings(&s), vec!["10.0.0.0/24"]);
    }

    #[test]
    fn test_duplicates_collapse() {
        let s = set(&["5.6.7.8/32", "5.6.7.8/32"]);
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn test_subtract_partial_overlap() {
        let a = set(&["1.2.3.0/24"]);
        let e = set(&["1.2.3.128/25"]);
        assert_eq!(strings(&a.subtract(&e).unwrap()), vec!["1.2.3.0/25"]);
    }

    #[test]
    fn test_subtract_full_cover() {
        let a = set(&["8.8.8.8/32"]);
        let e = set(&["8.8.8.0/24"]);
        assert!(a.subtract(&e).unwrap().is_empty());
    }

    #[test]
    fn test_subtract_hole_in_middle() {
        let a = set(&["10.0.0.0/24"]);
        let e = set(&["10.0.0.64/26"]);
        assert_eq!(
            strings(&a.subtract(&e).unwrap()),
            vec!["10.0.0.0/26", "10.0.0.128/25"]
        );
    }

    #[test]
    fn test_subtract_single_host_from_block() {
        let a = set(&["192.0.2.0/30"]);
        let e = set(&["192.0.2.1/32"]);
        assert_eq!(
            strings(&a.subtract(&e).unwrap()),
            vec!["192.0.2.0/32", "192.0.2.2/31"]
        );
    }

    #[test]
    fn test_subtract_across_adjacent_blocks() {
        // Exclusion straddles the border between two stored blocks.
        let a = set(&["10.0.1.0/24", "10.0.2.0/24"]);
        let e = set(&["10.0.1.192/26", "10.0.2.0/26"]);
        assert_eq!(
            strings(&a.subtract(&e).unwrap()),
            vec!["10.0.1.0/25", "10.0.1.128/26", "10.0.2.64/26", "10.0.2.128/25"]
        );
    }

    #[test]
    fn test_subtract_textual_lookalikes_untouched() {
        let a = set(&["110.1.1.0/24", "10.1.10.0/24", "10.1.1.0/24"]);
        let e = set(&["10.1.1.0/24"]);
        assert_eq!(
            strings(&a.subtract(&e).unwrap()),
            vec!["10.1.10.0/24", "110.1.1.0/24"]
        );
    }

    #[test]
    fn test_subtract_disjoint_passthrough() {
        let a = set(&["203.0.113.0/24"]);
        let e = set(&["198.51.100.0/24"]);
        assert_eq!(a.subtract(&e).unwrap(), a);
    }

    #[test]
    fn test_idempotence() {
        let a = set(&["10.0.0.0/8", "192.0.2.7/32", "198.51.100.0/23"]);
        assert_eq!(a.union(&a).unwrap(), a);
        assert!(a.subtract(&a).unwrap().is_empty());
    }

    #[test]
    fn test_union_is_order_independent() {
        let a = set(&["10.0.0.0/25", "172.16.0.0/12"]);
        let b = set(&["10.0.0.128/25", "8.8.8.8/32"]);
        assert_eq!(a.union(&b).unwrap(), b.union(&a).unwrap());
    }

    #[test]
    fn test_mixed_families_rejected() {
        let v4 = set(&["10.0.0.0/8"]);
        let v6 = set(&["2001:db8::/32"]);
        assert!(matches!(
            v4.union(&v6),
            Err(RtbhError::InvalidOperand(_))
        ));
        assert!(matches!(
            v4.subtract(&v6),
            Err(RtbhError::InvalidOperand(_))
        ));
        let mixed = NetworkSet::from_blocks(vec![
            "10.0.0.0/8".parse::<IpNet>().unwrap(),
            "2001:db8::/32".parse::<IpNet>().unwrap(),
        ]);
        assert!(matches!(mixed, Err(RtbhError::InvalidOperand(_))));
    }

    #[test]
    fn test_empty_set_combines_with_any_family() {
        let v6 = set(&["2001:db8::/32"]);
        let empty = NetworkSet::new();
        assert_eq!(empty.union(&v6).unwrap(), v6);
        assert_eq!(v6.subtract(&empty).unwrap(), v6);
        assert!(empty.subtract(&v6).unwrap().is_empty());
    }

    #[test]
    fn test_whole_ipv4_space() {
        let s = set(&["0.0.0.0/1", "128.0.0.0/1"]);
        assert_eq!(strings(&s), vec!["0.0.0.0/0"]);
        assert_eq!(s.address_count(), 1u128 << 32);
        let rest = s.subtract(&set(&["0.0.0.0/1"])).unwrap();
        assert_eq!(strings(&rest), vec!["128.0.0.0/1"]);
    }

    #[test]
    fn test_whole_ipv6_space_does_not_overflow() {
        let s = set(&["::/0", "2001:db8::/32"]);
        assert_eq!(strings(&s), vec!["::/0"]);
        assert_eq!(s.address_count(), u128::MAX);
        let rest = s.subtract(&set(&["8000::/1"])).unwrap();
        assert_eq!(strings(&rest), vec!["::/1"]);
    }

    #[test]
    fn test_ipv6_subtract() {
        let a = set(&["2001:db8::/32"]);
        let e = set(&["2001:db8:8000::/33"]);
        assert_eq!(strings(&a.subtract(&e).unwrap()), vec!["2001:db8::/33"]);
    }

    #[test]
    fn test_contains_addr() {
        let s = set(&["10.0.0.0/24", "192.0.2.0/25"]);
        assert!(s.contains_addr(&"10.0.0.255".parse().unwrap()));
        assert!(s.contains_addr(&"192.0.2.127".parse().unwrap()));
        assert!(!s.contains_addr(&"192.0.2.128".parse().unwrap()));
        assert!(!s.contains_addr(&"9.255.255.255".parse().unwrap()));
        assert!(!s.contains_addr(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_covers_spans_adjacent_blocks() {
        let s = set(&["10.0.1.0/24", "10.0.2.0/24"]);
        assert!(s.covers(&"10.0.1.128/25".parse().unwrap()));
        assert!(s.covers(&"10.0.1.255/32".parse().unwrap()));
        assert!(!s.covers(&"10.0.0.0/22".parse().unwrap()));
    }

    #[test]
    fn test_dual_stack_split_and_ops() {
        let blocks: Vec<IpNet> = vec![
            "2001:db8::/33".parse().unwrap(),
            "10.0.0.0/25".parse().unwrap(),
            "2001:db8:8000::/33".parse().unwrap(),
            "10.0.0.128/25".parse().unwrap(),
        ];
        let ds = DualStackSet::from_blocks(blocks).unwrap();
        let all: Vec<String> = ds.iter().map(|n| n.to_string()).collect();
        assert_eq!(all, vec!["10.0.0.0/24", "2001:db8::/32"]);

        let excl = DualStackSet::from_blocks(vec!["10.0.0.0/25".parse().unwrap()]).unwrap();
        let rest = ds.subtract(&excl).unwrap();
        assert_eq!(strings(rest.v4()), vec!["10.0.0.128/25"]);
        assert_eq!(rest.v6(), ds.v6());
        assert!(rest.contains_addr(&"2001:db8::1".parse().unwrap()));
    }
}
