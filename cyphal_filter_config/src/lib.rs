//!
//! CAN acceptance filter optimization.
//!
//! A CAN controller typically implements only a handful of hardware acceptance filters, far
//! fewer than the number of distinct subjects/services a node subscribes to. [`optimize`]
//! greedily merges the filter configurations with the least specificity loss until the set fits
//! within the hardware budget.
//!

#![no_std]

/// Whether a filter configuration is pinned to base (11-bit) or extended (29-bit) identifiers,
/// or accepts either.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Format {
    Base,
    Extended,
}

impl Format {
    const fn identifier_bit_length(self) -> u32 {
        match self {
            Format::Base => 11,
            Format::Extended => 29,
        }
    }
}

/// A single CAN acceptance filter: an identifier/mask pair plus an optional format pin.
///
/// A frame's identifier `id` is accepted iff `id & mask == identifier & mask` and, when `format`
/// is set, the frame's format matches.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FilterConfig {
    identifier: u32,
    mask: u32,
    format: Option<Format>,
}

/// An identifier or mask value did not fit within its format's bit width.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct InvalidFilterConfig;

impl FilterConfig {
    /// The bit width this configuration is validated against: the pinned format's width, or 29
    /// (extended) when the format is left ambivalent.
    fn identifier_bit_length(&self) -> u32 {
        self.format
            .map(Format::identifier_bit_length)
            .unwrap_or(29)
    }

    pub fn new(identifier: u32, mask: u32, format: Option<Format>) -> Result<Self, InvalidFilterConfig> {
        let config = FilterConfig {
            identifier,
            mask,
            format,
        };
        let max = (1u64 << config.identifier_bit_length()) - 1;
        if u64::from(identifier) > max || u64::from(mask) > max {
            return Err(InvalidFilterConfig);
        }
        Ok(config)
    }

    /// A filter that accepts every frame of the given format (or every frame of any format, if
    /// `format` is `None`).
    pub fn new_promiscuous(format: Option<Format>) -> Self {
        FilterConfig {
            identifier: 0,
            mask: 0,
            format,
        }
    }

    pub fn identifier(&self) -> u32 {
        self.identifier
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn format(&self) -> Option<Format> {
        self.format
    }

    /// The number of identifier bits this filter pins down. Ambivalent (format-less) filters are
    /// penalized by subtracting their bit width, which discourages the optimizer from ever
    /// merging a base-only filter with an extended-only one: doing so produces a configuration
    /// many CAN controllers cannot express as a single hardware filter.
    pub fn rank(&self) -> i64 {
        let mask_mask = (1u64 << self.identifier_bit_length()) - 1;
        let mut rank = (u64::from(self.mask) & mask_mask).count_ones() as i64;
        if self.format.is_none() {
            rank -= i64::from(self.identifier_bit_length());
        }
        rank
    }

    /// Produces a new filter whose accepted set is a superset of the union of `self`'s and
    /// `other`'s accepted sets. The merged mask keeps only the bits both filters already agreed
    /// on (same mask bit and same identifier bit); the format is kept only if both agree on it.
    pub fn merge(&self, other: &FilterConfig) -> FilterConfig {
        let mask = self.mask & other.mask & !(self.identifier ^ other.identifier);
        let identifier = self.identifier & mask;
        let format = if self.format == other.format {
            self.format
        } else {
            None
        };
        FilterConfig {
            identifier,
            mask,
            format,
        }
    }
}

/// Greedily merges `configurations` down to at most `target` entries.
///
/// At each step, every ordered pair is tentatively merged and the merge with the highest
/// resulting rank (least loss of specificity) is committed; this repeats until the set is small
/// enough. Time complexity is `O(K!)` in the number of input configurations, acceptable only
/// because `K` is small (dozens at most) in practice. Returns the input unchanged if it is
/// already at or below `target`.
pub fn optimize(configurations: &[FilterConfig], target: usize) -> heapless::Vec<FilterConfig, 64> {
    let mut current: heapless::Vec<FilterConfig, 64> = heapless::Vec::new();
    for config in configurations {
        let _ = current.push(*config);
    }
    if target == 0 || current.len() <= target {
        return current;
    }

    while current.len() > target {
        let mut best: Option<(usize, usize, FilterConfig, i64)> = None;
        for (i, a) in current.iter().enumerate() {
            for (j, b) in current.iter().enumerate() {
                if i == j {
                    continue;
                }
                let merged = a.merge(b);
                let rank = merged.rank();
                if best.as_ref().map(|(_, _, _, r)| rank > *r).unwrap_or(true) {
                    best = Some((i, j, merged, rank));
                }
            }
        }
        let (replace, remove, merged, _) = best.expect("current.len() > 1 while target < len");
        current[replace] = merged;
        current.swap_remove(remove);
    }
    current
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_values() {
        assert!(FilterConfig::new(0, 1 << 11, Some(Format::Base)).is_err());
        assert!(FilterConfig::new(1 << 29, 0, Some(Format::Extended)).is_err());
        assert!(FilterConfig::new(1 << 29, 0, None).is_err());
    }

    #[test]
    fn ambivalent_filter_has_worst_rank() {
        let config = FilterConfig::new(123456, 0, None).unwrap();
        assert_eq!(config.rank(), -29);
        let config = FilterConfig::new(123456, 0b110, None).unwrap();
        assert_eq!(config.rank(), -27);
    }

    #[test]
    fn pinned_base_filter_rank() {
        let config = FilterConfig::new(1234, 0b110, Some(Format::Base)).unwrap();
        assert_eq!(config.rank(), 2);
    }

    #[test]
    fn merging_different_formats_gives_ambivalent_result() {
        let a = FilterConfig::new(0b111, 0b111, Some(Format::Extended)).unwrap();
        let b = FilterConfig::new(0b111, 0b111, Some(Format::Base)).unwrap();
        let merged = a.merge(&b);
        assert_eq!(merged.format(), None);
        assert_eq!(merged.rank(), -29 + 3);
    }

    #[test]
    fn promiscuous_accepts_everything() {
        let config = FilterConfig::new_promiscuous(None);
        assert_eq!(config.identifier(), 0);
        assert_eq!(config.mask(), 0);
    }

    #[test]
    fn optimize_reduces_to_target() {
        let configs = [
            FilterConfig::new(0b0000, 0b1111, Some(Format::Base)).unwrap(),
            FilterConfig::new(0b0001, 0b1111, Some(Format::Base)).unwrap(),
            FilterConfig::new(0b0010, 0b1111, Some(Format::Base)).unwrap(),
            FilterConfig::new(0b0011, 0b1111, Some(Format::Base)).unwrap(),
        ];
        let result = optimize(&configs, 2);
        assert_eq!(result.len(), 2);
        for merged in &result {
            for original in &configs {
                assert_eq!(
                    merged.identifier() & merged.mask(),
                    original.identifier() & merged.mask(),
                    "merged filter must still accept every original identifier"
                );
            }
        }
    }

    #[test]
    fn optimize_is_a_noop_when_already_within_budget() {
        let configs = [FilterConfig::new_promiscuous(None)];
        let result = optimize(&configs, 4);
        assert_eq!(result.len(), 1);
    }
}
