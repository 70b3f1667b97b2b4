/*
 *  Copyright (C) 2025  Markus Elias Gerber
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  You should have received a copy of the GNU General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use core::str::FromStr;

use crate::{
    error::{Result, VidmemError},
    phys_addr::PhysAddr,
};

pub const DEFAULT_MEMORY_BASE: PhysAddr = PhysAddr::new(0x4000_0000);
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024 * 1024;

/// A reserved physical region that is served by its own region pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    pub base: PhysAddr,
    pub size: usize,
}

pub struct VidmemConfig {
    /// Start of the physical memory window served by the page backend
    pub memory_base: PhysAddr,

    /// Size of the physical memory window in bytes
    pub memory_size: usize,

    /// Reserved regions inside of the memory window.
    /// The index of a region is its region id.
    pub reserved_regions: Vec<RegionConfig>,

    /// Clear every buffer before it is handed out
    pub zero_on_alloc: bool,
}

impl Default for VidmemConfig {
    fn default() -> Self {
        VidmemConfig {
            memory_base: DEFAULT_MEMORY_BASE,
            memory_size: DEFAULT_MEMORY_SIZE,
            reserved_regions: Vec::new(),
            zero_on_alloc: false,
        }
    }
}

impl RegionConfig {
    pub fn new(base: PhysAddr, size: usize) -> Self {
        RegionConfig { base, size }
    }

    pub fn end(&self) -> Option<PhysAddr> {
        self.base.checked_add(self.size)
    }
}

impl VidmemConfig {
    pub fn with_region(mut self, region: RegionConfig) -> Self {
        self.reserved_regions.push(region);
        self
    }

    /// Checks that the memory window and all regions are usable with `page_size`
    pub fn validate(&self, page_size: usize) -> Result<()> {
        if self.memory_size == 0 {
            return Err(VidmemError::InvalidArgument("memory window must not be empty"));
        }
        if !self.memory_base.is_aligned(page_size) || self.memory_size % page_size != 0 {
            return Err(VidmemError::InvalidArgument(
                "memory window has to be page aligned",
            ));
        }
        let memory_end = self
            .memory_base
            .checked_add(self.memory_size)
            .ok_or(VidmemError::InvalidArgument("memory window overflows"))?;

        for (id, region) in self.reserved_regions.iter().enumerate() {
            if region.size == 0 {
                return Err(VidmemError::InvalidRegion(format!("region {} is empty", id)));
            }
            if !region.base.is_aligned(page_size) || region.size % page_size != 0 {
                return Err(VidmemError::InvalidRegion(format!(
                    "region {} ({}, {:#x} bytes) is not page aligned",
                    id, region.base, region.size
                )));
            }

            let end = region.end().ok_or_else(|| {
                VidmemError::InvalidRegion(format!("region {} overflows", id))
            })?;
            if region.base < self.memory_base || end > memory_end {
                return Err(VidmemError::InvalidRegion(format!(
                    "region {} [{}, {}) is outside of the memory window [{}, {})",
                    id, region.base, end, self.memory_base, memory_end
                )));
            }

            for (other_id, other) in self.reserved_regions.iter().enumerate().skip(id + 1) {
                let other_end = other.end().unwrap_or(PhysAddr(u64::MAX));
                if !(end <= other.base || other_end <= region.base) {
                    return Err(VidmemError::InvalidRegion(format!(
                        "region {} overlaps region {}",
                        id, other_id
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Parses a number with an optional `0x` prefix, `_` separators and a `K`/`M`/`G` suffix
fn parse_size(text: &str) -> Option<u64> {
    let text = text.trim().replace('_', "");
    let (digits, shift) = match text.chars().last()? {
        'k' | 'K' => (&text[..text.len() - 1], 10),
        'm' | 'M' => (&text[..text.len() - 1], 20),
        'g' | 'G' => (&text[..text.len() - 1], 30),
        _ => (&text[..], 0),
    };

    let value = match digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<u64>().ok()?,
    };

    value.checked_mul(1u64 << shift)
}

impl FromStr for RegionConfig {
    type Err = VidmemError;

    /// Parses the `size@base` notation, e.g. `16M@0x7000_0000`
    fn from_str(s: &str) -> Result<Self> {
        let (size, base) = s
            .split_once('@')
            .ok_or(VidmemError::InvalidArgument("expected region as size@base"))?;

        let size = parse_size(size)
            .ok_or(VidmemError::InvalidArgument("could not parse region size"))?;
        let base = parse_size(base)
            .ok_or(VidmemError::InvalidArgument("could not parse region base"))?;

        Ok(RegionConfig {
            base: PhysAddr(base),
            size: usize::try_from(size)
                .map_err(|_| VidmemError::InvalidArgument("region size too big"))?,
        })
    }
}

#[cfg(test)]
mod test {
    use super::{RegionConfig, VidmemConfig};
    use crate::{phys_addr::PhysAddr, VidmemError};

    #[test]
    fn test_parse_region() {
        let region: RegionConfig = "16M@0x7000_0000".parse().unwrap();
        assert_eq!(region, RegionConfig::new(PhysAddr(0x7000_0000), 16 << 20));

        let region: RegionConfig = "4096@1073741824".parse().unwrap();
        assert_eq!(region, RegionConfig::new(PhysAddr(0x4000_0000), 4096));

        let region: RegionConfig = "0x10k@0X1G".parse().unwrap();
        assert_eq!(region, RegionConfig::new(PhysAddr(1 << 30), 0x10 << 10));

        for invalid in ["", "16M", "@0x1000", "16M@", "abc@0x1000", "1M@0xzz"] {
            assert!(invalid.parse::<RegionConfig>().is_err(), "{:?} should not parse", invalid);
        }
    }

    #[test]
    fn test_validate_config() {
        const PAGE: usize = 4096;

        let config = VidmemConfig::default();
        config.validate(PAGE).unwrap();

        let base = config.memory_base;
        let config = VidmemConfig::default()
            .with_region(RegionConfig::new(base, 16 * PAGE))
            .with_region(RegionConfig::new(base + 16 * PAGE, 16 * PAGE));
        config.validate(PAGE).unwrap();

        // overlapping
        let config = VidmemConfig::default()
            .with_region(RegionConfig::new(base, 16 * PAGE))
            .with_region(RegionConfig::new(base + 8 * PAGE, 16 * PAGE));
        assert!(matches!(config.validate(PAGE), Err(VidmemError::InvalidRegion(_))));

        // outside of the window
        let config = VidmemConfig::default().with_region(RegionConfig::new(PhysAddr(0), PAGE));
        assert!(matches!(config.validate(PAGE), Err(VidmemError::InvalidRegion(_))));

        // empty
        let config = VidmemConfig::default().with_region(RegionConfig::new(base, 0));
        assert!(matches!(config.validate(PAGE), Err(VidmemError::InvalidRegion(_))));

        // unaligned
        let config = VidmemConfig::default().with_region(RegionConfig::new(base + 1, PAGE));
        assert!(matches!(config.validate(PAGE), Err(VidmemError::InvalidRegion(_))));

        let config = VidmemConfig {
            memory_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(PAGE), Err(VidmemError::InvalidArgument(_))));
    }
}
