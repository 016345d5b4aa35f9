use std::{fmt, ops::RangeInclusive, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::SandcoreError;

use super::{DEFAULT_FALLBACK_PORT_END, DEFAULT_FALLBACK_PORT_START};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// An inclusive range of TCP ports, written as `start-end`.
///
/// ## Examples
///
/// ```
/// use sandcore::config::PortRange;
///
/// let range = "40000-40010".parse::<PortRange>().unwrap();
/// assert_eq!(range.len(), 11);
/// assert!(range.contains(40010));
/// assert_eq!(range.to_string(), "40000-40010");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    start: u16,
    end: u16,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl PortRange {
    /// Creates a new range. `start` must not exceed `end` and port 0 is not allowed.
    pub fn new(start: u16, end: u16) -> Result<Self, SandcoreError> {
        if start == 0 || start > end {
            return Err(SandcoreError::InvalidPortRange(format!("{start}-{end}")));
        }

        Ok(Self { start, end })
    }

    /// The first port of the range.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// The last port of the range.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// The number of ports in the range.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Whether `port` falls inside the range.
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Iterates over the ports of the range.
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.start..=self.end
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: DEFAULT_FALLBACK_PORT_START,
            end: DEFAULT_FALLBACK_PORT_END,
        }
    }
}

impl FromStr for PortRange {
    type Err = SandcoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SandcoreError::InvalidPortRange(s.to_string());
        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let start = start.trim().parse::<u16>().map_err(|_| invalid())?;
        let end = end.trim().parse::<u16>().map_err(|_| invalid())?;

        Self::new(start, end)
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl Serialize for PortRange {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PortRange {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_range_from_str() {
        let range: PortRange = "33000-33999".parse().unwrap();
        assert_eq!(range.start(), 33000);
        assert_eq!(range.end(), 33999);
        assert_eq!(range.len(), 1000);

        let single: PortRange = " 8080 - 8080 ".parse().unwrap();
        assert_eq!(single.len(), 1);

        for invalid in ["", "33000", "33999-33000", "0-10", "a-b", "1-70000"] {
            assert!(
                matches!(
                    invalid.parse::<PortRange>(),
                    Err(SandcoreError::InvalidPortRange(_))
                ),
                "{invalid:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_port_range_contains_and_full_range() {
        let range = PortRange::new(1, u16::MAX).unwrap();
        assert_eq!(range.len(), 65535);
        assert!(range.contains(u16::MAX));
        assert!(!range.contains(0));
    }

    #[test]
    fn test_port_range_serde() {
        #[derive(Deserialize, Serialize)]
        struct Wrapper {
            range: PortRange,
        }

        let wrapper: Wrapper = toml::from_str(r#"range = "40000-40010""#).unwrap();
        assert_eq!(wrapper.range, PortRange::new(40000, 40010).unwrap());
        assert_eq!(
            toml::to_string(&wrapper).unwrap().trim(),
            r#"range = "40000-40010""#
        );
        assert!(toml::from_str::<Wrapper>(r#"range = "nope""#).is_err());
    }
}
