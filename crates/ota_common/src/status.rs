//! HTTP status classification.

use std::fmt;

/// The three bands the pipeline distinguishes. Nothing else is inspected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusBand {
    /// 300-399: follow the `location` header
    Redirect,
    /// 200-299: proceed
    Success,
    /// Everything else: abandon the cycle
    Failure,
}

impl StatusBand {
    pub fn classify(status: u16) -> Self {
        match status {
            200..=299 => Self::Success,
            300..=399 => Self::Redirect,
            _ => Self::Failure,
        }
    }
}

impl fmt::Display for StatusBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redirect => write!(f, "redirect"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_edges() {
        assert_eq!(StatusBand::classify(199), StatusBand::Failure);
        assert_eq!(StatusBand::classify(200), StatusBand::Success);
        assert_eq!(StatusBand::classify(299), StatusBand::Success);
        assert_eq!(StatusBand::classify(300), StatusBand::Redirect);
        assert_eq!(StatusBand::classify(399), StatusBand::Redirect);
        assert_eq!(StatusBand::classify(400), StatusBand::Failure);
        assert_eq!(StatusBand::classify(0), StatusBand::Failure);
    }
}
