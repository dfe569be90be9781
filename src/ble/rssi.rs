//! Signal strength classification.

use crate::error::{Error, Result};

/// Discrete link-quality tier derived from an RSSI reading in dBm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SignalTier {
    /// rssi <= -90
    Unusable,
    /// -90 < rssi <= -80
    Poor,
    /// -80 < rssi <= -67
    Fair,
    /// -67 < rssi <= -55
    Good,
    /// rssi > -55
    Excellent,
}

impl SignalTier {
    /// Classify an RSSI reading in dBm. Total over every `i16`.
    pub fn classify(rssi: i16) -> Self {
        match rssi {
            r if r > -55 => Self::Excellent,
            r if r > -67 => Self::Good,
            r if r > -80 => Self::Fair,
            r if r > -90 => Self::Poor,
            _ => Self::Unusable,
        }
    }

    /// Classify a reading that arrived as a floating point number.
    ///
    /// Only finite whole numbers inside the `i16` range are accepted;
    /// anything else is reported rather than mapped to a tier.
    pub fn classify_raw(value: f64) -> Result<Self> {
        if !value.is_finite()
            || value.fract() != 0.0
            || value < f64::from(i16::MIN)
            || value > f64::from(i16::MAX)
        {
            return Err(Error::UnrepresentableRssi {
                value: value.to_string(),
            });
        }
        Ok(Self::classify(value as i16))
    }

    /// Short symbol for compact displays.
    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Excellent => "🟢",
            Self::Good => "🟡",
            Self::Fair => "🟠",
            Self::Poor => "🔴",
            Self::Unusable => "❌",
        }
    }
}

impl std::fmt::Display for SignalTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Excellent => write!(f, "Excellent"),
            Self::Good => write!(f, "Good"),
            Self::Fair => write!(f, "Fair"),
            Self::Poor => write!(f, "Poor"),
            Self::Unusable => write!(f, "Unusable"),
        }
    }
}

/// Classify an RSSI reading in dBm.
#[inline]
pub fn classify(rssi: i16) -> SignalTier {
    SignalTier::classify(rssi)
}
