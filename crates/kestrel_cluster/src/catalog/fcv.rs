//! Feature compatibility version.
//!
//! Changing the FCV is two-phase: the catalog first records the transition,
//! every shard then adopts the target, and only then is the new version
//! marked stable. Operations gated on a version consult the stable value.

use std::fmt;

use serde::{Deserialize, Serialize};

use kestrel_common::error::ShardingError;
use kestrel_common::{KestrelError, KestrelResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeatureVersion {
    pub major: u16,
    pub minor: u16,
}

impl FeatureVersion {
    pub const V4_4: FeatureVersion = FeatureVersion::new(4, 4);
    pub const V5_0: FeatureVersion = FeatureVersion::new(5, 0);
    pub const V6_0: FeatureVersion = FeatureVersion::new(6, 0);
    pub const LATEST: FeatureVersion = Self::V6_0;
    pub const SUPPORTED: [FeatureVersion; 3] = [Self::V4_4, Self::V5_0, Self::V6_0];

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    pub fn parse(s: &str) -> KestrelResult<Self> {
        let (major, minor) = s
            .split_once('.')
            .ok_or_else(|| KestrelError::BadValue(format!("invalid feature version '{s}'")))?;
        let v = Self::new(
            major
                .parse()
                .map_err(|_| KestrelError::BadValue(format!("invalid feature version '{s}'")))?,
            minor
                .parse()
                .map_err(|_| KestrelError::BadValue(format!("invalid feature version '{s}'")))?,
        );
        if !Self::SUPPORTED.contains(&v) {
            return Err(KestrelError::BadValue(format!("unsupported feature version {v}")));
        }
        Ok(v)
    }
}

impl fmt::Display for FeatureVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FcvState {
    Stable(FeatureVersion),
    Upgrading { from: FeatureVersion, to: FeatureVersion },
    Downgrading { from: FeatureVersion, to: FeatureVersion },
}

impl Default for FcvState {
    fn default() -> Self {
        FcvState::Stable(FeatureVersion::LATEST)
    }
}

impl FcvState {
    /// The version whose features may be used: the lower one while a
    /// transition is in flight.
    pub fn effective(&self) -> FeatureVersion {
        match *self {
            FcvState::Stable(v) => v,
            FcvState::Upgrading { from, to } | FcvState::Downgrading { from, to } => from.min(to),
        }
    }

    pub fn is_transitioning(&self) -> bool {
        !matches!(self, FcvState::Stable(_))
    }

    /// Resharding needs a stable FCV of at least 5.0.
    pub fn check_resharding_allowed(&self) -> KestrelResult<()> {
        match *self {
            FcvState::Stable(v) if v >= FeatureVersion::V5_0 => Ok(()),
            FcvState::Stable(v) => Err(ShardingError::FcvIncompatible(format!(
                "resharding requires FCV 5.0 or newer, cluster is at {v}"
            ))
            .into()),
            other => Err(ShardingError::FcvIncompatible(format!(
                "resharding is not allowed while the FCV is changing ({other:?})"
            ))
            .into()),
        }
    }

    /// First phase: record the transition. Resuming an interrupted change to
    /// the same target is allowed.
    pub fn begin_change(&self, target: FeatureVersion) -> KestrelResult<FcvState> {
        match *self {
            FcvState::Stable(v) if v == target => Ok(*self),
            FcvState::Stable(v) if v < target => Ok(FcvState::Upgrading { from: v, to: target }),
            FcvState::Stable(v) => Ok(FcvState::Downgrading { from: v, to: target }),
            FcvState::Upgrading { to, .. } | FcvState::Downgrading { to, .. } if to == target => {
                Ok(*self)
            }
            other => Err(ShardingError::ConflictingOperationInProgress(format!(
                "FCV change already in progress ({other:?})"
            ))
            .into()),
        }
    }

    /// Second phase: mark the target stable.
    pub fn complete_change(&self, target: FeatureVersion) -> KestrelResult<FcvState> {
        match *self {
            FcvState::Stable(v) if v == target => Ok(*self),
            FcvState::Upgrading { to, .. } | FcvState::Downgrading { to, .. } if to == target => {
                Ok(FcvState::Stable(target))
            }
            other => Err(KestrelError::IllegalOperation(format!(
                "cannot complete FCV change to {target} from {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_two_phase_downgrade() {
        let s = FcvState::Stable(FeatureVersion::V6_0);
        let mid = s.begin_change(FeatureVersion::V4_4).unwrap();
        assert!(mid.is_transitioning());
        assert_eq!(mid.effective(), FeatureVersion::V4_4);
        assert_eq!(mid.begin_change(FeatureVersion::V4_4).unwrap(), mid);
        assert!(mid.begin_change(FeatureVersion::V5_0).is_err());
        let done = mid.complete_change(FeatureVersion::V4_4).unwrap();
        assert_eq!(done, FcvState::Stable(FeatureVersion::V4_4));
    }

    #[test]
    fn test_resharding_gate() {
        assert!(FcvState::Stable(FeatureVersion::V5_0).check_resharding_allowed().is_ok());
        assert!(FcvState::Stable(FeatureVersion::V4_4).check_resharding_allowed().is_err());
        let upgrading = FcvState::Upgrading {
            from: FeatureVersion::V5_0,
            to: FeatureVersion::V6_0,
        };
        assert!(upgrading.check_resharding_allowed().is_err());
    }

    #[test]
    fn test_parse() {
        assert_eq!(FeatureVersion::parse("5.0").unwrap(), FeatureVersion::V5_0);
        assert!(FeatureVersion::parse("3.6").is_err());
        assert!(FeatureVersion::parse("five").is_err());
    }
}
