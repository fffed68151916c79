//! Versionbits soft-fork deployment schedule.
//!
//! Each deployment signals on one version bit and walks
//! `Defined -> Started -> LockedIn -> Active` (or `-> Failed` on timeout)
//! across confirmation windows. The threshold-state bookkeeping itself
//! lives in the chainstate crate; this module only defines the schedule.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum DeploymentIndex {
    TestDummy = 0,
    Csv = 1,
    Segwit = 2,
}

pub const MAX_DEPLOYMENTS: usize = 3;

pub const ALL_DEPLOYMENTS: [DeploymentIndex; MAX_DEPLOYMENTS] = [
    DeploymentIndex::TestDummy,
    DeploymentIndex::Csv,
    DeploymentIndex::Segwit,
];

impl DeploymentIndex {
    pub const fn as_usize(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TestDummy => "testdummy",
            Self::Csv => "csv",
            Self::Segwit => "segwit",
        }
    }
}

/// Per-network activation parameters for one deployment.
#[derive(Clone, Copy, Debug)]
pub struct Deployment {
    /// Version bit the deployment signals on (0..=28).
    pub bit: u8,
    /// Unix time after which signaling counts; `ALWAYS_ACTIVE` skips voting.
    pub start_time: i64,
    /// Unix time after which a still-pending deployment fails.
    pub timeout: i64,
}

impl Deployment {
    pub const ALWAYS_ACTIVE: i64 = -1;
    pub const NEVER_ACTIVE: i64 = i64::MAX;

    pub const fn always(bit: u8) -> Self {
        Self {
            bit,
            start_time: Self::ALWAYS_ACTIVE,
            timeout: Self::ALWAYS_ACTIVE,
        }
    }

    pub fn mask(&self) -> u32 {
        1u32 << self.bit
    }
}

/// State of one deployment at one confirmation-window boundary.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ThresholdState {
    Defined,
    Started,
    LockedIn,
    Active,
    Failed,
}

impl ThresholdState {
    /// Active and Failed never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Active | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(ThresholdState::Active.is_terminal());
        assert!(ThresholdState::Failed.is_terminal());
        assert!(!ThresholdState::Defined.is_terminal());
        assert!(!ThresholdState::Started.is_terminal());
        assert!(!ThresholdState::LockedIn.is_terminal());
    }

    #[test]
    fn deployment_bit_mask() {
        let deployment = Deployment {
            bit: 1,
            start_time: 0,
            timeout: i64::MAX,
        };
        assert_eq!(deployment.mask(), 0b10);
    }
}
