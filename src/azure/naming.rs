//! VM name parsing for `k8s-<pool>-<suffix>-<index>` names.

use std::fmt;

use crate::error::AkupError;

/// Pool identifier used in control-plane VM names.
pub const MASTER_POOL: &str = "master";

const NAME_PREFIX: &str = "k8s-";

/// Components of a cluster VM name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmName {
    pub pool: String,
    pub suffix: String,
    pub index: usize,
}

impl VmName {
    pub fn parse(name: &str) -> Result<Self, AkupError> {
        let invalid = || AkupError::InvalidVmName(name.to_string());

        let rest = name.strip_prefix(NAME_PREFIX).ok_or_else(invalid)?;
        let mut parts = rest.rsplitn(3, '-');
        let index = parts
            .next()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(invalid)?;
        let suffix = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;
        let pool = parts.next().filter(|s| !s.is_empty()).ok_or_else(invalid)?;

        Ok(Self {
            pool: pool.to_string(),
            suffix: suffix.to_string(),
            index,
        })
    }

    pub fn is_master(&self) -> bool {
        self.pool == MASTER_POOL
    }
}

impl fmt::Display for VmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}-{}-{}", NAME_PREFIX, self.pool, self.suffix, self.index)
    }
}
