use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// The rights a caller may request on an entry or attribute. The low byte
    /// matches the rights a rule may grant. `WRITE_ADD` and `WRITE_DEL` are
    /// only ever requested by the engine itself when it checks individual
    /// values of a modification.
    #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
    pub struct AccessRights: u32 {
        const COMPARE = 0x0001;
        const SEARCH = 0x0002;
        const READ = 0x0004;
        const WRITE = 0x0008;
        const DELETE = 0x0010;
        const ADD = 0x0020;
        const SELF = 0x0040;
        const PROXY = 0x0080;
        const WRITE_ADD = 0x0200;
        const WRITE_DEL = 0x0400;

        const ALL = Self::COMPARE.bits()
            | Self::SEARCH.bits()
            | Self::READ.bits()
            | Self::WRITE.bits()
            | Self::DELETE.bits()
            | Self::ADD.bits()
            | Self::SELF.bits();
        const READ_OR_SEARCH = Self::READ.bits() | Self::SEARCH.bits();
    }
}

impl AccessRights {
    /// The single name used to report this request. When several bits are
    /// set the most specific wins, in the order the protocol checks them.
    pub fn describe(self) -> Option<&'static str> {
        if self.contains(AccessRights::COMPARE) {
            Some("compare")
        } else if self.contains(AccessRights::SEARCH) {
            Some("search")
        } else if self.contains(AccessRights::READ) {
            Some("read")
        } else if self.contains(AccessRights::DELETE) {
            Some("delete")
        } else if self.contains(AccessRights::ADD) {
            Some("add")
        } else if self.contains(AccessRights::WRITE | AccessRights::SELF) {
            Some("selfwrite")
        } else if self.contains(AccessRights::WRITE) {
            Some("write")
        } else if self.contains(AccessRights::PROXY) {
            Some("proxy")
        } else {
            None
        }
    }

    pub fn is_read_or_search(self) -> bool {
        self.intersects(AccessRights::READ_OR_SEARCH)
    }

    /// A per-value write is still a write when matched against rule rights.
    pub fn normalise(self) -> Self {
        if self.intersects(AccessRights::WRITE_ADD | AccessRights::WRITE_DEL) {
            self | AccessRights::WRITE
        } else {
            self
        }
    }
}

impl fmt::Display for AccessRights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe().unwrap_or("unknown"))
    }
}

/// The LDAP result codes a decision can produce.
#[derive(
    Serialize,
    Deserialize,
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    IntoPrimitive,
    TryFromPrimitive,
)]
#[serde(rename_all = "lowercase")]
#[repr(u32)]
pub enum AccessResultCode {
    Success = 0,
    OperationsError = 1,
    InvalidAttributeSyntax = 21,
    InsufficientAccessRights = 50,
    UnwillingToPerform = 53,
}

impl AccessResultCode {
    pub fn is_success(self) -> bool {
        self == AccessResultCode::Success
    }
}

impl fmt::Display for AccessResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessResultCode::Success => "success",
            AccessResultCode::OperationsError => "operations error",
            AccessResultCode::InvalidAttributeSyntax => "invalid attribute syntax",
            AccessResultCode::InsufficientAccessRights => "insufficient access rights",
            AccessResultCode::UnwillingToPerform => "unwilling to perform",
        };
        write!(f, "{} ({})", s, u32::from(*self))
    }
}
