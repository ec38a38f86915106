use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::access::AccessResultCode;

/* ===== errors ===== */

/// Errors reported by the rule parser. The numeric codes are the values
/// administrators see in logs and in rejected modify responses.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleSyntaxError {
    Generic,
    TargetFilter,
    TargetAttrFilter,
    TargetFilterParse,
    Syntax,
    OneAclText,
    InvalidTarget,
    InvalidAuthMethod,
    InvalidAuthorization,
    IncorrectVersion,
    DontKnow,
}

impl RuleSyntaxError {
    pub fn code(self) -> i32 {
        match self {
            RuleSyntaxError::Generic => -1,
            RuleSyntaxError::TargetFilter => -2,
            RuleSyntaxError::TargetAttrFilter => -3,
            RuleSyntaxError::TargetFilterParse => -4,
            RuleSyntaxError::Syntax => -5,
            RuleSyntaxError::OneAclText => -6,
            RuleSyntaxError::InvalidTarget => -8,
            RuleSyntaxError::InvalidAuthMethod => -9,
            RuleSyntaxError::InvalidAuthorization => -10,
            RuleSyntaxError::IncorrectVersion => -11,
            RuleSyntaxError::DontKnow => -12,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            RuleSyntaxError::Generic => "an unknown error occurred",
            RuleSyntaxError::TargetFilter => "syntax error in the target",
            RuleSyntaxError::TargetAttrFilter => "syntax error in the targetattrfilters",
            RuleSyntaxError::TargetFilterParse => "syntax error in the targetfilter",
            RuleSyntaxError::Syntax => "syntax error in the rule body",
            RuleSyntaxError::OneAclText => "only one rule body is allowed per value",
            RuleSyntaxError::InvalidTarget => "the target is not a descendant of the rule entry",
            RuleSyntaxError::InvalidAuthMethod => "invalid or repeated authmethod",
            RuleSyntaxError::InvalidAuthorization => "invalid authorization rights",
            RuleSyntaxError::IncorrectVersion => "unsupported rule version",
            RuleSyntaxError::DontKnow => "the rule could not be evaluated",
        }
    }
}

impl Display for RuleSyntaxError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{} ({})", self.describe(), self.code())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "lowercase")]
pub enum OperationError {
    RuleSyntax(RuleSyntaxError),
    InvalidDn(String),
    InvalidFilter(String),
    InvalidLdapUrl(String),
    PoolExhausted,
    NoSuchEntry(String),
    Backend(String),
    InvalidState,
    InvalidConfig(String),
    Io(String),
}

impl PartialEq for OperationError {
    fn eq(&self, other: &Self) -> bool {
        // Only the kind matters to callers and tests.
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Display for OperationError {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let mut output = format!("{:?}", self)
            .split('(')
            .next()
            .unwrap_or("")
            .to_string();

        if let Some(msg) = self.message() {
            output += &format!(" - {}", msg);
        };
        f.write_str(&output)
    }
}

impl OperationError {
    /// Return the message associated with the error if there is one.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::RuleSyntax(e) => Some(e.to_string()),
            Self::InvalidDn(dn) => Some(format!("'{}' is not a valid distinguished name", dn)),
            Self::InvalidFilter(f) => Some(format!("'{}' is not a valid filter", f)),
            Self::InvalidLdapUrl(u) => Some(format!("'{}' is not a valid ldap url", u)),
            Self::PoolExhausted => Some("No evaluation context could be allocated.".into()),
            Self::NoSuchEntry(dn) => Some(format!("entry '{}' does not exist", dn)),
            Self::Backend(m) => Some(m.clone()),
            Self::InvalidState => None,
            Self::InvalidConfig(m) => Some(m.clone()),
            Self::Io(m) => Some(m.clone()),
        }
    }

    /// The result code an operation fails with when this error escapes a
    /// decision call.
    pub fn result_code(&self) -> AccessResultCode {
        match self {
            Self::RuleSyntax(_) => AccessResultCode::InvalidAttributeSyntax,
            _ => AccessResultCode::OperationsError,
        }
    }
}

impl From<RuleSyntaxError> for OperationError {
    fn from(e: RuleSyntaxError) -> Self {
        OperationError::RuleSyntax(e)
    }
}
