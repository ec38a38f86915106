//! The directory access control decision engine. This implements the
//! components that decide whether a bound principal may perform an operation
//! on an entry: the rule index, subject evaluation, group membership caching,
//! per operation evaluation contexts and the anonymous profile.

#![deny(warnings)]
#![recursion_limit = "512"]
#![warn(unused_extern_crates)]
// Enable some groups of clippy lints.
#![deny(clippy::suspicious)]
#![deny(clippy::perf)]
// Specific lints to enforce.
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]
#![deny(clippy::disallowed_types)]
#![deny(clippy::manual_let_else)]
#![allow(clippy::unreachable)]

#[macro_use]
extern crate tracing;

pub mod anonymous;
pub mod config;
pub mod context;
pub mod dn;
pub mod engine;
pub mod entry;
pub mod filter;
pub mod groupcache;
pub mod identity;
pub mod index;
pub mod rule;
pub mod subject;
#[cfg(test)]
pub mod testkit;

/// A prelude of imports that should be imported by all other modules to
/// help make imports cleaner.
pub mod prelude {
    pub use dsacl_proto::access::*;
    pub use dsacl_proto::constants::*;
    pub use dsacl_proto::internal::{OperationError, RuleSyntaxError};
    pub use sketching::{
        admin_debug, admin_error, admin_info, admin_warn, cache_trace, perf_trace, request_error,
        request_info, request_trace, request_warn, security_access, security_critical,
        security_debug, security_error, security_info, subject_error, subject_trace,
        subject_warn, tagged_event, EventTag,
    };

    pub use crate::dn::Dn;
    pub use crate::engine::{AccessOperation, DecisionEngine, DecisionReason};
    pub use crate::entry::{Directory, Entry, Modify, ModifyList, ModifyOp};
    pub use crate::identity::{
        AuthMethod, OperationInfo, OperationKind, Principal, PrincipalKind,
    };
}
