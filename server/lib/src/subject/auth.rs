use super::{SubjectContext, Truth};
use crate::prelude::*;
use crate::rule::Comparator;

pub(super) fn evaluate_authmethod(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    Truth::from_bool(ctx.principal.auth_method.satisfies(value))
}

/// `ssf>="128"`: compare the connection's security strength factor.
pub(super) fn evaluate_ssf(ctx: &SubjectContext<'_>, op: Comparator, value: &str) -> Truth {
    match value.trim().parse::<u32>() {
        Ok(wanted) => Truth::from_bool(op.compare(ctx.principal.ssf, wanted)),
        Err(_) => {
            subject_error!(%value, "ssf value is not a number");
            Truth::Undefined
        }
    }
}
