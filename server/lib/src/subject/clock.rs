use time::Weekday;

use super::{SubjectContext, Truth};
use crate::prelude::*;
use crate::rule::Comparator;

/// `timeofday>="0800"`: compare the current time, as HHMM, with the value.
pub(super) fn evaluate_timeofday(ctx: &SubjectContext<'_>, op: Comparator, value: &str) -> Truth {
    let v = value.trim();
    let Ok(wanted) = v.parse::<u16>() else {
        subject_error!(%value, "timeofday value is not a number");
        return Truth::Undefined;
    };
    if v.len() != 4 || wanted % 100 > 59 || wanted > 2359 {
        subject_error!(%value, "timeofday value is not a valid HHMM time");
        return Truth::Undefined;
    }
    let now = u16::from(ctx.now.hour()) * 100 + u16::from(ctx.now.minute());
    Truth::from_bool(op.compare(now, wanted))
}

/// `dayofweek="mon,tue,wed"`.
pub(super) fn evaluate_dayofweek(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    let today = ctx.now.weekday();
    let mut matched = false;
    for day in value.split(',').map(|d| d.trim().to_lowercase()) {
        let Some(d) = parse_day(&day) else {
            subject_error!(%value, "dayofweek value holds an unknown day");
            return Truth::Undefined;
        };
        matched |= d == today;
    }
    Truth::from_bool(matched)
}

fn parse_day(day: &str) -> Option<Weekday> {
    match day {
        "sun" => Some(Weekday::Sunday),
        "mon" => Some(Weekday::Monday),
        "tue" => Some(Weekday::Tuesday),
        "wed" => Some(Weekday::Wednesday),
        "thu" => Some(Weekday::Thursday),
        "fri" => Some(Weekday::Friday),
        "sat" => Some(Weekday::Saturday),
        _ => None,
    }
}
