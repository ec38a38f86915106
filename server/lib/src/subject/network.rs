//! `ip` and `dns` subjects.

use std::net::{IpAddr, Ipv4Addr};

use super::{SubjectContext, Truth};
use crate::filter::SubstringPattern;
use crate::prelude::*;

/// `ip="10.0.0.*, 192.168.1.0+255.255.255.0, 2001:db8::*"`. Patterns are
/// either wildcards over the textual address or an IPv4 network and mask.
pub(super) fn evaluate_ip(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    let Some(ip) = ctx.principal.client_ip else {
        return Truth::Undefined;
    };
    let text = ip.to_string();
    let mut any_valid = false;
    for pattern in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match pattern.split_once('+') {
            Some((net, mask)) => {
                let (Ok(net), Ok(mask)) = (
                    net.trim().parse::<Ipv4Addr>(),
                    mask.trim().parse::<Ipv4Addr>(),
                ) else {
                    subject_error!(%pattern, "invalid ip network pattern");
                    continue;
                };
                any_valid = true;
                if let IpAddr::V4(v4) = ip {
                    let m = u32::from(mask);
                    if u32::from(v4) & m == u32::from(net) & m {
                        return Truth::True;
                    }
                }
            }
            None => match SubstringPattern::from_wildcard(pattern) {
                Ok(p) => {
                    any_valid = true;
                    if p.is_match(&text) {
                        return Truth::True;
                    }
                }
                Err(_) => subject_error!(%pattern, "invalid ip pattern"),
            },
        }
    }
    if any_valid {
        Truth::False
    } else {
        Truth::Undefined
    }
}

/// `dns="*.example.com, gw.example.net"`.
pub(super) fn evaluate_dns(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    let Some(name) = ctx.principal.client_dns.as_deref() else {
        return Truth::Undefined;
    };
    let name = name.trim_end_matches('.').to_lowercase();
    let matched = value
        .split(',')
        .map(|p| p.trim().trim_end_matches('.').to_lowercase())
        .filter(|p| !p.is_empty())
        .any(|p| match p.strip_prefix('*') {
            Some(suffix) => name.ends_with(suffix) && name.len() > suffix.len(),
            None => name == p,
        });
    Truth::from_bool(matched)
}
