//! `groupdn` and `groupdnattr` subjects. Membership itself is answered by the
//! group cache.

use super::{split_values, SubjectContext, Truth};
use crate::dn;
use crate::filter::LdapUrl;
use crate::prelude::*;

pub(super) fn evaluate_groupdn(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    if ctx.principal.dn().is_none() {
        return Truth::False;
    }
    Truth::any(split_values(value).map(|raw| {
        let url = match LdapUrl::parse(raw) {
            Ok(u) => u,
            Err(e) => {
                subject_error!(?e, value = %raw, "groupdn value is not an ldap url");
                return Truth::False;
            }
        };
        if url.is_plain() {
            match url.base_dn() {
                Ok(group) => ctx.groups.is_member(ctx, &group),
                Err(_) => Truth::False,
            }
        } else {
            // A url with a filter names every group the search returns.
            match search_url(ctx, &url) {
                Ok(groups) => Truth::any(groups.iter().map(|g| ctx.groups.is_member(ctx, g.dn()))),
                Err(_) => Truth::Undefined,
            }
        }
    }))
}

pub(super) fn evaluate_groupdnattr(ctx: &SubjectContext<'_>, value: &str) -> Truth {
    if ctx.principal.dn().is_none() {
        return Truth::False;
    }
    let value = value.trim();

    if crate::filter::ldapurl::is_ldap_url(value) {
        let url = match LdapUrl::parse(value) {
            Ok(u) => u,
            Err(e) => {
                subject_error!(?e, %value, "groupdnattr url is invalid");
                return Truth::False;
            }
        };
        let Some(attr) = url.attrs.first() else {
            subject_error!(%value, "groupdnattr url names no attribute");
            return Truth::False;
        };
        let holders = match search_url(ctx, &url) {
            Ok(h) => h,
            Err(_) => return Truth::Undefined,
        };
        Truth::any(
            holders
                .iter()
                .flat_map(|e| e.values(attr).to_vec())
                .filter_map(|v| dn::normalise_lossy(&v))
                .map(|g| ctx.groups.is_member(ctx, &Dn::from_normalised(g))),
        )
    } else {
        Truth::any(
            ctx.entry
                .values(value)
                .iter()
                .filter_map(|v| dn::normalise_lossy(v))
                .map(|g| ctx.groups.is_member(ctx, &Dn::from_normalised(g))),
        )
    }
}

fn search_url(
    ctx: &SubjectContext<'_>,
    url: &LdapUrl,
) -> Result<Vec<std::sync::Arc<Entry>>, OperationError> {
    let base = url.base_dn()?;
    ctx.directory
        .search(&base, url.scope, &url.filter_or_everything())
        .map_err(|e| {
            subject_warn!(?e, %url, "search for subject url failed");
            e
        })
}
