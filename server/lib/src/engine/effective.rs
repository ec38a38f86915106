//! Effective rights reporting: what the bound principal could do to an
//! entry and each of its attributes.

use itertools::Itertools;

use crate::prelude::*;

use super::AccessOperation;

impl AccessOperation<'_> {
    fn granted(
        &mut self,
        entry: &Entry,
        attr: Option<&str>,
        value: Option<&str>,
        access: AccessRights,
    ) -> bool {
        self.access_allowed(entry, attr, value, access).is_success()
    }

    fn entry_level_rights(&mut self, entry: &Entry) -> String {
        let mut rights = String::new();
        if self.granted(entry, Some("*"), None, AccessRights::READ) {
            rights.push('v');
        }
        if self.granted(entry, None, None, AccessRights::ADD) {
            rights.push('a');
        }
        if self.granted(entry, None, None, AccessRights::DELETE) {
            rights.push('d');
        }
        let rdn = entry
            .dn()
            .rdn_pairs()
            .first()
            .map(|(t, v)| (t.to_string(), v.to_string()));
        if let Some((rdn_type, rdn_value)) = rdn {
            if self.granted(entry, Some(&rdn_type), Some(&rdn_value), AccessRights::WRITE_ADD)
                && self.granted(entry, Some(&rdn_type), Some(&rdn_value), AccessRights::WRITE_DEL)
            {
                rights.push('n');
            }
        }
        if rights.is_empty() {
            rights.push_str("none");
        }
        rights
    }

    fn attr_level_rights(&mut self, entry: &Entry, attr: &str) -> String {
        let mut rights = String::new();
        let attr = Some(attr);
        if self.granted(entry, attr, None, AccessRights::READ) {
            rights.push('r');
        }
        if self.granted(entry, attr, None, AccessRights::SEARCH) {
            rights.push('s');
        }
        if self.granted(entry, attr, None, AccessRights::COMPARE) {
            rights.push('c');
        }
        let write = self.granted(entry, attr, None, AccessRights::WRITE_ADD);
        let delete = self.granted(entry, attr, None, AccessRights::WRITE_DEL);
        if write {
            rights.push('w');
        }
        if delete {
            rights.push('o');
        }
        if !write && !delete {
            // Selfwrite can only be tested with the principal's own DN.
            if let Some(own) = self.principal.dn().map(|dn| dn.as_str().to_string()) {
                if self.granted(entry, attr, Some(&own), AccessRights::WRITE_ADD) {
                    rights.push('W');
                }
                if self.granted(entry, attr, Some(&own), AccessRights::WRITE_DEL) {
                    rights.push('O');
                }
            }
        }
        if rights.is_empty() {
            rights.push_str("none");
        }
        rights
    }

    /// Report entry level and attribute level rights for `entry`. Without
    /// `attrs` every user attribute of the entry is reported.
    #[instrument(level = "trace", skip_all)]
    pub fn effective_rights(&mut self, entry: &Entry, attrs: Option<&[&str]>) -> String {
        let entry_rights = self.entry_level_rights(entry);

        let names: Vec<String> = match attrs {
            Some(list) if !list.is_empty() => list.iter().map(|a| a.to_lowercase()).collect(),
            _ => entry.user_attribute_names().map(str::to_string).collect(),
        };
        let attr_rights = if names.is_empty() {
            "*:none".to_string()
        } else {
            names
                .iter()
                .map(|name| format!("{}:{}", name, self.attr_level_rights(entry, name)))
                .join(", ")
        };

        request_info!(dn = %entry.dn(), principal = %self.principal, "effective rights computed");
        format!(
            "entryLevelRights: {}\nattributeLevelRights: {}",
            entry_rights, attr_rights
        )
    }
}
