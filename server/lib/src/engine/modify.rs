//! Checks run before a modify is applied.

use std::fmt;

use crate::prelude::*;

use super::AccessOperation;

/// Why a modify may not go ahead, with the message sent back to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRefusal {
    pub code: AccessResultCode,
    pub message: String,
}

impl ModifyRefusal {
    fn write_denied(code: AccessResultCode, attr: &str, dn: &Dn) -> Self {
        ModifyRefusal {
            code,
            message: format!(
                "Insufficient 'write' privilege to the '{}' attribute of entry '{}'.",
                attr, dn
            ),
        }
    }
}

impl fmt::Display for ModifyRefusal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.code, self.message)
    }
}

fn is_lastmod_attr(attr: &str) -> bool {
    LASTMOD_ATTRS.iter().any(|a| a.eq_ignore_ascii_case(attr))
}

impl AccessOperation<'_> {
    /// Check that every value a modify adds or removes may be written. The
    /// first refused value stops the check.
    #[instrument(level = "trace", skip_all)]
    pub fn check_pending_modifications(
        &mut self,
        entry: &Entry,
        mods: &[Modify],
    ) -> Result<(), ModifyRefusal> {
        for m in mods {
            let attr = m.attr.as_str();
            let removes_all = match m.op {
                ModifyOp::Replace => true,
                ModifyOp::Delete => m.values.is_empty(),
                ModifyOp::Add => false,
            };

            if removes_all {
                // The backend maintains these itself.
                if is_lastmod_attr(attr) && self.engine.directory.lastmod_enabled(entry.dn()) {
                    continue;
                }
                let existing = entry.values(attr).to_vec();
                if existing.is_empty() {
                    self.check_value(entry, attr, None, AccessRights::WRITE_DEL)?;
                }
                for v in existing.iter() {
                    self.check_value(entry, attr, Some(v), AccessRights::WRITE_DEL)?;
                }
            }

            let access = match m.op {
                ModifyOp::Add | ModifyOp::Replace => AccessRights::WRITE_ADD,
                ModifyOp::Delete => AccessRights::WRITE_DEL,
            };
            for v in m.values.iter() {
                self.check_value(entry, attr, Some(v), access)?;
            }

            if attr.eq_ignore_ascii_case(ATTR_ACI) && m.op != ModifyOp::Delete {
                for v in m.values.iter() {
                    if let Err(e) = self.engine.parser.parse(entry.dn(), v) {
                        admin_error!(dn = %entry.dn(), code = e.code(), err = %e, "refusing invalid aci");
                        return Err(ModifyRefusal {
                            code: AccessResultCode::InvalidAttributeSyntax,
                            message: e.describe().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn check_value(
        &mut self,
        entry: &Entry,
        attr: &str,
        value: Option<&str>,
        access: AccessRights,
    ) -> Result<(), ModifyRefusal> {
        let rc = self.access_allowed(entry, Some(attr), value, access);
        if rc.is_success() {
            Ok(())
        } else {
            request_info!(dn = %entry.dn(), attr, %rc, "modify refused");
            Err(ModifyRefusal::write_denied(rc, attr, entry.dn()))
        }
    }
}
