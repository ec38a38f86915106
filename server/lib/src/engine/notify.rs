//! Keeping the rule index in step with the directory.
//!
//! The write path calls [`DecisionEngine::rule_store_changed`] after every
//! change to an entry holding rules, or to a group whose membership may be
//! cached, and [`DecisionEngine::backend_state_changed`] when a backend comes
//! online or goes away.

use crate::prelude::*;

use super::DecisionEngine;

/// A committed change to one entry.
#[derive(Debug, Clone, Copy)]
pub enum RuleStoreChange<'a> {
    Add(&'a Entry),
    Delete(&'a Entry),
    Modify {
        entry: &'a Entry,
        mods: &'a [Modify],
    },
    ModRdn {
        new_rdn: &'a str,
        new_superior: Option<&'a Dn>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Online,
    Offline,
    Deleted,
}

const MEMBERSHIP_ATTRS: [&str; 3] = [ATTR_MEMBER, ATTR_UNIQUEMEMBER, ATTR_MEMBERURL];

fn touches_membership(mods: &[Modify]) -> bool {
    mods.iter().any(|m| {
        MEMBERSHIP_ATTRS
            .iter()
            .any(|a| m.attr.eq_ignore_ascii_case(a))
    })
}

impl DecisionEngine {
    /// Apply a committed change of the entry at `dn`.
    #[instrument(level = "trace", skip_all)]
    pub fn rule_store_changed(
        &self,
        dn: &Dn,
        change: RuleStoreChange<'_>,
    ) -> Result<(), OperationError> {
        let (group_change, drop_saved) = match change {
            RuleStoreChange::Add(e) => (e.is_group_like(), false),
            RuleStoreChange::Delete(e) => (e.is_group_like(), e.is_group_like()),
            RuleStoreChange::Modify { entry, mods } => {
                let g = entry.is_group_like() && touches_membership(mods);
                (g, g)
            }
            RuleStoreChange::ModRdn { .. } => (false, false),
        };

        let mut txn = self.index.write();
        if group_change {
            self.groups.bump_signature();
        }
        self.groups.mark_stale(dn);

        match change {
            RuleStoreChange::Delete(_) => {
                txn.remove(dn);
            }
            RuleStoreChange::Add(entry) => {
                self.index_values(
                    &mut txn,
                    dn,
                    entry.values(ATTR_ACI).iter().map(String::as_str),
                );
            }
            RuleStoreChange::Modify { mods, .. } => {
                for m in mods
                    .iter()
                    .filter(|m| m.attr.eq_ignore_ascii_case(ATTR_ACI))
                {
                    match m.op {
                        ModifyOp::Replace => {
                            txn.remove(dn);
                            self.index_values(&mut txn, dn, m.values.iter().map(String::as_str));
                        }
                        ModifyOp::Add => {
                            self.index_values(&mut txn, dn, m.values.iter().map(String::as_str));
                        }
                        ModifyOp::Delete if m.values.is_empty() => {
                            txn.remove(dn);
                        }
                        ModifyOp::Delete => {
                            for v in m.values.iter() {
                                if !txn.remove_value(dn, v) {
                                    admin_warn!(%dn, aci = %v, "no indexed rule with this value");
                                }
                            }
                        }
                    }
                }
            }
            RuleStoreChange::ModRdn {
                new_rdn,
                new_superior,
            } => {
                let rdn = Dn::new(new_rdn).map_err(|e| {
                    admin_error!(?e, rdn = new_rdn, "unable to parse new rdn");
                    e
                })?;
                let parent = match new_superior {
                    Some(p) => p.clone(),
                    None => dn.parent().unwrap_or_else(Dn::root),
                };
                let new_dn = Dn::join(rdn.as_str(), &parent);
                txn.rename(dn, &new_dn);
            }
        }

        if drop_saved {
            txn.touch();
        }
        txn.commit();
        self.anonymous.invalidate();
        Ok(())
    }

    /// Index or drop every rule under a backend's suffix.
    #[instrument(level = "trace", skip_all)]
    pub fn backend_state_changed(
        &self,
        name: &str,
        old: BackendState,
        new: BackendState,
    ) -> Result<(), OperationError> {
        let Some(suffix) = self.directory.backend_suffix(name) else {
            admin_warn!(backend = name, "state change for an unknown backend");
            return Err(OperationError::NoSuchEntry(name.to_string()));
        };

        let mut txn = self.index.write();
        if old != BackendState::Online && new == BackendState::Online {
            let count = self.index_subtree(&mut txn, &suffix)?;
            admin_info!(backend = name, %suffix, rules = count, "backend online, rules indexed");
        } else if old == BackendState::Online && new != BackendState::Online {
            let count = txn.remove_subtree(&suffix);
            admin_info!(backend = name, %suffix, containers = count, "backend offline, rules dropped");
        } else {
            admin_debug!(backend = name, ?old, ?new, "backend state change needs no index update");
            return Ok(());
        }
        txn.commit();
        self.anonymous.invalidate();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AclConfig;
    use crate::index::RuleIndexTransaction;
    use crate::rule::SubjectExpr;
    use crate::testkit::*;

    const BASE: &str = "dc=example,dc=com";
    const PEOPLE: &str = "ou=people,dc=example,dc=com";
    const ALICE: &str = "uid=alice,dc=example,dc=com";

    fn read_cn(fx: &Fixture, dn: &str) -> AccessResultCode {
        let mut op = fx.begin(fx.user(ALICE), OperationInfo::new(1, 1, OperationKind::Search));
        op.access_allowed(&fx.entry(dn), Some("cn"), None, AccessRights::READ)
    }

    fn with_read_rule(fx: &Fixture) {
        fx.template("read-cn", |b| {
            b.targetattr("cn")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
    }

    #[test]
    fn test_add_and_delete_entry_with_rules() {
        let fx = setup_engine(AclConfig::default());
        with_read_rule(&fx);
        let people = fx.entry(PEOPLE).with_value(ATTR_ACI, "read-cn");
        let dn = people.dn().clone();

        fx.engine
            .rule_store_changed(&dn, RuleStoreChange::Add(&people))
            .unwrap();
        assert_eq!(fx.engine.index().read().rule_count(), 1);
        assert!(read_cn(&fx, "uid=bob,ou=people,dc=example,dc=com").is_success());

        fx.engine
            .rule_store_changed(&dn, RuleStoreChange::Delete(&people))
            .unwrap();
        assert_eq!(fx.engine.index().read().rule_count(), 0);
        assert!(!read_cn(&fx, "uid=bob,ou=people,dc=example,dc=com").is_success());
    }

    #[test]
    fn test_modify_rule_values() {
        let fx = setup_engine(AclConfig::default());
        with_read_rule(&fx);
        fx.template("other", |b| {
            b.targetattr("sn")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        let people = fx.entry(PEOPLE);
        let dn = people.dn().clone();
        let change = |mods: &[Modify]| {
            fx.engine
                .rule_store_changed(
                    &dn,
                    RuleStoreChange::Modify {
                        entry: &people,
                        mods,
                    },
                )
                .unwrap();
            fx.engine.index().read().rule_count()
        };

        assert_eq!(change(&[Modify::add(ATTR_ACI, &["read-cn", "other"])]), 2);
        assert_eq!(change(&[Modify::delete(ATTR_ACI, &["other"])]), 1);
        assert_eq!(change(&[Modify::replace(ATTR_ACI, &["other"])]), 1);
        assert!(!read_cn(&fx, "uid=bob,ou=people,dc=example,dc=com").is_success());
        // Invalid values are skipped.
        assert_eq!(change(&[Modify::add(ATTR_ACI, &["garbage"])]), 1);
        assert_eq!(change(&[Modify::delete(ATTR_ACI, &[])]), 0);
    }

    #[test]
    fn test_modrdn_moves_rules() {
        let fx = setup_engine(AclConfig::default());
        with_read_rule(&fx);
        let people = fx.entry(PEOPLE).with_value(ATTR_ACI, "read-cn");
        let dn = people.dn().clone();
        fx.engine
            .rule_store_changed(&dn, RuleStoreChange::Add(&people))
            .unwrap();

        fx.engine
            .rule_store_changed(
                &dn,
                RuleStoreChange::ModRdn {
                    new_rdn: "ou=Staff",
                    new_superior: None,
                },
            )
            .unwrap();
        assert!(read_cn(&fx, "uid=bob,ou=staff,dc=example,dc=com").is_success());
        assert!(!read_cn(&fx, "uid=bob,ou=people,dc=example,dc=com").is_success());

        assert!(fx
            .engine
            .rule_store_changed(
                &Dn::new("ou=staff,dc=example,dc=com").unwrap(),
                RuleStoreChange::ModRdn {
                    new_rdn: "not an rdn",
                    new_superior: None,
                },
            )
            .is_err());
    }

    #[test]
    fn test_group_change_moves_signatures() {
        let fx = setup_engine(AclConfig::default());
        let group = fx.group("cn=admins,dc=example,dc=com", &[ALICE]);
        let dn = group.dn().clone();
        let groups_before = fx.engine.groups().signature();
        let index_before = fx.engine.index().read().signature();

        fx.engine
            .rule_store_changed(
                &dn,
                RuleStoreChange::Modify {
                    entry: &group,
                    mods: &[Modify::add(ATTR_MEMBER, &["uid=bob,dc=example,dc=com"])],
                },
            )
            .unwrap();
        assert_ne!(fx.engine.groups().signature(), groups_before);
        assert_ne!(fx.engine.index().read().signature(), index_before);

        // Other attributes of a group leave cached memberships alone.
        let groups_before = fx.engine.groups().signature();
        fx.engine
            .rule_store_changed(
                &dn,
                RuleStoreChange::Modify {
                    entry: &group,
                    mods: &[Modify::replace("description", &["admins"])],
                },
            )
            .unwrap();
        assert_eq!(fx.engine.groups().signature(), groups_before);
    }

    #[test]
    fn test_backend_state_changes() {
        let fx = setup_engine(AclConfig::default());
        fx.rule(BASE, "read-cn", |b| {
            b.targetattr("cn")
                .allow(AccessRights::READ, SubjectExpr::userdn("ldap:///all"))
        });
        fx.dir.set_backend("userroot", BASE);

        fx.engine
            .backend_state_changed("userroot", BackendState::Offline, BackendState::Online)
            .unwrap();
        assert_eq!(fx.engine.index().read().rule_count(), 1);
        assert!(read_cn(&fx, PEOPLE).is_success());

        // Already online, nothing to do.
        fx.engine
            .backend_state_changed("userroot", BackendState::Online, BackendState::Online)
            .unwrap();
        assert_eq!(fx.engine.index().read().rule_count(), 1);

        fx.engine
            .backend_state_changed("userroot", BackendState::Online, BackendState::Deleted)
            .unwrap();
        assert_eq!(fx.engine.index().read().rule_count(), 0);
        assert!(!read_cn(&fx, PEOPLE).is_success());

        assert_eq!(
            fx.engine
                .backend_state_changed("nope", BackendState::Offline, BackendState::Online),
            Err(OperationError::NoSuchEntry(String::new()))
        );
    }
}
