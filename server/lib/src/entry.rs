//! The view of a directory entry the decision engine works with, and the
//! collaborator trait used to fetch and search entries.
//!
//! Attribute names are case insensitive and stored lowercased. Values keep
//! their original form; comparisons against them are case insensitive since
//! every attribute the engine inspects (DNs, objectclasses, roles) uses a
//! case ignoring matching rule.

use std::fmt;
use std::sync::Arc;

use crate::dn;
use crate::filter::Filter;
use crate::prelude::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub values: Vec<String>,
    pub operational: bool,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    dn: Dn,
    attrs: Vec<Attribute>,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("dn", &self.dn.as_str())
            .field("attrs", &self.attrs.len())
            .finish()
    }
}

impl Entry {
    pub fn new(dn: Dn) -> Self {
        Entry {
            dn,
            attrs: Vec::new(),
        }
    }

    /// Build an entry from a textual DN. Mostly useful in tests and fixtures.
    pub fn try_new(dn: &str) -> Result<Self, OperationError> {
        Dn::new(dn).map(Entry::new)
    }

    /// Add a user attribute value, creating the attribute when needed.
    pub fn with_value(mut self, attr: &str, value: &str) -> Self {
        self.add_value(attr, value);
        self
    }

    pub fn with_values<'a, I>(mut self, attr: &str, values: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        for v in values {
            self.add_value(attr, v);
        }
        self
    }

    pub fn with_operational(mut self, attr: &str, value: &str) -> Self {
        self.add_value(attr, value);
        if let Some(a) = self.get_mut(attr) {
            a.operational = true;
        }
        self
    }

    pub fn add_value(&mut self, attr: &str, value: &str) {
        match self.get_mut(attr) {
            Some(a) => {
                if !a.values.iter().any(|v| v.eq_ignore_ascii_case(value)) {
                    a.values.push(value.to_string());
                }
            }
            None => {
                let name = attr.to_lowercase();
                let operational = OPERATIONAL_ATTRS.contains(&name.as_str());
                self.attrs.push(Attribute {
                    name,
                    values: vec![value.to_string()],
                    operational,
                });
            }
        }
    }

    pub fn remove_attribute(&mut self, attr: &str) {
        self.attrs.retain(|a| !a.name.eq_ignore_ascii_case(attr));
    }

    /// A single attribute entry used to test per-value attribute filters.
    pub fn synthesize(dn: &Dn, attr: &str, value: &str) -> Self {
        Entry::new(dn.clone()).with_value(attr, value)
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn get(&self, attr: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|a| a.name.eq_ignore_ascii_case(attr))
    }

    fn get_mut(&mut self, attr: &str) -> Option<&mut Attribute> {
        self.attrs
            .iter_mut()
            .find(|a| a.name.eq_ignore_ascii_case(attr))
    }

    pub fn values(&self, attr: &str) -> &[String] {
        self.get(attr).map(|a| a.values.as_slice()).unwrap_or(&[])
    }

    pub fn has_attribute(&self, attr: &str) -> bool {
        self.get(attr).is_some()
    }

    pub fn has_value(&self, attr: &str, value: &str) -> bool {
        self.values(attr)
            .iter()
            .any(|v| v.trim().eq_ignore_ascii_case(value.trim()))
    }

    /// True when any value of `attr` normalises to the same DN as `dn`.
    pub fn has_dn_value(&self, attr: &str, dn: &Dn) -> bool {
        self.values(attr)
            .iter()
            .filter_map(|v| dn::normalise_lossy(v))
            .any(|v| v == dn.as_str())
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.attrs.iter()
    }

    pub fn attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attrs.iter().map(|a| a.name.as_str())
    }

    pub fn user_attribute_names(&self) -> impl Iterator<Item = &str> {
        self.attrs
            .iter()
            .filter(|a| !a.operational)
            .map(|a| a.name.as_str())
    }

    pub fn object_classes(&self) -> impl Iterator<Item = String> + '_ {
        self.values(ATTR_OBJECTCLASS).iter().map(|v| v.to_lowercase())
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.has_value(ATTR_OBJECTCLASS, class)
    }

    /// Group like entries are the only ones whose changes can alter a cached
    /// membership answer.
    pub fn is_group_like(&self) -> bool {
        self.object_classes()
            .any(|oc| GROUP_OBJECTCLASSES.contains(&oc.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    Add,
    Delete,
    Replace,
}

/// One modification of a modify request. A delete with no values removes
/// the whole attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modify {
    pub op: ModifyOp,
    pub attr: String,
    pub values: Vec<String>,
}

impl Modify {
    pub fn new(op: ModifyOp, attr: &str, values: &[&str]) -> Self {
        Modify {
            op,
            attr: attr.to_lowercase(),
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    pub fn add(attr: &str, values: &[&str]) -> Self {
        Modify::new(ModifyOp::Add, attr, values)
    }

    pub fn delete(attr: &str, values: &[&str]) -> Self {
        Modify::new(ModifyOp::Delete, attr, values)
    }

    pub fn replace(attr: &str, values: &[&str]) -> Self {
        Modify::new(ModifyOp::Replace, attr, values)
    }
}

pub type ModifyList = Vec<Modify>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

impl SearchScope {
    /// True if `dn` falls inside a search of this scope rooted at `base`.
    pub fn contains(self, base: &Dn, dn: &Dn) -> bool {
        match self {
            SearchScope::Base => base == dn,
            SearchScope::OneLevel => dn.parent().as_ref() == Some(base),
            SearchScope::Subtree => base.is_suffix_of(dn),
        }
    }
}

/// The entry store, as seen by the engine. Implementations must be safe to
/// call from many operation threads at once, and must never call back into
/// the engine.
pub trait Directory: Send + Sync {
    fn get_entry(&self, dn: &Dn) -> Result<Option<Arc<Entry>>, OperationError>;

    fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<Vec<Arc<Entry>>, OperationError>;

    /// The suffix served by the named backend.
    fn backend_suffix(&self, name: &str) -> Option<Dn>;

    /// Whether the backend holding `dn` maintains the last modified
    /// bookkeeping attributes itself.
    fn lastmod_enabled(&self, _dn: &Dn) -> bool {
        true
    }
}
