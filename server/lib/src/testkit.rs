use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use time::macros::datetime;
use time::OffsetDateTime;

use crate::config::AclConfig;
use crate::engine::{AccessOperation, DecisionEngine, RuleStoreChange};
use crate::entry::SearchScope;
use crate::filter::Filter;
use crate::groupcache::GroupMembershipCache;
use crate::prelude::*;
use crate::rule::{RuleBuilder, RuleParser, RuleRecord};
use crate::subject::SubjectContext;

/// An entry store held in memory.
#[derive(Default)]
pub struct MemoryDirectory {
    entries: RwLock<BTreeMap<Dn, Arc<Entry>>>,
    backends: RwLock<HashMap<String, Dn>>,
    lastmod_disabled: AtomicBool,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry, replacing any entry with the same name.
    pub fn add(&self, entry: Entry) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(entry.dn().clone(), Arc::new(entry));
    }

    pub fn remove(&self, dn: &str) -> Option<Arc<Entry>> {
        let dn = Dn::new(dn).unwrap();
        self.entries.write().unwrap().remove(&dn)
    }

    pub fn set_backend(&self, name: &str, suffix: &str) {
        self.backends
            .write()
            .unwrap()
            .insert(name.to_string(), Dn::new(suffix).unwrap());
    }

    pub fn set_lastmod(&self, enabled: bool) {
        self.lastmod_disabled.store(!enabled, Ordering::Relaxed);
    }

    fn update<F: FnOnce(&mut Entry)>(&self, dn: &Dn, f: F) {
        let mut entries = self.entries.write().unwrap();
        let mut entry = entries
            .get(dn)
            .map(|e| e.as_ref().clone())
            .unwrap_or_else(|| Entry::new(dn.clone()));
        f(&mut entry);
        entries.insert(dn.clone(), Arc::new(entry));
    }
}

impl Directory for MemoryDirectory {
    fn get_entry(&self, dn: &Dn) -> Result<Option<Arc<Entry>>, OperationError> {
        Ok(self.entries.read().unwrap().get(dn).cloned())
    }

    fn search(
        &self,
        base: &Dn,
        scope: SearchScope,
        filter: &Filter,
    ) -> Result<Vec<Arc<Entry>>, OperationError> {
        Ok(self
            .entries
            .read()
            .unwrap()
            .values()
            .filter(|e| scope.contains(base, e.dn()) && filter.matches(e))
            .cloned()
            .collect())
    }

    fn backend_suffix(&self, name: &str) -> Option<Dn> {
        self.backends.read().unwrap().get(name).cloned()
    }

    fn lastmod_enabled(&self, _dn: &Dn) -> bool {
        !self.lastmod_disabled.load(Ordering::Relaxed)
    }
}

type Template = Arc<dyn Fn(RuleBuilder) -> RuleBuilder + Send + Sync>;

/// Turns an `aci` value into a rule by looking the whole value up as the
/// name of a registered template. Anything unregistered is a syntax error.
#[derive(Default)]
pub struct StaticRuleParser {
    templates: RwLock<HashMap<String, Template>>,
}

impl StaticRuleParser {
    pub fn register<F>(&self, name: &str, f: F)
    where
        F: Fn(RuleBuilder) -> RuleBuilder + Send + Sync + 'static,
    {
        self.templates
            .write()
            .unwrap()
            .insert(name.to_string(), Arc::new(f));
    }
}

impl RuleParser for StaticRuleParser {
    fn parse(&self, owner: &Dn, text: &str) -> Result<RuleRecord, RuleSyntaxError> {
        let template = self
            .templates
            .read()
            .unwrap()
            .get(text.trim())
            .cloned()
            .ok_or(RuleSyntaxError::Syntax)?;
        template(RuleRecord::builder(owner, text.trim()).text(text)).build()
    }
}

pub struct Fixture {
    pub dir: Arc<MemoryDirectory>,
    pub parser: Arc<StaticRuleParser>,
    /// Membership cache used by `subject_ctx`. The engine has its own.
    pub groups: GroupMembershipCache,
    pub now: OffsetDateTime,
    pub engine: DecisionEngine,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(AclConfig::default())
    }

    pub fn with_config(config: AclConfig) -> Self {
        let dir = Arc::new(MemoryDirectory::new());
        let parser = Arc::new(StaticRuleParser::default());
        let groups = GroupMembershipCache::from_config(&config);
        let engine = DecisionEngine::new(config, dir.clone(), parser.clone()).unwrap();
        Fixture {
            dir,
            parser,
            groups,
            now: datetime!(2024-01-10 12:00 UTC),
            engine,
        }
    }

    pub fn at(mut self, now: OffsetDateTime) -> Self {
        self.now = now;
        self
    }

    pub fn user(&self, dn: &str) -> Principal {
        Principal::user(Dn::new(dn).unwrap())
    }

    pub fn entry(&self, dn: &str) -> Entry {
        Entry::try_new(dn)
            .unwrap()
            .with_value(ATTR_OBJECTCLASS, "top")
    }

    pub fn group(&self, dn: &str, members: &[&str]) -> Entry {
        Entry::try_new(dn)
            .unwrap()
            .with_value(ATTR_OBJECTCLASS, "top")
            .with_value(ATTR_OBJECTCLASS, "groupOfNames")
            .with_values(ATTR_MEMBER, members.iter().copied())
    }

    pub fn subject_ctx<'a>(&'a self, principal: &'a Principal, entry: &'a Entry) -> SubjectContext<'a> {
        SubjectContext::new(
            principal,
            entry,
            None,
            self.now,
            self.dir.as_ref(),
            &self.groups,
        )
    }

    /// Register a rule template without storing it anywhere.
    pub fn template<F>(&self, name: &str, f: F)
    where
        F: Fn(RuleBuilder) -> RuleBuilder + Send + Sync + 'static,
    {
        self.parser.register(name, f);
    }

    /// Register a rule template and store it as an `aci` value of `owner`,
    /// creating the owner entry if needed. The engine does not see it until
    /// `load` or a change notification.
    pub fn rule<F>(&self, owner: &str, name: &str, f: F)
    where
        F: Fn(RuleBuilder) -> RuleBuilder + Send + Sync + 'static,
    {
        self.template(name, f);
        let owner = Dn::new(owner).unwrap();
        self.dir.update(&owner, |e| e.add_value(ATTR_ACI, name));
    }

    /// As `rule`, and tell the engine about the new value.
    pub fn add_rule<F>(&self, owner: &str, name: &str, f: F)
    where
        F: Fn(RuleBuilder) -> RuleBuilder + Send + Sync + 'static,
    {
        self.rule(owner, name, f);
        let owner = Dn::new(owner).unwrap();
        let entry = self.dir.get_entry(&owner).unwrap().unwrap();
        self.engine
            .rule_store_changed(
                &owner,
                RuleStoreChange::Modify {
                    entry: &entry,
                    mods: &[Modify::add(ATTR_ACI, &[name])],
                },
            )
            .unwrap();
    }

    pub fn load(&self, base: &str) -> usize {
        self.engine.load_rules(&Dn::new(base).unwrap()).unwrap()
    }

    pub fn begin(&self, principal: Principal, op: OperationInfo) -> AccessOperation<'_> {
        self.engine.begin(principal, op.with_time(self.now)).unwrap()
    }
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn setup_engine(config: AclConfig) -> Fixture {
    sketching::test_init();
    Fixture::with_config(config)
}
