//! Attribute and objectclass names the engine reads directly from entries.

/// The operational attribute holding access control rules.
pub const ATTR_ACI: &str = "aci";
pub const ATTR_OBJECTCLASS: &str = "objectclass";

pub const ATTR_MEMBER: &str = "member";
pub const ATTR_UNIQUEMEMBER: &str = "uniquemember";
pub const ATTR_MEMBERURL: &str = "memberurl";
pub const ATTR_MEMBERCERTIFICATE: &str = "membercertificatedescription";
pub const ATTR_CERTSUBJECTDN: &str = "certsubjectdn";
pub const ATTR_NSROLEDN: &str = "nsroledn";
pub const ATTR_NSROLE: &str = "nsrole";

pub const ATTR_MODIFIERSNAME: &str = "modifiersname";
pub const ATTR_MODIFYTIMESTAMP: &str = "modifytimestamp";
pub const ATTR_CREATORSNAME: &str = "creatorsname";
pub const ATTR_CREATETIMESTAMP: &str = "createtimestamp";

pub const OC_GROUPOFNAMES: &str = "groupofnames";
pub const OC_GROUPOFUNIQUENAMES: &str = "groupofuniquenames";
pub const OC_GROUPOFCERTIFICATES: &str = "groupofcertificates";
pub const OC_GROUPOFURLS: &str = "groupofurls";

/// Objectclasses whose membership changes invalidate cached group results.
pub const GROUP_OBJECTCLASSES: [&str; 4] = [
    OC_GROUPOFNAMES,
    OC_GROUPOFUNIQUENAMES,
    OC_GROUPOFCERTIFICATES,
    OC_GROUPOFURLS,
];

/// Attributes maintained by the server that are exempt from modify checks
/// when last-modified bookkeeping is enabled.
pub const LASTMOD_ATTRS: [&str; 2] = [ATTR_MODIFIERSNAME, ATTR_MODIFYTIMESTAMP];

pub const OPERATIONAL_ATTRS: [&str; 6] = [
    ATTR_ACI,
    ATTR_MODIFIERSNAME,
    ATTR_MODIFYTIMESTAMP,
    ATTR_CREATORSNAME,
    ATTR_CREATETIMESTAMP,
    ATTR_NSROLE,
];

pub const SUBJECT_ANYONE: &str = "anyone";
pub const SUBJECT_ALL: &str = "all";
pub const SUBJECT_SELF: &str = "self";
pub const SUBJECT_PARENT: &str = "parent";

pub const DEFAULT_GROUP_NESTING_LIMIT: u32 = 5;
pub const DEFAULT_GROUP_VISIT_LIMIT: u32 = 1024;
pub const DEFAULT_GROUP_CACHE_SIZE: usize = 200;
pub const DEFAULT_MAX_SELECTED_RULES: usize = 200;
pub const DEFAULT_RESULT_CACHE_SIZE: usize = 200;
pub const DEFAULT_ANON_PROFILE_MAX: usize = 40;
pub const DEFAULT_WORKER_THREADS: usize = 8;
/// Bound on the number of rules remembered as "target matched" per entry.
pub const DEFAULT_TARGET_MATCHED_MAX: usize = 200;
