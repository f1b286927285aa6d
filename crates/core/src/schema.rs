//! Schema catalog.
//!
//! The catalog is not stored separately: it is derived from facts whose
//! attribute is one of the reserved `_db/*` names, read as of a txn. An
//! attribute is an entity with a live `_db/attribute` (its name) and a live
//! `_db/type`; `_db/is-multi-valued` is optional and defaults to `false`.
//!
//! A [`Schema`] value is immutable. The transactor swaps in a freshly loaded
//! one after any commit that touched reserved attributes; snapshots keep the
//! one they were created with.

use std::collections::HashMap;

use redb::ReadTransaction;

use crate::error::Result;
use crate::hash_index::HashReader;
use crate::index::{HashFact, IndexOrder, KeyPattern, ScanPlan};
use crate::storage::FACTS;
use crate::types::{BOOLEAN, STRING};

pub const DB_ATTRIBUTE: &str = "_db/attribute";
pub const DB_TYPE: &str = "_db/type";
pub const DB_IS_MULTI_VALUED: &str = "_db/is-multi-valued";

pub const RESERVED_ATTRIBUTES: [&str; 3] = [DB_ATTRIBUTE, DB_TYPE, DB_IS_MULTI_VALUED];

pub fn is_reserved(attribute: &str) -> bool {
    RESERVED_ATTRIBUTES.contains(&attribute)
}

/// What the catalog knows about one attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeDef {
    pub name: String,
    pub type_name: String,
    pub multi_valued: bool,
}

impl AttributeDef {
    fn reserved(name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: if name == DB_IS_MULTI_VALUED {
                BOOLEAN
            } else {
                STRING
            }
            .to_string(),
            multi_valued: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Schema {
    by_name: HashMap<String, AttributeDef>,
    /// Content hash of an attribute name → that name.
    name_by_hash: HashMap<String, String>,
}

/// Latest state of one `(entity, reserved attribute)` pair while loading.
struct Latest {
    t: u64,
    live: bool,
    value_hash: String,
}

impl Schema {
    /// Build the catalog from every reserved-attribute fact with txn ≤ `as_of`.
    pub(crate) fn load(read_txn: &ReadTransaction, as_of: u64) -> Result<Self> {
        let hashes = HashReader::open(read_txn)?;
        let facts = read_txn.open_table(FACTS)?;
        let mut schema = Schema::default();

        // entity hash → latest, one map per reserved attribute
        let mut latest: [HashMap<String, Latest>; 3] = Default::default();
        for (slot, name) in RESERVED_ATTRIBUTES.iter().enumerate() {
            schema.insert(None, AttributeDef::reserved(name));
            let Some(attribute_hash) = hashes.hash_of(name)? else {
                continue;
            };
            schema
                .name_by_hash
                .insert(attribute_hash.clone(), name.to_string());

            let mut pattern = KeyPattern::default();
            pattern.components[1] = Some(attribute_hash);
            let plan = ScanPlan::build(IndexOrder::Avet, &pattern);
            for entry in facts.range(plan.prefix.as_str()..)? {
                let (guard, _) = entry?;
                let key = guard.value();
                if !key.starts_with(&plan.prefix) {
                    break;
                }
                let Some(HashFact { e, v, t, o, .. }) = plan.matches(key)? else {
                    continue;
                };
                if t > as_of {
                    continue;
                }
                let current = latest[slot].get(&e);
                if current.is_some_and(|c| c.t > t) {
                    continue;
                }
                latest[slot].insert(
                    e,
                    Latest {
                        t,
                        live: o,
                        value_hash: v,
                    },
                );
            }
        }
        let [names, types, multi] = latest;

        // Later definitions of the same name win.
        let mut defined: Vec<(&String, &Latest)> = names.iter().filter(|(_, l)| l.live).collect();
        defined.sort_by_key(|(_, l)| l.t);
        for (entity, name) in defined {
            let attribute_name = hashes.encoding_of(&name.value_hash)?;
            if is_reserved(&attribute_name) {
                tracing::warn!(
                    target: "factline::schema",
                    attribute = %attribute_name,
                    "ignoring redefinition of a reserved attribute"
                );
                continue;
            }
            let Some(type_name) = types.get(entity).filter(|l| l.live) else {
                tracing::warn!(
                    target: "factline::schema",
                    attribute = %attribute_name,
                    "attribute has no type yet; not usable"
                );
                continue;
            };
            let type_name = hashes.encoding_of(&type_name.value_hash)?;
            let multi_valued = match multi.get(entity).filter(|l| l.live) {
                Some(flag) => hashes.encoding_of(&flag.value_hash)? == "true",
                None => false,
            };
            schema.insert(
                Some(name.value_hash.clone()),
                AttributeDef {
                    name: attribute_name,
                    type_name,
                    multi_valued,
                },
            );
        }
        Ok(schema)
    }

    fn insert(&mut self, name_hash: Option<String>, def: AttributeDef) {
        if let Some(hash) = name_hash {
            self.name_by_hash.insert(hash, def.name.clone());
        }
        self.by_name.insert(def.name.clone(), def);
    }

    /// Catalog entry for an attribute name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.by_name.get(name)
    }

    /// Catalog entry for the content hash of an attribute name.
    pub fn attribute_for_hash(&self, hash: &str) -> Option<&AttributeDef> {
        self.name_by_hash
            .get(hash)
            .and_then(|name| self.by_name.get(name))
    }

    /// Unknown attributes count as single-valued.
    pub fn is_multi_valued_hash(&self, hash: &str) -> bool {
        self.attribute_for_hash(hash)
            .is_some_and(|def| def.multi_valued)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeDef> {
        self.by_name.values()
    }

    /// Hand-built catalog for reducer tests, keyed by fake hashes.
    #[cfg(test)]
    pub(crate) fn from_defs(defs: Vec<(&str, AttributeDef)>) -> Self {
        let mut schema = Schema::default();
        for (hash, def) in defs {
            schema.insert(Some(hash.to_string()), def);
        }
        schema
    }
}
