//! Pattern-matching query engine.
//!
//! A pattern is a JSON array `[entity, attribute, value, txn, operation]`;
//! missing trailing positions are the wildcard `?_`. Strings starting with `?`
//! are variables, and literals that really start with `?` or `\` carry one
//! extra leading backslash.
//!
//! Evaluation runs in four steps: substitute the caller's binding into the
//! pattern, resolve literals to content hashes, scan the ordering picked by
//! the router, and fold the matching quintuples through [`BindingSet`], which
//! keeps only the latest fact per grouping key. The survivors are decoded and
//! merged over the caller's binding.

use std::collections::{HashMap, HashSet};

use redb::{ReadableDatabase, ReadableTable};
use serde_json::{json, Map, Value};

use crate::error::{FactlineError, Result};
use crate::hash_index::HashReader;
use crate::index::{encode_op, encode_txn, Field, HashFact, KeyPattern, ScanPlan};
use crate::schema::Schema;
use crate::snapshot::Snapshot;
use crate::storage::FACTS;

/// Variable name → decoded value.
pub type Binding = Map<String, Value>;

pub const WILDCARD: &str = "?_";
const VAR_MARKER: char = '?';
const ESCAPE: char = '\\';
const POSITIONS: usize = 5;

// ---------------------------------------------------------------------------
// Escaping and binding substitution
// ---------------------------------------------------------------------------

/// Protect a literal so it is never read as a variable.
pub fn escape(value: &Value) -> Value {
    match value {
        Value::String(s) if s.starts_with(ESCAPE) || s.starts_with(VAR_MARKER) => {
            Value::String(format!("{ESCAPE}{s}"))
        }
        other => other.clone(),
    }
}

pub(crate) fn unescape(s: &str) -> &str {
    s.strip_prefix(ESCAPE).unwrap_or(s)
}

fn is_literal(value: &Value) -> bool {
    matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_))
}

/// Check that `binding` is a flat object of literals.
pub(crate) fn as_binding(binding: &Value) -> Result<Binding> {
    let Value::Object(map) = binding else {
        return Err(FactlineError::MalformedInput(
            "binding must be an object".into(),
        ));
    };
    if let Some((key, _)) = map.iter().find(|(_, v)| !is_literal(v)) {
        return Err(FactlineError::MalformedInput(format!(
            "binding for {key} is not a literal"
        )));
    }
    Ok(map.clone())
}

/// Replace every element equal to a binding key with the escaped bound value.
pub(crate) fn bind_to_tuple(tuple: &[Value], binding: &Binding) -> Vec<Value> {
    tuple
        .iter()
        .map(|element| match element {
            Value::String(s) => binding.get(s).map(escape).unwrap_or_else(|| element.clone()),
            other => other.clone(),
        })
        .collect()
}

enum Element<'a> {
    Wildcard,
    Variable(&'a str),
    Literal(Value),
}

fn classify(element: &Value) -> Element<'_> {
    match element {
        Value::String(s) if s == WILDCARD => Element::Wildcard,
        Value::String(s) if s.starts_with(VAR_MARKER) => Element::Variable(s),
        Value::String(s) => Element::Literal(Value::String(unescape(s).to_string())),
        other => Element::Literal(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Blank,
    Var(String),
    /// Key component: a content hash, a base-36 txn or an op flag.
    Known(String),
    /// A value literal with several candidate hashes; see `value_types`.
    Candidates,
}

#[derive(Debug)]
struct QueryFact {
    slots: [Slot; POSITIONS],
    /// `(type name, hash)` for every type that accepted a value literal.
    /// A scanned fact only matches if its attribute has one of these types
    /// and its value hash is that type's hash.
    value_types: Option<Vec<(&'static str, String)>>,
}

impl QueryFact {
    fn slot(&self, field: Field) -> &Slot {
        &self.slots[field.position()]
    }

    fn key_pattern(&self) -> KeyPattern {
        let mut pattern = KeyPattern::default();
        for (component, slot) in pattern.components.iter_mut().zip(&self.slots) {
            if let Slot::Known(s) = slot {
                *component = Some(s.clone());
            }
        }
        pattern
    }

    fn accepts_value(&self, snapshot: &Snapshot, fact: &HashFact) -> bool {
        let Some(candidates) = &self.value_types else {
            return true;
        };
        let Some(def) = snapshot.schema().attribute_for_hash(&fact.a) else {
            return false;
        };
        candidates
            .iter()
            .any(|(type_name, hash)| *type_name == def.type_name && *hash == fact.v)
    }
}

/// `None` when some literal was never stored: such a pattern cannot match.
fn parse_tuple(
    snapshot: &Snapshot,
    reader: &HashReader,
    tuple: &[Value],
) -> Result<Option<QueryFact>> {
    let wildcard = Value::from(WILDCARD);
    let element = |i: usize| tuple.get(i).unwrap_or(&wildcard);

    let Some(e) = parse_hashed(reader, 0, element(0))? else {
        return Ok(None);
    };
    let Some(a) = parse_hashed(reader, 1, element(1))? else {
        return Ok(None);
    };
    let Some((v, value_types)) = parse_value(snapshot, reader, element(1), element(2))? else {
        return Ok(None);
    };
    let t = match classify(element(3)) {
        Element::Wildcard => Slot::Blank,
        Element::Variable(name) => Slot::Var(name.to_string()),
        Element::Literal(literal) => match literal.as_u64() {
            Some(txn) => Slot::Known(encode_txn(txn)),
            None => {
                return Err(FactlineError::InvalidTupleElement {
                    position: 3,
                    reason: format!("expected a non-negative integer txn, got {literal}"),
                })
            }
        },
    };
    let o = match classify(element(4)) {
        Element::Wildcard => Slot::Blank,
        Element::Variable(name) => Slot::Var(name.to_string()),
        Element::Literal(Value::Bool(op)) => Slot::Known(encode_op(op).to_string()),
        Element::Literal(other) => {
            return Err(FactlineError::InvalidTupleElement {
                position: 4,
                reason: format!("expected a boolean operation, got {other}"),
            })
        }
    };
    Ok(Some(QueryFact {
        slots: [e, a, v, t, o],
        value_types,
    }))
}

/// Entity and attribute positions: strings resolved through the hash index.
fn parse_hashed(reader: &HashReader, position: usize, element: &Value) -> Result<Option<Slot>> {
    match classify(element) {
        Element::Wildcard => Ok(Some(Slot::Blank)),
        Element::Variable(name) => Ok(Some(Slot::Var(name.to_string()))),
        Element::Literal(Value::String(s)) => Ok(reader.hash_of(&s)?.map(Slot::Known)),
        Element::Literal(other) => Err(FactlineError::InvalidTupleElement {
            position,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

type ParsedValue = (Slot, Option<Vec<(&'static str, String)>>);

fn parse_value(
    snapshot: &Snapshot,
    reader: &HashReader,
    attribute: &Value,
    element: &Value,
) -> Result<Option<ParsedValue>> {
    let value = match classify(element) {
        Element::Wildcard => return Ok(Some((Slot::Blank, None))),
        Element::Variable(name) => return Ok(Some((Slot::Var(name.to_string()), None))),
        Element::Literal(value) => value,
    };

    let known_type = match classify(attribute) {
        Element::Literal(Value::String(name)) => snapshot.type_for_attribute(&name).copied(),
        _ => None,
    };
    let candidates = match known_type {
        Some(value_type) => {
            let encoded = value_type.encode_checked(&value)?;
            match reader.hash_of(&encoded)? {
                Some(hash) => vec![(value_type.name, hash)],
                None => return Ok(None),
            }
        }
        None => {
            let accepting: Vec<_> = snapshot.types().accepting(&value).collect();
            if accepting.is_empty() {
                return Err(FactlineError::UnknownValueType(value.to_string()));
            }
            let mut candidates = Vec::new();
            for value_type in accepting {
                if let Some(hash) = reader.hash_of(&(value_type.encode)(&value))? {
                    candidates.push((value_type.name, hash));
                }
            }
            if candidates.is_empty() {
                return Ok(None);
            }
            candidates
        }
    };

    let distinct: HashSet<&str> = candidates.iter().map(|(_, h)| h.as_str()).collect();
    let slot = match (distinct.len(), candidates.first()) {
        (1, Some((_, hash))) => Slot::Known(hash.clone()),
        _ => Slot::Candidates,
    };
    Ok(Some((slot, Some(candidates))))
}

// ---------------------------------------------------------------------------
// Latest-value-wins reduction
// ---------------------------------------------------------------------------

/// One bound position of a result row, still in hashed form.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Raw {
    Hash(String),
    /// Value hashes decode through the type of the attribute they came with.
    Value { hash: String, attribute: String },
    Txn(u64),
    Op(bool),
}

impl Raw {
    fn of(fact: &HashFact, field: Field) -> Self {
        match field {
            Field::Entity => Raw::Hash(fact.e.clone()),
            Field::Attribute => Raw::Hash(fact.a.clone()),
            Field::Value => Raw::Value {
                hash: fact.v.clone(),
                attribute: fact.a.clone(),
            },
            Field::Txn => Raw::Txn(fact.t),
            Field::Op => Raw::Op(fact.o),
        }
    }

    fn key(&self) -> String {
        match self {
            Raw::Hash(hash) => hash.clone(),
            Raw::Value { hash, attribute } => format!("{hash}@{attribute}"),
            Raw::Txn(t) => encode_txn(*t),
            Raw::Op(o) => encode_op(*o).to_string(),
        }
    }
}

type Row = Vec<(String, Raw)>;

struct Latest {
    t: u64,
    o: bool,
    row_key: String,
}

/// Folds scanned facts into result rows, keeping the greatest-txn fact per
/// grouping key.
///
/// Grouping:
/// - attribute single-valued: `(e, a)`;
/// - attribute multi-valued, or txn position not a wildcard: `(e, a, v)`.
///
/// With the attribute unbound the set starts out grouping by `(e, a)` and
/// switches to `(e, a, v)` for the rest of the scan as soon as one fact's
/// attribute is multi-valued. Groups formed before the switch are left as they
/// are, so the outcome can depend on scan order.
struct BindingSet<'s> {
    schema: &'s Schema,
    vars: Vec<(String, Field)>,
    only_latest: bool,
    attribute_unknown: bool,
    keep_retractions: bool,
    rows: HashMap<String, Row>,
    latest_for: HashMap<String, Latest>,
    group_order: Vec<String>,
}

impl<'s> BindingSet<'s> {
    fn new(schema: &'s Schema, q: &QueryFact) -> Self {
        let vars = Field::ALL
            .into_iter()
            .filter_map(|field| match q.slot(field) {
                Slot::Var(name) => Some((name.clone(), field)),
                _ => None,
            })
            .collect();
        let txn_blank = *q.slot(Field::Txn) == Slot::Blank;
        let (attribute_unknown, multi_valued) = match q.slot(Field::Attribute) {
            Slot::Known(hash) => (false, schema.is_multi_valued_hash(hash)),
            _ => (true, false),
        };
        Self {
            schema,
            vars,
            only_latest: txn_blank && !multi_valued,
            attribute_unknown,
            keep_retractions: matches!(q.slot(Field::Op), Slot::Var(_)),
            rows: HashMap::new(),
            latest_for: HashMap::new(),
            group_order: Vec::new(),
        }
    }

    /// A variable used twice in one pattern must bind the same component.
    fn repeated_vars_agree(&self, fact: &HashFact) -> bool {
        self.vars.iter().enumerate().all(|(i, (name, field))| {
            self.vars[i + 1..]
                .iter()
                .filter(|(other, _)| other == name)
                .all(|(_, other_field)| fact.component(*field) == fact.component(*other_field))
        })
    }

    fn add(&mut self, fact: HashFact) {
        if !self.repeated_vars_agree(&fact) {
            return;
        }
        if self.only_latest && self.attribute_unknown && self.schema.is_multi_valued_hash(&fact.a)
        {
            self.only_latest = false;
        }
        let group = if self.only_latest {
            format!("{}!{}", fact.e, fact.a)
        } else {
            format!("{}!{}!{}", fact.e, fact.a, fact.v)
        };
        if self
            .latest_for
            .get(&group)
            .is_some_and(|latest| latest.t > fact.t)
        {
            return;
        }

        let row: Row = self
            .vars
            .iter()
            .map(|(name, field)| (name.clone(), Raw::of(&fact, *field)))
            .collect();
        let row_key = row
            .iter()
            .map(|(_, raw)| raw.key())
            .collect::<Vec<_>>()
            .join("!");
        self.rows.insert(row_key.clone(), row);
        if !self.latest_for.contains_key(&group) {
            self.group_order.push(group.clone());
        }
        self.latest_for.insert(
            group,
            Latest {
                t: fact.t,
                o: fact.o,
                row_key,
            },
        );
    }

    /// Rows whose group's latest fact is live (or all of them when the
    /// operation is a variable), deduplicated, in first-seen group order.
    fn into_rows(self) -> Vec<Row> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for group in &self.group_order {
            let Some(latest) = self.latest_for.get(group) else {
                continue;
            };
            if !(self.keep_retractions || latest.o) || !seen.insert(latest.row_key.as_str()) {
                continue;
            }
            if let Some(row) = self.rows.get(&latest.row_key) {
                out.push(row.clone());
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Resolves hashes back to values, looking each distinct hash up once.
struct Decoder<'a> {
    snapshot: &'a Snapshot,
    reader: &'a HashReader,
    cache: HashMap<String, String>,
}

impl<'a> Decoder<'a> {
    fn new(snapshot: &'a Snapshot, reader: &'a HashReader) -> Self {
        Self {
            snapshot,
            reader,
            cache: HashMap::new(),
        }
    }

    fn encoding(&mut self, hash: &str) -> Result<String> {
        if let Some(encoded) = self.cache.get(hash) {
            return Ok(encoded.clone());
        }
        let encoded = self.reader.encoding_of(hash)?;
        self.cache.insert(hash.to_string(), encoded.clone());
        Ok(encoded)
    }

    fn decode(&mut self, raw: &Raw) -> Result<Value> {
        match raw {
            Raw::Hash(hash) => Ok(Value::String(self.encoding(hash)?)),
            Raw::Value { hash, attribute } => {
                let value_type = self
                    .snapshot
                    .type_for_attribute_hash(attribute)
                    .copied()
                    .ok_or_else(|| {
                        FactlineError::AmbiguousValueType(format!(
                            "no registered type for the attribute of value {hash}"
                        ))
                    })?;
                let encoded = self.encoding(hash)?;
                (value_type.decode)(&encoded)
            }
            Raw::Txn(t) => Ok(Value::from(*t)),
            Raw::Op(o) => Ok(Value::Bool(*o)),
        }
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Match one pattern against a snapshot.
///
/// Returns one binding per live match, each merged over `binding`. A literal
/// that was never stored yields `Ok(vec![])`.
///
/// ```rust,no_run
/// use factline::Connection;
/// use serde_json::json;
///
/// let conn = Connection::open_in_memory().unwrap();
/// conn.transact(
///     &json!([["01", "_db/attribute", "color"], ["01", "_db/type", "String"]]),
///     &json!({}),
/// )
/// .unwrap();
/// let snap = conn
///     .transact(&json!([["sky", "color", "blue"]]), &json!({}))
///     .unwrap();
/// let rows = factline::query(&snap, &json!(["sky", "color", "?c"]), &json!({})).unwrap();
/// assert_eq!(rows[0]["?c"], "blue");
/// ```
pub fn query(snapshot: &Snapshot, pattern: &Value, binding: &Value) -> Result<Vec<Binding>> {
    let tuple = pattern
        .as_array()
        .ok_or_else(|| FactlineError::MalformedInput("pattern must be a list".into()))?;
    if tuple.len() > POSITIONS {
        return Err(FactlineError::MalformedInput(format!(
            "pattern has {} positions, at most {POSITIONS} allowed",
            tuple.len()
        )));
    }
    let binding = as_binding(binding)?;
    let tuple = bind_to_tuple(tuple, &binding);

    let read_txn = snapshot.db().begin_read()?;
    let reader = HashReader::open(&read_txn)?;
    let Some(q) = parse_tuple(snapshot, &reader, &tuple)? else {
        return Ok(Vec::new());
    };
    let plan = ScanPlan::for_pattern(&q.key_pattern());
    tracing::trace!(
        target: "factline::query",
        index = %plan.index,
        prefix = %plan.prefix,
        txn = snapshot.txn(),
        "scanning"
    );

    let facts = read_txn.open_table(FACTS)?;
    let mut set = BindingSet::new(snapshot.schema(), &q);
    for entry in facts.range(plan.prefix.as_str()..)? {
        let (guard, _) = entry?;
        let key = guard.value();
        if !key.starts_with(&plan.prefix) {
            break;
        }
        let Some(fact) = plan.matches(key)? else {
            continue;
        };
        if fact.t > snapshot.txn() || !q.accepts_value(snapshot, &fact) {
            continue;
        }
        set.add(fact);
    }

    let mut decoder = Decoder::new(snapshot, &reader);
    set.into_rows()
        .into_iter()
        .map(|row| {
            let mut out = binding.clone();
            for (name, raw) in row {
                out.insert(name, decoder.decode(&raw)?);
            }
            Ok(out)
        })
        .collect()
}

/// Join several patterns: each one runs once per binding produced so far.
pub fn q(snapshot: &Snapshot, patterns: &Value, bindings: &Value) -> Result<Vec<Binding>> {
    let patterns = patterns
        .as_array()
        .ok_or_else(|| FactlineError::MalformedInput("patterns must be a list".into()))?;
    let bindings = bindings
        .as_array()
        .ok_or_else(|| FactlineError::MalformedInput("bindings must be a list".into()))?;

    let mut current: Vec<Binding> = bindings.iter().map(as_binding).collect::<Result<_>>()?;
    for pattern in patterns {
        let mut next = Vec::new();
        for binding in current {
            next.extend(query(snapshot, pattern, &Value::Object(binding))?);
        }
        current = next;
    }
    Ok(current)
}

/// Every live attribute of `entity`, keyed by attribute name. Multi-valued
/// attributes map to an array. `None` when nothing about the entity is live.
pub fn get_entity(snapshot: &Snapshot, entity: &str) -> Result<Option<Binding>> {
    let subject = escape(&Value::from(entity));
    let mut names: Vec<String> = query(snapshot, &json!([subject, "?attribute"]), &json!({}))?
        .into_iter()
        .filter_map(|mut row| match row.remove("?attribute") {
            Some(Value::String(name)) => Some(name),
            _ => None,
        })
        .collect();
    names.sort();
    names.dedup();

    // One query per attribute, so each is grouped by its own cardinality.
    let mut out = Binding::new();
    for name in names {
        let pattern = json!([subject, escape(&Value::from(name.as_str())), "?value"]);
        let values: Vec<Value> = query(snapshot, &pattern, &json!({}))?
            .into_iter()
            .filter_map(|mut row| row.remove("?value"))
            .collect();
        let multi_valued = snapshot
            .schema()
            .attribute(&name)
            .is_some_and(|def| def.multi_valued);
        let value = if multi_valued {
            if values.is_empty() {
                continue;
            }
            Value::Array(values)
        } else {
            match values.into_iter().next() {
                Some(value) => value,
                None => continue,
            }
        };
        out.insert(name, value);
    }
    Ok((!out.is_empty()).then_some(out))
}
