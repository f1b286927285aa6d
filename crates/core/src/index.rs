//! Index router and key codec.
//!
//! Every fact is written four times, once per physical ordering, as a key of
//! the form `"<index>!<c1>!<c2>!<c3>!<txn36>!<0|1>"`. All keys are ASCII and
//! every component is `!`-free, so byte order on the store equals component
//! order within an index.
//!
//! A query pattern classifies each of entity, attribute, value and txn as
//! known or unknown; [`select_index`] maps the 16 combinations onto an
//! ordering and [`ScanPlan`] turns the known components into a key prefix plus
//! a residual check for known components that sit after the first gap.

use crate::error::{FactlineError, Result};

const SEPARATOR: char = '!';
const TXN_WIDTH: usize = 6;
const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Largest txn that still fits the fixed-width key component.
pub const MAX_TXN: u64 = 36u64.pow(TXN_WIDTH as u32) - 1;

/// One position of a quintuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Entity,
    Attribute,
    Value,
    Txn,
    Op,
}

impl Field {
    /// Pattern order.
    pub const ALL: [Field; 5] = [
        Field::Entity,
        Field::Attribute,
        Field::Value,
        Field::Txn,
        Field::Op,
    ];

    /// Index of this field within a pattern tuple.
    pub fn position(self) -> usize {
        match self {
            Field::Entity => 0,
            Field::Attribute => 1,
            Field::Value => 2,
            Field::Txn => 3,
            Field::Op => 4,
        }
    }
}

/// The four physical orderings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOrder {
    Eavt,
    Avet,
    Vaet,
    Teav,
}

impl IndexOrder {
    pub const ALL: [IndexOrder; 4] = [
        IndexOrder::Eavt,
        IndexOrder::Avet,
        IndexOrder::Vaet,
        IndexOrder::Teav,
    ];

    /// Key prefix; also spells the field order.
    pub fn name(self) -> &'static str {
        match self {
            IndexOrder::Eavt => "eavto",
            IndexOrder::Avet => "aveto",
            IndexOrder::Vaet => "vaeto",
            IndexOrder::Teav => "teavo",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|i| i.name() == name)
    }

    pub fn fields(self) -> [Field; 5] {
        use Field::*;
        match self {
            IndexOrder::Eavt => [Entity, Attribute, Value, Txn, Op],
            IndexOrder::Avet => [Attribute, Value, Entity, Txn, Op],
            IndexOrder::Vaet => [Value, Attribute, Entity, Txn, Op],
            IndexOrder::Teav => [Txn, Entity, Attribute, Value, Op],
        }
    }

    /// Every key of this index starts with this string.
    pub fn key_space(self) -> String {
        format!("{}{SEPARATOR}", self.name())
    }
}

impl std::fmt::Display for IndexOrder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A quintuple as stored: hashes for e/a/v, numeric txn, boolean op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashFact {
    pub e: String,
    pub a: String,
    pub v: String,
    pub t: u64,
    pub o: bool,
}

impl HashFact {
    /// The key-component form of a field.
    pub fn component(&self, field: Field) -> String {
        match field {
            Field::Entity => self.e.clone(),
            Field::Attribute => self.a.clone(),
            Field::Value => self.v.clone(),
            Field::Txn => encode_txn(self.t),
            Field::Op => encode_op(self.o).to_string(),
        }
    }

    pub fn key(&self, index: IndexOrder) -> String {
        let mut key = String::from(index.name());
        for field in index.fields() {
            key.push(SEPARATOR);
            key.push_str(&self.component(field));
        }
        key
    }
}

pub fn encode_txn(txn: u64) -> String {
    to_padded_base36(txn, TXN_WIDTH)
}

pub fn encode_op(op: bool) -> &'static str {
    if op {
        "1"
    } else {
        "0"
    }
}

fn to_padded_base36(mut n: u64, width: usize) -> String {
    let mut digits = Vec::with_capacity(width);
    loop {
        digits.push(BASE36_DIGITS[(n % 36) as usize]);
        n /= 36;
        if n == 0 {
            break;
        }
    }
    while digits.len() < width {
        digits.push(b'0');
    }
    digits.reverse();
    // Only ASCII digits were pushed.
    String::from_utf8(digits).unwrap_or_default()
}

/// Parse any index key back into its quintuple.
pub fn parse_key(key: &str) -> Result<HashFact> {
    let corrupt = || FactlineError::Storage(format!("corrupt fact key {key:?}"));
    let mut parts = key.split(SEPARATOR);
    let index = parts
        .next()
        .and_then(IndexOrder::from_name)
        .ok_or_else(corrupt)?;
    let mut slots: [&str; 5] = [""; 5];
    for field in index.fields() {
        slots[field.position()] = parts.next().ok_or_else(corrupt)?;
    }
    if parts.next().is_some() {
        return Err(corrupt());
    }
    let t = u64::from_str_radix(slots[3], 36).map_err(|_| corrupt())?;
    let o = match slots[4] {
        "1" => true,
        "0" => false,
        _ => return Err(corrupt()),
    };
    Ok(HashFact {
        e: slots[0].to_string(),
        a: slots[1].to_string(),
        v: slots[2].to_string(),
        t,
        o,
    })
}

/// Which of entity / attribute / value / txn are bound to a single
/// representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Knowns {
    pub e: bool,
    pub a: bool,
    pub v: bool,
    pub t: bool,
}

/// Pick the ordering whose leading fields cover the most of the pattern.
pub fn select_index(k: Knowns) -> IndexOrder {
    match (k.e, k.a, k.v, k.t) {
        (_, _, _, true) => IndexOrder::Teav,
        (true, _, _, false) => IndexOrder::Eavt,
        (false, false, false, false) => IndexOrder::Eavt,
        (false, true, _, false) => IndexOrder::Avet,
        (false, false, true, false) => IndexOrder::Vaet,
    }
}

/// A bound pattern as the router sees it: one optional key component per
/// quintuple slot (entity, attribute, value, txn, op).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyPattern {
    pub components: [Option<String>; 5],
}

impl KeyPattern {
    pub fn knowns(&self) -> Knowns {
        Knowns {
            e: self.components[0].is_some(),
            a: self.components[1].is_some(),
            v: self.components[2].is_some(),
            t: self.components[3].is_some(),
        }
    }

    fn get(&self, field: Field) -> Option<&str> {
        self.components[field.position()].as_deref()
    }
}

/// Scan range plus residual predicate for one pattern.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub index: IndexOrder,
    /// Every matching key starts with this.
    pub prefix: String,
    /// Known components that could not be folded into the prefix.
    residual: Vec<(Field, String)>,
}

impl ScanPlan {
    pub fn for_pattern(pattern: &KeyPattern) -> Self {
        Self::build(select_index(pattern.knowns()), pattern)
    }

    pub fn build(index: IndexOrder, pattern: &KeyPattern) -> Self {
        let mut prefix = index.key_space();
        let mut residual = Vec::new();
        let mut found_gap = false;
        for field in index.fields() {
            match pattern.get(field) {
                // The op closes the key, so it never joins the prefix.
                Some(component) if !found_gap && field != Field::Op => {
                    prefix.push_str(component);
                    prefix.push(SEPARATOR);
                }
                Some(component) => residual.push((field, component.to_string())),
                None => found_gap = true,
            }
        }
        Self {
            index,
            prefix,
            residual,
        }
    }

    /// Parse `key` and return it if every residual component matches.
    pub fn matches(&self, key: &str) -> Result<Option<HashFact>> {
        if !key.starts_with(&self.prefix) {
            return Ok(None);
        }
        let fact = parse_key(key)?;
        let all_match = self
            .residual
            .iter()
            .all(|(field, component)| fact.component(*field) == *component);
        Ok(all_match.then_some(fact))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fact() -> HashFact {
        HashFact {
            e: "e1".into(),
            a: "a1".into(),
            v: "v1".into(),
            t: 42,
            o: true,
        }
    }

    fn pattern(e: Option<&str>, a: Option<&str>, v: Option<&str>, t: Option<u64>) -> KeyPattern {
        KeyPattern {
            components: [
                e.map(String::from),
                a.map(String::from),
                v.map(String::from),
                t.map(encode_txn),
                None,
            ],
        }
    }

    #[test]
    fn txn_encoding_is_fixed_width_and_sortable() {
        assert_eq!(encode_txn(0), "000000");
        assert_eq!(encode_txn(35), "00000z");
        assert_eq!(encode_txn(36), "000010");
        assert_eq!(encode_txn(MAX_TXN), "zzzzzz");
        let mut previous = encode_txn(0);
        for n in [1, 9, 10, 35, 36, 1295, 1296, 99_999, MAX_TXN] {
            let current = encode_txn(n);
            assert!(current > previous, "{current} should sort after {previous}");
            assert_eq!(u64::from_str_radix(&current, 36).unwrap(), n);
            previous = current;
        }
    }

    #[test]
    fn keys_parse_back_from_every_ordering() {
        let f = fact();
        for index in IndexOrder::ALL {
            let key = f.key(index);
            assert!(key.starts_with(&index.key_space()));
            assert_eq!(parse_key(&key).unwrap(), f, "{index}");
        }
        assert_eq!(f.key(IndexOrder::Avet), "aveto!a1!v1!e1!000016!1");
    }

    #[test]
    fn corrupt_keys_are_storage_errors() {
        for key in ["nope!a!b", "eavto!e!a!v!000001", "eavto!e!a!v!000001!2", "eavto!e!a!v!!1"] {
            assert!(matches!(parse_key(key), Err(FactlineError::Storage(_))), "{key}");
        }
    }

    #[test]
    fn index_selection_is_total_over_all_combinations() {
        use IndexOrder::*;
        let expected = [
            // (e, a, v, t) => index
            ((false, false, false, false), Eavt),
            ((true, false, false, false), Eavt),
            ((true, true, false, false), Eavt),
            ((true, false, true, false), Eavt),
            ((true, true, true, false), Eavt),
            ((false, true, false, false), Avet),
            ((false, true, true, false), Avet),
            ((false, false, true, false), Vaet),
            ((false, false, false, true), Teav),
            ((true, false, false, true), Teav),
            ((true, true, false, true), Teav),
            ((true, false, true, true), Teav),
            ((true, true, true, true), Teav),
            ((false, true, false, true), Teav),
            ((false, true, true, true), Teav),
            ((false, false, true, true), Teav),
        ];
        assert_eq!(expected.len(), 16);
        for ((e, a, v, t), index) in expected {
            assert_eq!(select_index(Knowns { e, a, v, t }), index, "{e} {a} {v} {t}");
        }
    }

    #[test]
    fn prefix_stops_at_first_gap_and_rest_is_residual() {
        // entity + value known, attribute unknown: eavto with a gap at `a`.
        let plan = ScanPlan::for_pattern(&pattern(Some("e1"), None, Some("v1"), None));
        assert_eq!(plan.index, IndexOrder::Eavt);
        assert_eq!(plan.prefix, "eavto!e1!");

        let f = fact();
        assert_eq!(plan.matches(&f.key(IndexOrder::Eavt)).unwrap(), Some(f.clone()));
        let other = HashFact {
            v: "v2".into(),
            ..f.clone()
        };
        assert_eq!(plan.matches(&other.key(IndexOrder::Eavt)).unwrap(), None);
    }

    #[test]
    fn full_prefix_when_everything_leading_is_known() {
        let plan = ScanPlan::for_pattern(&pattern(None, Some("a1"), Some("v1"), None));
        assert_eq!(plan.index, IndexOrder::Avet);
        assert_eq!(plan.prefix, "aveto!a1!v1!");

        let plan = ScanPlan::for_pattern(&pattern(Some("e1"), None, None, Some(42)));
        assert_eq!(plan.index, IndexOrder::Teav);
        assert_eq!(plan.prefix, "teavo!000016!e1!");

        let plan = ScanPlan::for_pattern(&KeyPattern::default());
        assert_eq!(plan.prefix, "eavto!");
    }

    #[test]
    fn known_operation_is_checked_as_residual() {
        let mut p = pattern(Some("e1"), Some("a1"), Some("v1"), Some(42));
        p.components[4] = Some(encode_op(false).to_string());
        let plan = ScanPlan::for_pattern(&p);
        assert_eq!(plan.prefix, "teavo!000016!e1!a1!v1!");
        assert_eq!(plan.matches(&fact().key(IndexOrder::Teav)).unwrap(), None);
        let retraction = HashFact { o: false, ..fact() };
        assert!(plan
            .matches(&retraction.key(IndexOrder::Teav))
            .unwrap()
            .is_some());
    }
}
