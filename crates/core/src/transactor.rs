//! The single writer.
//!
//! `transact` calls are admitted through a ticket queue: a call takes the next
//! ticket when it arrives and runs only once every earlier ticket is done, so
//! batches commit strictly in submission order. A batch is validated in full
//! before anything is written; a rejected batch writes nothing and consumes no
//! txn number.
//!
//! Readers never touch the queue. The published head (latest txn + catalog)
//! sits behind its own lock that is only held long enough to clone two values.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use chrono::Utc;
use redb::{Database, ReadableDatabase};
use serde_json::Value;

use crate::error::{FactlineError, Result};
use crate::hash_index::HashWriter;
use crate::index::{HashFact, IndexOrder, MAX_TXN};
use crate::query::{as_binding, bind_to_tuple, unescape, Binding, WILDCARD};
use crate::schema::{self, Schema, DB_TYPE};
use crate::snapshot::Snapshot;
use crate::storage::{self, TxnRecord, FACTS};
use crate::types::TypeRegistry;

#[derive(Clone)]
struct Head {
    txn: u64,
    schema: Arc<Schema>,
}

struct Queue {
    next_ticket: u64,
    serving: u64,
}

/// Releases the writer to the next ticket, even if the batch failed.
struct Turn<'a> {
    transactor: &'a Transactor,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut queue = self.transactor.lock_queue();
        queue.serving += 1;
        self.transactor.turn.notify_all();
    }
}

/// A validated fact, ready to be hashed and written.
struct PendingFact {
    entity: String,
    attribute: String,
    encoded_value: String,
    op: bool,
}

pub(crate) struct Transactor {
    db: Arc<Database>,
    types: Arc<TypeRegistry>,
    head: RwLock<Head>,
    queue: Mutex<Queue>,
    turn: Condvar,
}

impl Transactor {
    /// Resume from whatever the store already holds.
    pub(crate) fn open(db: Arc<Database>, types: Arc<TypeRegistry>) -> Result<Self> {
        storage::init(&db)?;
        let (txn, schema) = {
            let read_txn = db.begin_read()?;
            let txn = storage::last_txn(&read_txn)?;
            (txn, Schema::load(&read_txn, txn)?)
        };
        tracing::debug!(target: "factline::transactor", txn, "transactor ready");
        Ok(Self {
            db,
            types,
            head: RwLock::new(Head {
                txn,
                schema: Arc::new(schema),
            }),
            queue: Mutex::new(Queue {
                next_ticket: 0,
                serving: 0,
            }),
            turn: Condvar::new(),
        })
    }

    fn lock_queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until every earlier caller has finished.
    fn admit(&self) -> Turn<'_> {
        let mut queue = self.lock_queue();
        let ticket = queue.next_ticket;
        queue.next_ticket += 1;
        while queue.serving != ticket {
            queue = self
                .turn
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
        Turn { transactor: self }
    }

    fn head(&self) -> Result<Head> {
        self.head
            .read()
            .map(|head| head.clone())
            .map_err(|_| FactlineError::Internal("head lock poisoned".into()))
    }

    fn publish(&self, txn: u64, schema: Arc<Schema>) -> Result<()> {
        let mut head = self
            .head
            .write()
            .map_err(|_| FactlineError::Internal("head lock poisoned".into()))?;
        *head = Head { txn, schema };
        Ok(())
    }

    /// Snapshot of the latest published commit.
    pub(crate) fn snap(&self) -> Result<Snapshot> {
        let head = self.head()?;
        Ok(Snapshot::new(
            self.db.clone(),
            head.txn,
            self.types.clone(),
            head.schema,
        ))
    }

    /// Snapshot bound to an earlier txn, with the catalog as it stood then.
    pub(crate) fn as_of(&self, txn: u64) -> Result<Snapshot> {
        let head = self.head()?;
        if txn > head.txn {
            return Err(FactlineError::MalformedInput(format!(
                "txn {txn} is beyond the latest commit {}",
                head.txn
            )));
        }
        let schema = if txn == head.txn {
            head.schema
        } else {
            let read_txn = self.db.begin_read()?;
            Arc::new(Schema::load(&read_txn, txn)?)
        };
        Ok(Snapshot::new(self.db.clone(), txn, self.types.clone(), schema))
    }

    pub(crate) fn txn_record(&self, txn: u64) -> Result<Option<TxnRecord>> {
        let read_txn = self.db.begin_read()?;
        storage::read_txn_record(&read_txn, txn)
    }

    /// Validate and commit one batch under the next txn number.
    pub(crate) fn transact(&self, facts: &Value, binding: &Value) -> Result<Snapshot> {
        let _turn = self.admit();
        let result = self.commit(facts, binding);
        match &result {
            Ok(snapshot) => tracing::debug!(
                target: "factline::transactor",
                txn = snapshot.txn(),
                "committed transaction"
            ),
            Err(e) => tracing::warn!(
                target: "factline::transactor",
                error = %e,
                "transaction rejected"
            ),
        }
        result
    }

    fn commit(&self, facts: &Value, binding: &Value) -> Result<Snapshot> {
        let head = self.head()?;
        let binding = as_binding(binding)?;
        let facts = facts
            .as_array()
            .ok_or_else(|| FactlineError::MalformedInput("facts must be a list".into()))?;
        if facts.is_empty() {
            return Err(FactlineError::MalformedInput(
                "a transaction needs at least one fact".into(),
            ));
        }
        let pending = facts
            .iter()
            .map(|fact| self.prepare(&head.schema, fact, &binding))
            .collect::<Result<Vec<_>>>()?;

        let txn = head.txn + 1;
        if txn > MAX_TXN {
            return Err(FactlineError::Internal(format!(
                "txn counter exhausted at {}",
                head.txn
            )));
        }

        let write_txn = self.db.begin_write()?;
        {
            let mut hashes = HashWriter::open(&write_txn)?;
            let mut table = write_txn.open_table(FACTS)?;
            for fact in &pending {
                let stored = HashFact {
                    e: hashes.get_or_create(&fact.entity)?,
                    a: hashes.get_or_create(&fact.attribute)?,
                    v: hashes.get_or_create(&fact.encoded_value)?,
                    t: txn,
                    o: fact.op,
                };
                for index in IndexOrder::ALL {
                    table.insert(stored.key(index).as_str(), ())?;
                }
            }
        }
        storage::write_txn_record(
            &write_txn,
            &TxnRecord {
                txn,
                committed_at: Utc::now(),
                fact_count: pending.len(),
            },
        )?;
        write_txn.commit()?;

        let schema_changed = pending.iter().any(|f| schema::is_reserved(&f.attribute));
        let schema = if schema_changed {
            let reloaded = self
                .db
                .begin_read()
                .map_err(FactlineError::from)
                .and_then(|read_txn| Schema::load(&read_txn, txn));
            match reloaded {
                Ok(schema) => Arc::new(schema),
                Err(e) => {
                    // The txn is durable; never hand its number out again.
                    self.publish(txn, head.schema)?;
                    return Err(e);
                }
            }
        } else {
            head.schema
        };
        self.publish(txn, schema.clone())?;
        Ok(Snapshot::new(self.db.clone(), txn, self.types.clone(), schema))
    }

    fn prepare(&self, schema: &Schema, fact: &Value, binding: &Binding) -> Result<PendingFact> {
        let elements = fact
            .as_array()
            .ok_or_else(|| FactlineError::MalformedInput("each fact must be a list".into()))?;
        let elements = bind_to_tuple(elements, binding);
        let op = match elements.len() {
            3 => true,
            4 => expect_op(&elements[3], 3)?,
            5 => {
                if !(elements[3].is_null() || elements[3] == WILDCARD) {
                    return Err(FactlineError::InvalidTupleElement {
                        position: 3,
                        reason: "the txn is assigned by the transactor".into(),
                    });
                }
                expect_op(&elements[4], 4)?
            }
            n => {
                return Err(FactlineError::MalformedInput(format!(
                    "a fact has 3 to 5 positions, got {n}"
                )))
            }
        };
        let entity = ground_string(&elements[0], 0)?;
        let attribute = ground_string(&elements[1], 1)?;
        let value = ground_value(&elements[2])?;

        let def = schema
            .attribute(&attribute)
            .ok_or_else(|| FactlineError::AttributeNotFound(attribute.clone()))?;
        let value_type = self
            .types
            .get(&def.type_name)
            .ok_or_else(|| FactlineError::UnknownValueType(def.type_name.clone()))?;
        let encoded_value = value_type.encode_checked(&value)?;
        if attribute == DB_TYPE && !self.types.contains(&encoded_value) {
            return Err(FactlineError::InvalidValueType {
                type_name: "registered type name".into(),
                value: value.to_string(),
            });
        }

        Ok(PendingFact {
            entity,
            attribute,
            encoded_value,
            op,
        })
    }
}

fn expect_op(element: &Value, position: usize) -> Result<bool> {
    element
        .as_bool()
        .ok_or_else(|| FactlineError::InvalidTupleElement {
            position,
            reason: format!("expected a boolean operation, got {element}"),
        })
}

fn unbound(position: usize, name: &str) -> FactlineError {
    FactlineError::InvalidTupleElement {
        position,
        reason: format!("unbound variable {name}"),
    }
}

fn ground_string(element: &Value, position: usize) -> Result<String> {
    match element {
        Value::String(s) if s.starts_with('?') => Err(unbound(position, s)),
        Value::String(s) => Ok(unescape(s).to_string()),
        other => Err(FactlineError::InvalidTupleElement {
            position,
            reason: format!("expected a string, got {other}"),
        }),
    }
}

fn ground_value(element: &Value) -> Result<Value> {
    match element {
        Value::String(s) if s.starts_with('?') => Err(unbound(2, s)),
        Value::String(s) => Ok(Value::String(unescape(s).to_string())),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn memory_transactor() -> Transactor {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend).unwrap();
        Transactor::open(Arc::new(db), Arc::new(TypeRegistry::default())).unwrap()
    }

    fn wait_for_tickets(transactor: &Transactor, issued: u64) {
        while transactor.lock_queue().next_ticket < issued {
            std::thread::yield_now();
        }
    }

    #[test]
    fn batches_commit_in_ticket_order() {
        let transactor = memory_transactor();
        transactor
            .transact(
                &json!([["01", "_db/attribute", "color"], ["01", "_db/type", "String"]]),
                &json!({}),
            )
            .unwrap();

        let batches = [
            json!([["sky", "color", "blue"]]),
            json!([["sky", 111, "blue"]]),
            json!([["grass", "color", "green"]]),
        ];
        let results: Vec<Result<u64>> = std::thread::scope(|s| {
            // Hold the writer so every batch below queues behind this turn.
            let turn = transactor.admit();
            let issued = transactor.lock_queue().next_ticket;
            let mut handles = Vec::new();
            for (i, batch) in batches.iter().enumerate() {
                let transactor = &transactor;
                handles.push(s.spawn(move || {
                    transactor
                        .transact(batch, &json!({}))
                        .map(|snap| snap.txn())
                }));
                wait_for_tickets(transactor, issued + i as u64 + 1);
            }
            assert_eq!(transactor.head().unwrap().txn, 1, "nothing commits while held");
            drop(turn);
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(results[0].as_ref().unwrap(), &2);
        assert!(matches!(
            results[1],
            Err(FactlineError::InvalidTupleElement { position: 1, .. })
        ));
        assert_eq!(results[2].as_ref().unwrap(), &3);
        assert_eq!(transactor.snap().unwrap().txn(), 3);
    }

    #[test]
    fn rejected_batch_releases_the_writer() {
        let transactor = memory_transactor();
        assert!(transactor.transact(&json!([["sky", "color", "blue"]]), &json!({})).is_err());
        let queue = transactor.lock_queue();
        assert_eq!(queue.serving, queue.next_ticket);
    }
}
