//! Buffered declarations and the sink boundary
//!
//! A [`Transaction`] collects table/chain/set/rule declarations client-side.
//! Nothing reaches the kernel until [`Transaction::flush`], which hands the
//! whole batch to the [`Sink`] in one call. The sink commits it atomically or
//! rejects it as a whole.
//!
//! There is no rollback of an already committed batch. Recovering from a
//! later failure means committing a new corrective batch.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::{Error, Result};
use super::rule::{Rule, RuleData};
use super::ruleset::{Chain, Table};
use super::sets::{Set, SetElement};

/// One queued change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Declaration {
    /// Removes every table, chain, set and rule
    FlushRuleset,
    AddTable(Table),
    AddChain(Chain),
    AddSet {
        set: Set,
        elements: Vec<SetElement>,
    },
    SetAddElements {
        set: Set,
        elements: Vec<SetElement>,
    },
    SetDeleteElements {
        set: Set,
        elements: Vec<SetElement>,
    },
    AddRule(Rule),
    InsertRule {
        rule: Rule,
        before: Option<u64>,
    },
    DeleteRule {
        table: Table,
        chain: String,
        handle: u64,
    },
}

/// Destination of committed batches.
///
/// Implementations must apply a batch all-or-nothing. Adding an element that
/// is already present and deleting one that is absent must not fail.
pub trait Sink {
    fn commit(&mut self, batch: &[Declaration]) -> Result<()>;

    /// Installed rules of a chain in evaluation order
    fn list_rules(&self, table: &Table, chain: &str) -> Result<Vec<RuleData>>;

    fn list_set_elements(&self, set: &Set) -> Result<Vec<SetElement>>;

    fn set_exists(&self, table: &Table, name: &str) -> bool;
}

/// SHA-256 of the JSON form of a batch
pub fn fingerprint(batch: &[Declaration]) -> String {
    let json = serde_json::to_string(batch).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Client-side batch bound to a sink.
///
/// Dropping a transaction with queued declarations discards them (with a
/// warning); the caller must [`flush`](Self::flush).
pub struct Transaction<'a, S: Sink> {
    sink: &'a mut S,
    id: Uuid,
    batch: Vec<Declaration>,
    next_set_id: u32,
    declared_sets: HashMap<(Table, String), Set>,
    reset: bool,
}

impl<'a, S: Sink> Transaction<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        let id = Uuid::new_v4();
        debug!("Begin transaction {id}");
        Self {
            sink,
            id,
            batch: Vec::new(),
            next_set_id: 1,
            declared_sets: HashMap::new(),
            reset: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Declarations queued so far
    pub fn pending(&self) -> &[Declaration] {
        &self.batch
    }

    pub fn flush_ruleset(&mut self) {
        self.batch.push(Declaration::FlushRuleset);
        self.declared_sets.clear();
        self.reset = true;
    }

    pub fn add_table(&mut self, table: &Table) {
        self.batch.push(Declaration::AddTable(table.clone()));
    }

    pub fn add_chain(&mut self, chain: &Chain) {
        self.batch.push(Declaration::AddChain(chain.clone()));
    }

    /// Declares a set with initial elements and returns it as declared.
    ///
    /// Anonymous sets get a generated name here; every set gets an id that
    /// is unique within this transaction. Rules must reference the returned
    /// value.
    pub fn add_set(&mut self, mut set: Set, elements: Vec<SetElement>) -> Result<Set> {
        set.id = self.next_set_id;
        self.next_set_id += 1;
        if set.flags.anonymous && set.name.is_empty() {
            let table = table_of(&set);
            let mut n = set.id;
            // skip names still held by anonymous sets of earlier batches
            while self.known_set(&table, &format!("__set{n}")) {
                n += 1;
            }
            set.name = format!("__set{n}");
            self.next_set_id = self.next_set_id.max(n + 1);
        }
        if set.name.is_empty() {
            return Err(Error::Configuration("named set without a name".to_string()));
        }
        set.check_elements(&elements)?;

        self.declared_sets
            .insert((table_of(&set), set.name.clone()), set.clone());
        self.batch.push(Declaration::AddSet {
            set: set.clone(),
            elements,
        });
        Ok(set)
    }

    fn known_set(&self, table: &Table, name: &str) -> bool {
        self.declared_sets
            .contains_key(&(table.clone(), name.to_string()))
            || (!self.reset && self.sink.set_exists(table, name))
    }

    fn require_set(&self, table: &Table, name: &str) -> Result<()> {
        if self.known_set(table, name) {
            Ok(())
        } else {
            Err(Error::transaction(format!(
                "set {name} does not exist in table {} {}",
                table.family.nft_name(),
                table.name
            )))
        }
    }

    pub fn set_add_elements(&mut self, set: &Set, elements: Vec<SetElement>) -> Result<()> {
        if elements.is_empty() {
            return Ok(());
        }
        set.check_elements(&elements)?;
        self.require_set(&table_of(set), &set.name)?;
        self.batch.push(Declaration::SetAddElements {
            set: set.clone(),
            elements,
        });
        Ok(())
    }

    pub fn set_delete_elements(&mut self, set: &Set, elements: Vec<SetElement>) -> Result<()> {
        if elements.is_empty() {
            return Ok(());
        }
        set.check_elements(&elements)?;
        self.require_set(&table_of(set), &set.name)?;
        self.batch.push(Declaration::SetDeleteElements {
            set: set.clone(),
            elements,
        });
        Ok(())
    }

    fn check_rule_sets(&self, rule: &Rule) -> Result<()> {
        for set in rule.data.exprs.referenced_sets() {
            self.require_set(&rule.table, &set.name)?;
        }
        Ok(())
    }

    pub(crate) fn add_rule(&mut self, rule: Rule) -> Result<()> {
        self.check_rule_sets(&rule)?;
        self.batch.push(Declaration::AddRule(rule));
        Ok(())
    }

    pub(crate) fn insert_rule(&mut self, rule: Rule, before: Option<u64>) -> Result<()> {
        self.check_rule_sets(&rule)?;
        self.batch.push(Declaration::InsertRule { rule, before });
        Ok(())
    }

    pub(crate) fn delete_rule(&mut self, table: &Table, chain: &str, handle: u64) {
        self.batch.push(Declaration::DeleteRule {
            table: table.clone(),
            chain: chain.to_string(),
            handle,
        });
    }

    pub fn list_rules(&self, table: &Table, chain: &str) -> Result<Vec<RuleData>> {
        self.sink.list_rules(table, chain)
    }

    pub fn list_set_elements(&self, set: &Set) -> Result<Vec<SetElement>> {
        self.sink.list_set_elements(set)
    }

    /// Fingerprint of the queued batch
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.batch)
    }

    /// Commits the queued batch. An empty batch is a no-op.
    pub fn flush(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            debug!("Transaction {} has nothing to flush", self.id);
            return Ok(());
        }
        let batch = std::mem::take(&mut self.batch);
        self.declared_sets.clear();
        self.reset = false;

        info!(
            "Flushing transaction {} ({} declarations)",
            self.id,
            batch.len()
        );
        match self.sink.commit(&batch) {
            Ok(()) => {
                info!("Transaction {} committed", self.id);
                Ok(())
            }
            Err(e) => {
                error!("Transaction {} rejected: {e}", self.id);
                Err(e)
            }
        }
    }
}

impl<S: Sink> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if !self.batch.is_empty() {
            warn!(
                "Transaction {} dropped with {} unflushed declarations",
                self.id,
                self.batch.len()
            );
        }
    }
}

fn table_of(set: &Set) -> Table {
    Table::new(set.family, set.table.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::family::AddressFamily;
    use crate::core::memory::MemorySink;
    use crate::core::sets::SetKeyType;

    fn filter() -> Table {
        Table::new(AddressFamily::Ipv4, "filter")
    }

    #[test]
    fn test_empty_flush_does_not_commit() {
        let mut sink = MemorySink::new();
        let mut tx = Transaction::new(&mut sink);
        tx.flush().unwrap();
        drop(tx);
        assert_eq!(sink.commits(), 0);
    }

    #[test]
    fn test_anonymous_sets_get_unique_names() {
        let mut sink = MemorySink::new();
        let mut tx = Transaction::new(&mut sink);
        tx.add_table(&filter());
        let a = tx
            .add_set(Set::anonymous(&filter(), SetKeyType::InetService), vec![])
            .unwrap();
        let b = tx
            .add_set(Set::anonymous(&filter(), SetKeyType::InetService), vec![])
            .unwrap();
        assert_ne!(a.name, b.name);
        assert_ne!(a.id, b.id);
        assert!(a.name.starts_with("__set"));
        tx.flush().unwrap();
    }

    #[test]
    fn test_elements_require_declared_set() {
        let mut sink = MemorySink::new();
        let mut tx = Transaction::new(&mut sink);
        let set = Set::addresses(&filter(), "trust");
        let elements = set.elements_from_specs(&["10.0.0.1"]).unwrap();
        let err = tx.set_add_elements(&set, elements).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_flush_ruleset_forgets_sink_sets() {
        let mut sink = MemorySink::new();
        {
            let mut tx = Transaction::new(&mut sink);
            tx.add_table(&filter());
            tx.add_set(Set::addresses(&filter(), "trust"), vec![]).unwrap();
            tx.flush().unwrap();
        }
        let mut tx = Transaction::new(&mut sink);
        let set = Set::addresses(&filter(), "trust");
        let elements = set.elements_from_specs(&["10.0.0.1"]).unwrap();
        assert!(tx.set_add_elements(&set, elements.clone()).is_ok());
        tx.flush_ruleset();
        assert!(tx.set_add_elements(&set, elements).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let batch = vec![Declaration::FlushRuleset, Declaration::AddTable(filter())];
        assert_eq!(fingerprint(&batch), fingerprint(&batch.clone()));
        assert_eq!(fingerprint(&batch).len(), 64);
        assert_ne!(fingerprint(&batch), fingerprint(&batch[..1]));
    }
}
