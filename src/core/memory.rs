//! In-memory kernel model
//!
//! [`MemorySink`] keeps tables, chains, sets and rules the way the kernel
//! would after each committed batch. It backs dry runs (`hostwall plan`),
//! the packet interpreter and the test suite.
//!
//! Batches apply to a copy of the state that replaces the live state only
//! once every declaration succeeded, so a rejected batch changes nothing.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

use super::error::{Error, Result};
use super::interp::SetLookup;
use super::rule::{Rule, RuleData};
use super::ruleset::{Chain, Table};
use super::sets::{Set, SetElement};
use super::transaction::{Declaration, Sink};

#[derive(Debug, Clone, Serialize)]
struct SetState {
    set: Set,
    elements: Vec<SetElement>,
}

#[derive(Debug, Clone, Serialize)]
struct ChainState {
    chain: Chain,
    rules: Vec<RuleData>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct TableState {
    chains: Vec<ChainState>,
    sets: BTreeMap<String, SetState>,
}

#[derive(Debug, Clone, Default)]
struct Ruleset {
    tables: BTreeMap<Table, TableState>,
    next_handle: u64,
}

impl Ruleset {
    fn table_mut(&mut self, table: &Table) -> Result<&mut TableState> {
        self.tables.get_mut(table).ok_or_else(|| {
            Error::transaction(format!(
                "table {} {} does not exist",
                table.family.nft_name(),
                table.name
            ))
        })
    }

    fn chain_mut(&mut self, table: &Table, chain: &str) -> Result<&mut ChainState> {
        self.table_mut(table)?
            .chains
            .iter_mut()
            .find(|c| c.chain.name == chain)
            .ok_or_else(|| Error::transaction(format!("chain {chain} does not exist")))
    }

    fn set_mut(&mut self, set: &Set) -> Result<&mut SetState> {
        let table = Table::new(set.family, set.table.clone());
        self.table_mut(&table)?
            .sets
            .get_mut(&set.name)
            .ok_or_else(|| Error::transaction(format!("set {} does not exist", set.name)))
    }

    fn prepare_rule(&mut self, rule: &Rule) -> Result<RuleData> {
        let table = self.table_mut(&rule.table)?;
        for set in rule.data.exprs.referenced_sets() {
            if !table.sets.contains_key(&set.name) {
                return Err(Error::transaction(format!(
                    "set {} does not exist",
                    set.name
                )));
            }
        }
        self.next_handle += 1;
        let mut data = rule.data.clone();
        data.handle = Some(self.next_handle);
        data.position = None;
        Ok(data)
    }

    fn apply(&mut self, decl: &Declaration) -> Result<()> {
        match decl {
            Declaration::FlushRuleset => self.tables.clear(),
            Declaration::AddTable(table) => {
                self.tables.entry(table.clone()).or_default();
            }
            Declaration::AddChain(chain) => {
                let state = self.table_mut(&chain.table)?;
                if let Some(existing) = state.chains.iter_mut().find(|c| c.chain.name == chain.name) {
                    existing.chain = chain.clone();
                } else {
                    state.chains.push(ChainState {
                        chain: chain.clone(),
                        rules: Vec::new(),
                    });
                }
            }
            Declaration::AddSet { set, elements } => {
                let table = Table::new(set.family, set.table.clone());
                let state = self.table_mut(&table)?;
                let entry = state.sets.entry(set.name.clone()).or_insert_with(|| SetState {
                    set: set.clone(),
                    elements: Vec::new(),
                });
                if entry.set.key_type != set.key_type {
                    return Err(Error::transaction(format!(
                        "set {} exists with key type {}",
                        set.name, entry.set.key_type
                    )));
                }
                add_elements(&mut entry.elements, elements);
            }
            Declaration::SetAddElements { set, elements } => {
                add_elements(&mut self.set_mut(set)?.elements, elements);
            }
            Declaration::SetDeleteElements { set, elements } => {
                self.set_mut(set)?
                    .elements
                    .retain(|e| !elements.iter().any(|d| d.same_key(e)));
            }
            Declaration::AddRule(rule) => {
                let data = self.prepare_rule(rule)?;
                self.chain_mut(&rule.table, &rule.chain)?.rules.push(data);
            }
            Declaration::InsertRule { rule, before } => {
                let data = self.prepare_rule(rule)?;
                let chain = self.chain_mut(&rule.table, &rule.chain)?;
                let at = match before {
                    None => 0,
                    Some(handle) => chain
                        .rules
                        .iter()
                        .position(|r| r.handle == Some(*handle))
                        .ok_or_else(|| {
                            Error::transaction(format!("rule handle {handle} does not exist"))
                        })?,
                };
                chain.rules.insert(at, data);
            }
            Declaration::DeleteRule {
                table,
                chain,
                handle,
            } => {
                let chain = self.chain_mut(table, chain)?;
                let before = chain.rules.len();
                chain.rules.retain(|r| r.handle != Some(*handle));
                if chain.rules.len() == before {
                    return Err(Error::transaction(format!(
                        "rule handle {handle} does not exist"
                    )));
                }
            }
        }
        Ok(())
    }
}

fn add_elements(current: &mut Vec<SetElement>, elements: &[SetElement]) {
    for element in elements {
        if !current.iter().any(|e| e.same_key(element)) {
            current.push(element.clone());
        }
    }
}

/// Kernel model sink
#[derive(Debug, Default)]
pub struct MemorySink {
    ruleset: Ruleset,
    commits: usize,
    fail_next: Option<String>,
    last_batch: Vec<Declaration>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail with `message` without touching state.
    pub fn fail_next_commit(&mut self, message: impl Into<String>) {
        self.fail_next = Some(message.into());
    }

    /// Number of successful commits
    pub fn commits(&self) -> usize {
        self.commits
    }

    /// The most recent committed batch
    pub fn last_batch(&self) -> &[Declaration] {
        &self.last_batch
    }

    pub fn tables(&self) -> Vec<Table> {
        self.ruleset.tables.keys().cloned().collect()
    }

    pub fn chain(&self, table: &Table, name: &str) -> Option<&Chain> {
        self.ruleset
            .tables
            .get(table)?
            .chains
            .iter()
            .find(|c| c.chain.name == name)
            .map(|c| &c.chain)
    }

    pub fn chains(&self, table: &Table) -> Vec<&Chain> {
        self.ruleset
            .tables
            .get(table)
            .map(|t| t.chains.iter().map(|c| &c.chain).collect())
            .unwrap_or_default()
    }

    pub fn set(&self, table: &Table, name: &str) -> Option<&Set> {
        self.ruleset.tables.get(table)?.sets.get(name).map(|s| &s.set)
    }

    /// Installed programs of a chain, without handles
    pub fn rule_programs(&self, table: &Table, chain: &str) -> Vec<RuleData> {
        self.list_rules(table, chain)
            .unwrap_or_default()
            .into_iter()
            .map(|mut r| {
                r.handle = None;
                r.position = None;
                r
            })
            .collect()
    }

    /// SHA-256 over the installed state, ignoring handles
    pub fn fingerprint(&self) -> String {
        let mut canonical = self.ruleset.clone();
        for table in canonical.tables.values_mut() {
            for chain in &mut table.chains {
                for rule in &mut chain.rules {
                    rule.handle = None;
                }
            }
            for set in table.sets.values_mut() {
                set.set.id = 0;
            }
        }
        // table keys are structs, so serialize as a list of pairs
        let tables: Vec<_> = canonical.tables.iter().collect();
        let json = serde_json::to_string(&tables).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(json.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

impl Sink for MemorySink {
    fn commit(&mut self, batch: &[Declaration]) -> Result<()> {
        if let Some(message) = self.fail_next.take() {
            return Err(Error::Transaction {
                message: message.clone(),
                stderr: Some(message),
                exit_code: Some(1),
            });
        }

        let mut staged = self.ruleset.clone();
        for (i, decl) in batch.iter().enumerate() {
            staged.apply(decl).map_err(|e| match e {
                Error::Transaction { message, .. } => Error::Transaction {
                    message: format!("declaration {i}: {message}"),
                    stderr: None,
                    exit_code: None,
                },
                other => other,
            })?;
        }
        self.ruleset = staged;
        self.commits += 1;
        self.last_batch = batch.to_vec();
        debug!("Memory sink committed {} declarations", batch.len());
        Ok(())
    }

    fn list_rules(&self, table: &Table, chain: &str) -> Result<Vec<RuleData>> {
        let state = self
            .ruleset
            .tables
            .get(table)
            .and_then(|t| t.chains.iter().find(|c| c.chain.name == chain))
            .ok_or_else(|| Error::transaction(format!("chain {chain} does not exist")))?;
        Ok(state
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| {
                let mut r = r.clone();
                r.position = Some(i);
                r
            })
            .collect())
    }

    fn list_set_elements(&self, set: &Set) -> Result<Vec<SetElement>> {
        let table = Table::new(set.family, set.table.clone());
        self.ruleset
            .tables
            .get(&table)
            .and_then(|t| t.sets.get(&set.name))
            .map(|s| s.elements.clone())
            .ok_or_else(|| Error::transaction(format!("set {} does not exist", set.name)))
    }

    fn set_exists(&self, table: &Table, name: &str) -> bool {
        self.ruleset
            .tables
            .get(table)
            .is_some_and(|t| t.sets.contains_key(name))
    }
}

impl SetLookup for MemorySink {
    fn contains(&self, table: &Table, set: &str, key: &[u8]) -> bool {
        self.ruleset
            .tables
            .get(table)
            .and_then(|t| t.sets.get(set))
            .is_some_and(|s| s.elements.iter().any(|e| e.contains(key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::family::AddressFamily;
    use crate::core::ruleset::{Hook, Policy};

    fn filter() -> Table {
        Table::new(AddressFamily::Ipv4, "filter")
    }

    fn trust() -> Set {
        Set::addresses(&filter(), "trust")
    }

    fn base_batch() -> Vec<Declaration> {
        vec![
            Declaration::AddTable(filter()),
            Declaration::AddChain(Chain::filter(&filter(), Hook::Input, Policy::Drop)),
            Declaration::AddSet {
                set: trust(),
                elements: vec![],
            },
        ]
    }

    #[test]
    fn test_commit_is_atomic() {
        let mut sink = MemorySink::new();
        let mut batch = base_batch();
        batch.push(Declaration::SetAddElements {
            set: Set::addresses(&filter(), "missing"),
            elements: vec![SetElement::single(vec![1, 2, 3, 4])],
        });
        assert!(sink.commit(&batch).is_err());
        assert!(sink.tables().is_empty());
        assert_eq!(sink.commits(), 0);
    }

    #[test]
    fn test_element_add_and_delete_are_idempotent() {
        let mut sink = MemorySink::new();
        sink.commit(&base_batch()).unwrap();
        let element = SetElement::single(vec![10, 0, 0, 1]);
        let add = Declaration::SetAddElements {
            set: trust(),
            elements: vec![element.clone()],
        };
        sink.commit(&[add.clone(), add]).unwrap();
        assert_eq!(sink.list_set_elements(&trust()).unwrap().len(), 1);

        let delete = Declaration::SetDeleteElements {
            set: trust(),
            elements: vec![element],
        };
        sink.commit(&[delete.clone(), delete]).unwrap();
        assert!(sink.list_set_elements(&trust()).unwrap().is_empty());
    }

    #[test]
    fn test_injected_failure_leaves_state() {
        let mut sink = MemorySink::new();
        sink.commit(&base_batch()).unwrap();
        let before = sink.fingerprint();
        sink.fail_next_commit("Error: Operation not permitted");
        let err = sink.commit(&[Declaration::FlushRuleset]).unwrap_err();
        assert!(matches!(err, Error::Transaction { exit_code: Some(1), .. }));
        assert_eq!(sink.fingerprint(), before);
        // knob is one-shot
        assert!(sink.commit(&[Declaration::FlushRuleset]).is_ok());
    }

    #[test]
    fn test_chain_requires_table() {
        let mut sink = MemorySink::new();
        let err = sink
            .commit(&[Declaration::AddChain(Chain::filter(
                &filter(),
                Hook::Input,
                Policy::Drop,
            ))])
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_set_lookup() {
        let mut sink = MemorySink::new();
        let mut batch = base_batch();
        batch.push(Declaration::SetAddElements {
            set: trust(),
            elements: vec![SetElement::range(vec![10, 0, 0, 0], vec![10, 255, 255, 255])],
        });
        sink.commit(&batch).unwrap();
        assert!(sink.contains(&filter(), "trust", &[10, 9, 8, 7]));
        assert!(!sink.contains(&filter(), "trust", &[11, 0, 0, 0]));
        assert!(!sink.contains(&filter(), "nope", &[10, 0, 0, 0]));
    }
}
