//! nftables JSON sink
//!
//! Renders declaration batches into the `nft --json` schema and pipes them
//! through one `nft -f -` call, which nftables applies as a single kernel
//! transaction. Register programs are folded back into nft's high-level
//! match statements: a load followed by a compare becomes one `match`, a
//! masked ct-state compare becomes `ct state in {...}`, a masked address
//! compare becomes a prefix match.
//!
//! Anonymous sets are not declared on their own; their elements are
//! inlined at each lookup that references them.

use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::process::Stdio;
use tracing::{debug, error, info};

use super::conntrack::CtState;
use super::error::{Error, Result};
use super::expr::{
    CmpOp, Exprs, FieldRef, LimitUnit, MatchOp, MetaKey, PayloadBase, RejectKind, Register, Verdict,
};
use super::family::{
    AddressFamily, DST_PORT_OFFSET, FamilyProfile, ICMP_TYPE_LEN, ICMP_TYPE_OFFSET, PORT_LEN,
    PROTO_LEN, SRC_PORT_OFFSET,
};
use super::rule::{Rule, RuleData};
use super::ruleset::{Chain, Table};
use super::sets::{Set, SetElement, SetKeyType};
use super::transaction::{Declaration, Sink};

const JSON_SCHEMA_VERSION: u32 = 1;

fn cmp_op(op: CmpOp) -> &'static str {
    match op {
        CmpOp::Eq => "==",
        CmpOp::Neq => "!=",
        CmpOp::Lt => "<",
        CmpOp::Lte => "<=",
        CmpOp::Gt => ">",
        CmpOp::Gte => ">=",
    }
}

fn be_int(bytes: &[u8]) -> Value {
    if bytes.len() <= 8 {
        json!(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    } else {
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        json!(format!("0x{hex}"))
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Option<IpAddr> {
    match bytes.len() {
        4 => <[u8; 4]>::try_from(bytes).ok().map(|b| IpAddr::V4(Ipv4Addr::from(b))),
        16 => <[u8; 16]>::try_from(bytes).ok().map(|b| IpAddr::V6(Ipv6Addr::from(b))),
        _ => None,
    }
}

fn ifname(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

fn ct_names(bytes: &[u8]) -> Value {
    let bits = <[u8; 4]>::try_from(bytes)
        .map(u32::from_ne_bytes)
        .unwrap_or_default();
    match CtState::new(bits) {
        Ok(state) => json!(state.names()),
        Err(_) => json!(bits),
    }
}

/// Well-known meaning of a loaded field in a table of `family`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Meta(MetaKey),
    CtState,
    Addr(&'static str),
    L4Proto,
    Port(&'static str),
    IcmpType,
    Raw(PayloadBase, u32, u32),
}

fn classify(profile: &FamilyProfile, field: &FieldRef) -> Field {
    match *field {
        FieldRef::Meta(key) => Field::Meta(key),
        FieldRef::CtState => Field::CtState,
        FieldRef::Payload {
            base: PayloadBase::Network,
            offset,
            len,
        } => {
            if len == profile.addr_len && offset == profile.src_offset {
                Field::Addr("saddr")
            } else if len == profile.addr_len && offset == profile.dst_offset {
                Field::Addr("daddr")
            } else if len == PROTO_LEN && offset == profile.l4proto_offset {
                Field::L4Proto
            } else {
                Field::Raw(PayloadBase::Network, offset, len)
            }
        }
        FieldRef::Payload {
            base: PayloadBase::Transport,
            offset,
            len,
        } => match (offset, len) {
            (SRC_PORT_OFFSET, PORT_LEN) => Field::Port("sport"),
            (DST_PORT_OFFSET, PORT_LEN) => Field::Port("dport"),
            (ICMP_TYPE_OFFSET, ICMP_TYPE_LEN) => Field::IcmpType,
            _ => Field::Raw(PayloadBase::Transport, offset, len),
        },
    }
}

fn field_expr(profile: &FamilyProfile, field: Field) -> Value {
    let ip = profile.family.nft_name();
    match field {
        Field::Meta(key) => {
            let key = match key {
                MetaKey::IifName => "iifname",
                MetaKey::OifName => "oifname",
                MetaKey::L4Proto => "l4proto",
                MetaKey::NfProto => "nfproto",
            };
            json!({ "meta": { "key": key } })
        }
        Field::CtState => json!({ "ct": { "key": "state" } }),
        Field::Addr(name) => json!({ "payload": { "protocol": ip, "field": name } }),
        Field::L4Proto => {
            let name = match profile.family {
                AddressFamily::Ipv4 => "protocol",
                AddressFamily::Ipv6 => "nexthdr",
            };
            json!({ "payload": { "protocol": ip, "field": name } })
        }
        Field::Port(name) => json!({ "payload": { "protocol": "th", "field": name } }),
        Field::IcmpType => {
            let proto = match profile.family {
                AddressFamily::Ipv4 => "icmp",
                AddressFamily::Ipv6 => "icmpv6",
            };
            json!({ "payload": { "protocol": proto, "field": "type" } })
        }
        Field::Raw(base, offset, len) => {
            let base = match base {
                PayloadBase::Network => "nh",
                PayloadBase::Transport => "th",
            };
            json!({ "payload": { "base": base, "offset": offset * 8, "len": len * 8 } })
        }
    }
}

fn field_value(field: Field, data: &[u8]) -> Value {
    match field {
        Field::Meta(MetaKey::IifName | MetaKey::OifName) => json!(ifname(data)),
        Field::Meta(MetaKey::NfProto) => match data.first() {
            Some(2) => json!("ipv4"),
            Some(10) => json!("ipv6"),
            _ => be_int(data),
        },
        Field::CtState => ct_names(data),
        Field::Addr(_) => ip_from_bytes(data).map_or_else(|| be_int(data), |a| json!(a.to_string())),
        _ => be_int(data),
    }
}

fn key_value(key_type: SetKeyType, spec: &str) -> Value {
    match key_type {
        SetKeyType::InetService => spec.parse::<u16>().map_or_else(|_| json!(spec), |p| json!(p)),
        _ => json!(spec),
    }
}

fn element_value(key_type: SetKeyType, element: &SetElement) -> Value {
    let spec = element.to_spec(key_type);
    let value = if let Some((addr, len)) = spec.split_once('/') {
        json!({ "prefix": { "addr": addr, "len": len.parse::<u32>().unwrap_or_default() } })
    } else if element.key_end.is_some()
        && let Some((lo, hi)) = spec.split_once('-')
    {
        json!({ "range": [key_value(key_type, lo), key_value(key_type, hi)] })
    } else {
        key_value(key_type, &spec)
    };
    match element.timeout {
        Some(timeout) => json!({ "elem": { "val": value, "timeout": timeout.as_secs() } }),
        None => value,
    }
}

fn reject_expr(family: AddressFamily, kind: RejectKind, code: u8) -> Value {
    let (kind, name) = match kind {
        RejectKind::TcpReset => return json!({ "reject": { "type": "tcp reset" } }),
        RejectKind::IcmpxUnreachable => (
            "icmpx",
            match code {
                0 => Some("no-route"),
                1 => Some("port-unreachable"),
                2 => Some("host-unreachable"),
                3 => Some("admin-prohibited"),
                _ => None,
            },
        ),
        RejectKind::IcmpUnreachable => match family {
            AddressFamily::Ipv4 => (
                "icmp",
                match code {
                    0 => Some("net-unreachable"),
                    1 => Some("host-unreachable"),
                    2 => Some("prot-unreachable"),
                    3 => Some("port-unreachable"),
                    9 => Some("net-prohibited"),
                    10 => Some("host-prohibited"),
                    13 => Some("admin-prohibited"),
                    _ => None,
                },
            ),
            AddressFamily::Ipv6 => (
                "icmpv6",
                match code {
                    0 => Some("no-route"),
                    1 => Some("admin-prohibited"),
                    3 => Some("addr-unreachable"),
                    4 => Some("port-unreachable"),
                    5 => Some("policy-fail"),
                    6 => Some("reject-route"),
                    _ => None,
                },
            ),
        },
    };
    match name {
        Some(name) => json!({ "reject": { "type": kind, "expr": name } }),
        None => json!({ "reject": { "type": kind, "expr": code } }),
    }
}

fn verdict_expr(family: AddressFamily, verdict: &Verdict) -> Value {
    match verdict {
        Verdict::Accept => json!({ "accept": null }),
        Verdict::Drop => json!({ "drop": null }),
        Verdict::Reject { kind, code } => reject_expr(family, *kind, *code),
        Verdict::Jump(target) => json!({ "jump": { "target": target } }),
        Verdict::Goto(target) => json!({ "goto": { "target": target } }),
        Verdict::Return => json!({ "return": null }),
        Verdict::Continue => json!({ "continue": null }),
    }
}

/// Contents of registers while folding a program
#[derive(Debug, Clone)]
enum Slot {
    Field { field: Field, mask: Option<Vec<u8>> },
    Imm(Vec<u8>),
}

type AnonymousSets<'b> = HashMap<(Table, String), (SetKeyType, &'b [SetElement])>;

fn prefix_len(mask: &[u8]) -> u32 {
    mask.iter().map(|b| b.count_ones()).sum()
}

fn unrenderable(at: usize, what: &str) -> Error {
    Error::Configuration(format!("cannot render op {at} as nftables JSON: {what}"))
}

fn take(regs: &mut [Option<Slot>], reg: Register, at: usize) -> Result<Slot> {
    regs[reg.index() as usize]
        .take()
        .ok_or_else(|| unrenderable(at, "register read before write"))
}

/// Folds a register program into nft JSON statements.
fn render_exprs(table: &Table, exprs: &Exprs, anonymous: &AnonymousSets<'_>) -> Result<Vec<Value>> {
    let profile = table.family.profile();
    let mut regs: [Option<Slot>; Register::MAX as usize + 1] = Default::default();
    let mut out = Vec::new();

    for (at, op) in exprs.ops().iter().enumerate() {
        match op {
            MatchOp::Load { field, reg } => {
                regs[reg.index() as usize] = Some(Slot::Field {
                    field: classify(profile, field),
                    mask: None,
                });
            }
            MatchOp::Bitwise {
                src, dst, mask, xor, ..
            } => {
                if xor.iter().any(|b| *b != 0) {
                    return Err(unrenderable(at, "bitwise xor"));
                }
                let Slot::Field { field, .. } = take(&mut regs, *src, at)? else {
                    return Err(unrenderable(at, "bitwise on an immediate"));
                };
                regs[dst.index() as usize] = Some(Slot::Field {
                    field,
                    mask: Some(mask.clone()),
                });
            }
            MatchOp::Cmp { op, reg, data } => {
                let Slot::Field { field, mask } = take(&mut regs, *reg, at)? else {
                    return Err(unrenderable(at, "compare on an immediate"));
                };
                let left = field_expr(profile, field);
                let stmt = match (field, mask) {
                    (Field::CtState, Some(mask)) if *op == CmpOp::Neq && data.iter().all(|b| *b == 0) => {
                        json!({ "match": { "op": "in", "left": left, "right": ct_names(&mask) } })
                    }
                    (Field::Addr(_), Some(mask)) => {
                        json!({ "match": { "op": cmp_op(*op), "left": left, "right": {
                            "prefix": { "addr": field_value(field, data), "len": prefix_len(&mask) }
                        } } })
                    }
                    (_, Some(mask)) => json!({ "match": {
                        "op": cmp_op(*op),
                        "left": { "&": [left, be_int(&mask)] },
                        "right": be_int(data),
                    } }),
                    (_, None) => json!({ "match": {
                        "op": cmp_op(*op),
                        "left": left,
                        "right": field_value(field, data),
                    } }),
                };
                out.push(stmt);
            }
            MatchOp::Lookup { reg, set, invert } => {
                let Slot::Field { field, mask: None } = take(&mut regs, *reg, at)? else {
                    return Err(unrenderable(at, "lookup on a masked or immediate value"));
                };
                let right = match anonymous.get(&(table.clone(), set.name.clone())) {
                    Some((key_type, elements)) => json!({
                        "set": elements.iter().map(|e| element_value(*key_type, e)).collect::<Vec<_>>()
                    }),
                    None => json!(format!("@{}", set.name)),
                };
                let op = if *invert { "!=" } else { "==" };
                out.push(json!({ "match": { "op": op, "left": field_expr(profile, field), "right": right } }));
            }
            MatchOp::Immediate { reg, data } => {
                regs[reg.index() as usize] = Some(Slot::Imm(data.clone()));
            }
            MatchOp::Nat {
                kind,
                addr_reg,
                port_reg,
                ..
            } => {
                let mut nat = serde_json::Map::new();
                if let Some(reg) = addr_reg {
                    let Slot::Imm(bytes) = take(&mut regs, *reg, at)? else {
                        return Err(unrenderable(at, "NAT address is not an immediate"));
                    };
                    let addr = ip_from_bytes(&bytes).ok_or_else(|| unrenderable(at, "NAT address width"))?;
                    nat.insert("addr".to_string(), json!(addr.to_string()));
                }
                if let Some(reg) = port_reg {
                    let Slot::Imm(bytes) = take(&mut regs, *reg, at)? else {
                        return Err(unrenderable(at, "NAT port is not an immediate"));
                    };
                    nat.insert("port".to_string(), be_int(&bytes));
                }
                out.push(json!({ kind.to_string(): nat }));
            }
            MatchOp::Limit(limit) => {
                let mut body = json!({
                    "rate": limit.rate,
                    "per": limit.per.to_string(),
                    "burst": limit.burst,
                    "inv": limit.over,
                });
                if limit.unit == LimitUnit::Bytes {
                    body["rate_unit"] = json!("bytes");
                }
                out.push(json!({ "limit": body }));
            }
            MatchOp::Counter => out.push(json!({ "counter": null })),
            MatchOp::Verdict(verdict) => out.push(verdict_expr(table.family, verdict)),
        }
    }
    Ok(out)
}

fn table_json(table: &Table) -> Value {
    json!({ "family": table.family.nft_name(), "name": table.name })
}

fn chain_json(chain: &Chain) -> Value {
    let mut body = json!({
        "family": chain.family().nft_name(),
        "table": chain.table.name,
        "name": chain.name,
    });
    if let Some(base) = &chain.base {
        body["type"] = json!(base.chain_type.to_string());
        body["hook"] = json!(base.hook.to_string());
        body["prio"] = json!(base.priority);
        body["policy"] = json!(base.policy.to_string());
    }
    body
}

fn set_json(set: &Set, elements: &[SetElement]) -> Value {
    let mut body = json!({
        "family": set.family.nft_name(),
        "table": set.table,
        "name": set.name,
        "type": set.key_type.to_string(),
    });
    let mut flags = Vec::new();
    if set.flags.constant {
        flags.push("constant");
    }
    if set.flags.interval {
        flags.push("interval");
    }
    if set.flags.timeout {
        flags.push("timeout");
    }
    if set.flags.dynamic {
        flags.push("dynamic");
    }
    if !flags.is_empty() {
        body["flags"] = json!(flags);
    }
    if let Some(timeout) = set.timeout {
        body["timeout"] = json!(timeout.as_secs());
    }
    if !elements.is_empty() {
        body["elem"] = json!(elements.iter().map(|e| element_value(set.key_type, e)).collect::<Vec<_>>());
    }
    body
}

fn element_json(set: &Set, elements: &[SetElement]) -> Value {
    json!({
        "family": set.family.nft_name(),
        "table": set.table,
        "name": set.name,
        "elem": elements.iter().map(|e| element_value(set.key_type, e)).collect::<Vec<_>>(),
    })
}

fn rule_json(rule: &Rule, anonymous: &AnonymousSets<'_>) -> Result<Value> {
    let mut body = json!({
        "family": rule.table.family.nft_name(),
        "table": rule.table.name,
        "chain": rule.chain,
        "expr": render_exprs(&rule.table, &rule.data.exprs, anonymous)?,
    });
    if let Some(id) = &rule.data.id {
        body["comment"] = json!(crate::validators::sanitize_rule_id(id));
    }
    Ok(body)
}

/// Renders a batch as one `nft --json -f` document.
pub fn render_batch(batch: &[Declaration]) -> Result<Value> {
    let anonymous: AnonymousSets<'_> = batch
        .iter()
        .filter_map(|decl| match decl {
            Declaration::AddSet { set, elements } if set.flags.anonymous => Some((
                (Table::new(set.family, set.table.clone()), set.name.clone()),
                (set.key_type, elements.as_slice()),
            )),
            _ => None,
        })
        .collect();

    let mut commands = vec![json!({ "metainfo": { "json_schema_version": JSON_SCHEMA_VERSION } })];
    for decl in batch {
        let command = match decl {
            Declaration::FlushRuleset => json!({ "flush": { "ruleset": null } }),
            Declaration::AddTable(table) => json!({ "add": { "table": table_json(table) } }),
            Declaration::AddChain(chain) => json!({ "add": { "chain": chain_json(chain) } }),
            Declaration::AddSet { set, .. } if set.flags.anonymous => continue,
            Declaration::AddSet { set, elements } => json!({ "add": { "set": set_json(set, elements) } }),
            Declaration::SetAddElements { set, elements } => {
                json!({ "add": { "element": element_json(set, elements) } })
            }
            Declaration::SetDeleteElements { set, elements } => {
                json!({ "delete": { "element": element_json(set, elements) } })
            }
            Declaration::AddRule(rule) => json!({ "add": { "rule": rule_json(rule, &anonymous)? } }),
            Declaration::InsertRule { rule, before } => {
                let mut body = rule_json(rule, &anonymous)?;
                if let Some(handle) = before {
                    body["handle"] = json!(handle);
                }
                json!({ "insert": { "rule": body } })
            }
            Declaration::DeleteRule {
                table,
                chain,
                handle,
            } => json!({ "delete": { "rule": {
                "family": table.family.nft_name(),
                "table": table.name,
                "chain": chain,
                "handle": handle,
            } } }),
        };
        commands.push(command);
    }
    Ok(json!({ "nftables": commands }))
}

/// SHA-256 of the canonical JSON string
pub fn checksum(document: &Value) -> String {
    let json_str = serde_json::to_string(document).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(json_str.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Turns one `elem` entry of `nft --json list set` back into a spec.
fn element_spec(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => {
            if let Some(prefix) = map.get("prefix") {
                let addr = prefix.get("addr")?.as_str()?;
                let len = prefix.get("len")?.as_u64()?;
                Some(format!("{addr}/{len}"))
            } else if let Some(range) = map.get("range").and_then(Value::as_array) {
                let lo = element_spec(range.first()?)?;
                let hi = element_spec(range.get(1)?)?;
                Some(format!("{lo}-{hi}"))
            } else {
                element_spec(map.get("elem")?.get("val")?)
            }
        }
        _ => None,
    }
}

/// Elements of the first set object in a `list set` document
pub fn parse_set_elements(set: &Set, document: &Value) -> Result<Vec<SetElement>> {
    let specs: Vec<String> = document["nftables"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("set"))
        .take(1)
        .flat_map(|s| s.get("elem").and_then(Value::as_array).cloned().unwrap_or_default())
        .filter_map(|v| element_spec(&v))
        .collect();
    set.elements_from_specs(&specs)
}

/// Rule metadata from a `list chain` document. Operations are not decoded.
pub fn parse_rules(document: &Value) -> Vec<RuleData> {
    document["nftables"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(|item| item.get("rule"))
        .enumerate()
        .map(|(position, rule)| RuleData {
            id: rule.get("comment").and_then(Value::as_str).map(str::to_string),
            exprs: Exprs::new(),
            handle: rule.get("handle").and_then(Value::as_u64),
            position: Some(position),
        })
        .collect()
}

/// Sink that drives the `nft` binary
#[derive(Debug, Default, Clone, Copy)]
pub struct NftCli;

impl NftCli {
    pub fn new() -> Self {
        Self
    }

    fn run(args: &[&str], stdin: Option<&str>) -> Result<Vec<u8>> {
        let mut child = crate::elevation::nft_command(args)?
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                error!("Failed to spawn nft: {e}");
                Error::Transaction {
                    message: format!("failed to spawn nft: {e}"),
                    stderr: None,
                    exit_code: None,
                }
            })?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        if output.status.success() {
            return Ok(output.stdout);
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = stderr.lines().next().unwrap_or("nft failed").to_string();
        Err(Error::Transaction {
            message,
            stderr: Some(stderr),
            exit_code: output.status.code(),
        })
    }

    fn list(args: &[&str]) -> Result<Value> {
        let mut full = vec!["--json", "list"];
        full.extend_from_slice(args);
        let stdout = Self::run(&full, None)?;
        Ok(serde_json::from_slice(&stdout)?)
    }

    /// Drops deletions of elements the set will not hold when the kernel
    /// reaches them. `delete element` on a missing key fails with ENOENT
    /// and takes the whole batch down with it.
    fn prune_absent_deletes(&self, batch: &[Declaration]) -> Vec<Declaration> {
        let mut known: HashMap<SetKey, Vec<SetElement>> = HashMap::new();
        let mut flushed = false;
        let mut pruned = Vec::with_capacity(batch.len());

        for decl in batch {
            match decl {
                Declaration::FlushRuleset => {
                    known.clear();
                    flushed = true;
                }
                Declaration::AddSet { set, elements } | Declaration::SetAddElements { set, elements } => {
                    let members = self.members(&mut known, flushed, set);
                    for element in elements {
                        if !members.iter().any(|m| m.same_key(element)) {
                            members.push(element.clone());
                        }
                    }
                }
                Declaration::SetDeleteElements { set, elements } => {
                    let members = self.members(&mut known, flushed, set);
                    let mut present = Vec::with_capacity(elements.len());
                    for element in elements {
                        if let Some(at) = members.iter().position(|m| m.same_key(element)) {
                            members.swap_remove(at);
                            present.push(element.clone());
                        }
                    }
                    let skipped = elements.len() - present.len();
                    if skipped > 0 {
                        debug!("Skipping {skipped} element(s) absent from {}", set.name);
                    }
                    if !present.is_empty() {
                        pruned.push(Declaration::SetDeleteElements {
                            set: set.clone(),
                            elements: present,
                        });
                    }
                    continue;
                }
                _ => {}
            }
            pruned.push(decl.clone());
        }
        pruned
    }

    /// Elements `set` holds at this point of the batch, read from the kernel
    /// on first use unless the batch flushed the ruleset before it.
    fn members<'m>(
        &self,
        known: &'m mut HashMap<SetKey, Vec<SetElement>>,
        flushed: bool,
        set: &Set,
    ) -> &'m mut Vec<SetElement> {
        known
            .entry((set.family, set.table.clone(), set.name.clone()))
            .or_insert_with(|| {
                if flushed || set.flags.anonymous {
                    return Vec::new();
                }
                self.list_set_elements(set).unwrap_or_else(|e| {
                    debug!("Set {} not listed, treating as empty: {e}", set.name);
                    Vec::new()
                })
            })
    }
}

type SetKey = (AddressFamily, String, String);

impl Sink for NftCli {
    fn commit(&mut self, batch: &[Declaration]) -> Result<()> {
        let batch = self.prune_absent_deletes(batch);
        if batch.is_empty() {
            debug!("nft batch empty after pruning, nothing to send");
            return Ok(());
        }
        let document = render_batch(&batch)?;
        let payload = serde_json::to_string(&document)?;
        debug!("nft batch {}", checksum(&document));
        Self::run(&["--json", "-f", "-"], Some(&payload))?;
        info!("nft accepted {} declarations", batch.len());
        Ok(())
    }

    fn list_rules(&self, table: &Table, chain: &str) -> Result<Vec<RuleData>> {
        let document = Self::list(&["chain", table.family.nft_name(), &table.name, chain])?;
        Ok(parse_rules(&document))
    }

    fn list_set_elements(&self, set: &Set) -> Result<Vec<SetElement>> {
        let document = Self::list(&["set", set.family.nft_name(), &set.table, &set.name])?;
        parse_set_elements(set, &document)
    }

    fn set_exists(&self, table: &Table, name: &str) -> bool {
        Self::list(&["set", table.family.nft_name(), &table.name, name]).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::conntrack::STATE_ESTABLISHED_RELATED;
    use crate::core::primitives as p;
    use crate::core::ruleset::{Hook, Policy};
    use std::time::Duration;

    fn filter() -> Table {
        Table::new(AddressFamily::Ipv4, "filter")
    }

    fn rule(exprs: Exprs) -> Rule {
        Rule {
            table: filter(),
            chain: "input".to_string(),
            data: RuleData::new("test", exprs),
        }
    }

    fn exprs_of(doc: &Value, index: usize) -> Value {
        doc["nftables"][index]["add"]["rule"]["expr"].clone()
    }

    #[test]
    fn test_renders_named_fields() {
        let v4 = AddressFamily::Ipv4.profile();
        let batch = vec![Declaration::AddRule(rule(Exprs::join([
            p::iif("eth0").unwrap(),
            p::tcp(v4),
            p::dport(22),
            p::ct_state(STATE_ESTABLISHED_RELATED),
            p::accept(),
        ])))];
        let doc = render_batch(&batch).unwrap();
        let expr = exprs_of(&doc, 1);
        assert_eq!(expr[0]["match"]["left"]["meta"]["key"], "iifname");
        assert_eq!(expr[0]["match"]["right"], "eth0");
        assert_eq!(expr[1]["match"]["left"]["payload"]["field"], "protocol");
        assert_eq!(expr[1]["match"]["right"], 6);
        assert_eq!(expr[2]["match"]["left"]["payload"]["field"], "dport");
        assert_eq!(expr[2]["match"]["right"], 22);
        assert_eq!(expr[3]["match"]["op"], "in");
        assert_eq!(expr[3]["match"]["right"], json!(["established", "related"]));
        assert_eq!(expr[4], json!({ "accept": null }));
        assert_eq!(doc["nftables"][1]["add"]["rule"]["comment"], "test");
    }

    #[test]
    fn test_renders_prefix_and_snat() {
        let v4 = AddressFamily::Ipv4.profile();
        let batch = vec![
            Declaration::AddRule(rule(Exprs::join([
                p::snet(v4, "127.0.0.0/8".parse().unwrap()).unwrap(),
                p::drop(),
            ]))),
            Declaration::AddRule(rule(Exprs::join([
                p::oif("eth0").unwrap(),
                p::snat(v4, "203.0.113.7".parse().unwrap()).unwrap(),
            ]))),
        ];
        let doc = render_batch(&batch).unwrap();
        let prefix = &exprs_of(&doc, 1)[0]["match"]["right"]["prefix"];
        assert_eq!(prefix["addr"], "127.0.0.0");
        assert_eq!(prefix["len"], 8);
        assert_eq!(exprs_of(&doc, 2)[1], json!({ "snat": { "addr": "203.0.113.7" } }));
    }

    #[test]
    fn test_ipv6_fields() {
        let v6 = AddressFamily::Ipv6.profile();
        let table = Table::new(AddressFamily::Ipv6, "filter");
        let exprs = Exprs::join([p::saddr(v6, "2001:db8::1".parse().unwrap()).unwrap(), p::accept()]);
        let rendered = render_exprs(&table, &exprs, &HashMap::new()).unwrap();
        assert_eq!(rendered[0]["match"]["left"]["payload"]["protocol"], "ip6");
        assert_eq!(rendered[0]["match"]["left"]["payload"]["field"], "saddr");
        assert_eq!(rendered[0]["match"]["right"], "2001:db8::1");
    }

    #[test]
    fn test_anonymous_set_is_inlined() {
        let mut anon = Set::anonymous(&filter(), SetKeyType::InetService);
        anon.name = "__set1".to_string();
        let elements = anon.elements_from_specs(&["80", "443"]).unwrap();
        let batch = vec![
            Declaration::AddSet {
                set: anon.clone(),
                elements,
            },
            Declaration::AddRule(rule(Exprs::join([p::dport_set(&anon).unwrap(), p::accept()]))),
        ];
        let doc = render_batch(&batch).unwrap();
        // metainfo plus the rule; the anonymous set is not declared
        assert_eq!(doc["nftables"].as_array().unwrap().len(), 2);
        assert_eq!(exprs_of(&doc, 1)[0]["match"]["right"], json!({ "set": [80, 443] }));
    }

    #[test]
    fn test_named_set_and_elements() {
        let set = Set::addresses(&filter(), "blacklist").interval().element_timeouts();
        let elements = vec![
            set.elements_from_specs(&["10.0.0.0/8"]).unwrap().remove(0),
            set.elements_from_specs(&["192.0.2.1"]).unwrap().remove(0).with_timeout(Duration::from_secs(60)),
        ];
        let doc = render_batch(&[
            Declaration::AddTable(filter()),
            Declaration::AddChain(Chain::filter(&filter(), Hook::Input, Policy::Drop)),
            Declaration::AddSet {
                set: set.clone(),
                elements,
            },
        ])
        .unwrap();
        let chain = &doc["nftables"][2]["add"]["chain"];
        assert_eq!(chain["hook"], "input");
        assert_eq!(chain["policy"], "drop");
        let body = &doc["nftables"][3]["add"]["set"];
        assert_eq!(body["type"], "ipv4_addr");
        assert_eq!(body["flags"], json!(["interval", "timeout"]));
        assert_eq!(body["elem"][0]["prefix"]["len"], 8);
        assert_eq!(body["elem"][1]["elem"]["timeout"], 60);
    }

    #[test]
    fn test_parse_set_elements() {
        let set = Set::addresses(&filter(), "trust_ipset").interval();
        let doc = json!({ "nftables": [
            { "metainfo": { "json_schema_version": 1 } },
            { "set": { "name": "trust_ipset", "elem": [
                "10.0.0.1",
                { "prefix": { "addr": "192.168.0.0", "len": 16 } },
                { "range": ["172.16.0.1", "172.16.0.9"] },
                { "elem": { "val": "198.51.100.4", "timeout": 30 } }
            ] } }
        ] });
        let elements = parse_set_elements(&set, &doc).unwrap();
        let specs: Vec<String> = elements.iter().map(|e| e.to_spec(set.key_type)).collect();
        assert_eq!(
            specs,
            vec!["10.0.0.1", "192.168.0.0/16", "172.16.0.1-172.16.0.9", "198.51.100.4"]
        );
    }

    #[test]
    fn test_parse_rules() {
        let doc = json!({ "nftables": [
            { "chain": { "name": "input" } },
            { "rule": { "handle": 4, "comment": "loopback-in", "expr": [] } },
            { "rule": { "handle": 9, "expr": [] } }
        ] });
        let rules = parse_rules(&doc);
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].id.as_deref(), Some("loopback-in"));
        assert_eq!(rules[1].handle, Some(9));
        assert_eq!(rules[1].position, Some(1));
    }

    #[test]
    fn test_deletes_after_flush_follow_batch_contents() {
        let set = Set::addresses(&filter(), "trust_ipset").interval();
        let held = set.elements_from_specs(&["10.0.0.1"]).unwrap();
        let both = set.elements_from_specs(&["10.0.0.1", "10.0.0.9", "10.0.0.1"]).unwrap();
        let batch = vec![
            Declaration::FlushRuleset,
            Declaration::AddTable(filter()),
            Declaration::AddSet {
                set: set.clone(),
                elements: held.clone(),
            },
            Declaration::SetDeleteElements {
                set: set.clone(),
                elements: both.clone(),
            },
            Declaration::SetDeleteElements {
                set: set.clone(),
                elements: both,
            },
        ];

        // the flush makes the set's contents known without asking nft
        let pruned = NftCli::new().prune_absent_deletes(&batch);
        assert_eq!(pruned.len(), 4);
        assert_eq!(
            pruned[3],
            Declaration::SetDeleteElements {
                set,
                elements: held,
            }
        );
    }

    #[test]
    fn test_checksum_deterministic() {
        let doc = render_batch(&[Declaration::FlushRuleset]).unwrap();
        assert_eq!(checksum(&doc), checksum(&doc.clone()));
        assert_eq!(checksum(&doc).len(), 64);
    }
}
