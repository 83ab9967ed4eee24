use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, Ident, PatchOp, Value};
use crate::patch::PatchPlan;

/// Last value sent for every parameter, gate and bypass flag.
///
/// Replayed into a freshly spawned worker's command ring so it joins in the
/// same state as the slot it backs up. `reset` operations are transient and
/// not recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamLedger {
    params: BTreeMap<Ident, BTreeMap<Ident, Value>>,
    gates: BTreeMap<Ident, bool>,
    bypassed: BTreeMap<Ident, bool>,
}

impl ParamLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: &CommandKind) {
        match *kind {
            CommandKind::SetParam {
                module,
                param,
                value,
            } => {
                self.params.entry(module).or_default().insert(param, value);
            }
            CommandKind::SetGate { module, on } => {
                self.gates.insert(module, on);
            }
            CommandKind::Patch {
                module,
                op: PatchOp::Bypass(on),
            } => {
                self.bypassed.insert(module, on);
            }
            CommandKind::Patch {
                op: PatchOp::Reset, ..
            } => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.gates.is_empty() && self.bypassed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.values().map(BTreeMap::len).sum::<usize>() + self.gates.len() + self.bypassed.len()
    }

    pub fn clear(&mut self) {
        self.params.clear();
        self.gates.clear();
        self.bypassed.clear();
    }

    pub fn value(&self, module: Ident, param: Ident) -> Option<Value> {
        self.params.get(&module)?.get(&param).copied()
    }

    pub fn gate(&self, module: Ident) -> Option<bool> {
        self.gates.get(&module).copied()
    }

    /// Drops every entry `plan` has no module, parameter or gate for.
    pub fn restrict_to(&mut self, plan: &PatchPlan) {
        self.params.retain(|module, values| {
            values.retain(|param, value| {
                plan.accepts(&CommandKind::SetParam {
                    module: *module,
                    param: *param,
                    value: *value,
                })
            });
            !values.is_empty()
        });
        self.gates
            .retain(|module, on| plan.accepts(&CommandKind::SetGate { module: *module, on: *on }));
        self.bypassed.retain(|module, _| plan.position(*module).is_some());
    }

    /// Gates and bypass flags of modules that still exist in `plan`.
    /// Parameters are left to the plan's own initial values.
    pub fn carry_over(&self, plan: &PatchPlan) -> Self {
        let keep = |module: &Ident| plan.position(*module).is_some();
        Self {
            params: BTreeMap::new(),
            gates: self
                .gates
                .iter()
                .filter(|(module, _)| keep(module))
                .map(|(module, on)| (*module, *on))
                .collect(),
            bypassed: self
                .bypassed
                .iter()
                .filter(|(module, _)| keep(module))
                .map(|(module, on)| (*module, *on))
                .collect(),
        }
    }

    /// Replay order: parameters, bypass flags, then gates, so envelopes open
    /// on already-settled parameters.
    pub fn commands(&self) -> Vec<Command> {
        let params = self.params.iter().flat_map(|(module, values)| {
            values
                .iter()
                .map(move |(param, value)| Command::set_param(*module, *param, *value))
        });
        let bypass = self
            .bypassed
            .iter()
            .map(|(module, on)| Command::patch_op(*module, PatchOp::Bypass(*on)));
        let gates = self
            .gates
            .iter()
            .map(|(module, on)| Command::set_gate(*module, *on));
        params.chain(bypass).chain(gates).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(text: &str) -> Ident {
        Ident::new(text).expect("ident")
    }

    #[test]
    fn keeps_only_the_latest_value() {
        let mut ledger = ParamLedger::new();
        for freq in [110.0, 220.0, 330.0] {
            ledger.record(&CommandKind::SetParam {
                module: id("osc"),
                param: id("freq"),
                value: Value::Float(freq),
            });
        }
        ledger.record(&CommandKind::SetGate {
            module: id("env"),
            on: true,
        });
        ledger.record(&CommandKind::Patch {
            module: id("osc"),
            op: PatchOp::Reset,
        });
        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.value(id("osc"), id("freq")), Some(Value::Float(330.0)));

        let carried = ledger.carry_over(&PatchPlan::classic(220.0));
        assert_eq!(carried.len(), 1);
        assert_eq!(carried.gate(id("env")), Some(true));
        assert_eq!(carried.value(id("osc"), id("freq")), None);

        let mut restricted = ledger.clone();
        restricted.record(&CommandKind::SetParam {
            module: id("ghost"),
            param: id("freq"),
            value: Value::Float(1.0),
        });
        restricted.record(&CommandKind::SetParam {
            module: id("osc"),
            param: id("detune"),
            value: Value::Float(1.0),
        });
        restricted.restrict_to(&PatchPlan::classic(220.0));
        assert_eq!(restricted, ledger);

        let replay = ledger.commands();
        assert_eq!(replay.len(), 2);
        assert_eq!(
            replay[1].decode(),
            Ok(CommandKind::SetGate {
                module: id("env"),
                on: true
            })
        );
    }
}
