//! Patch router: declares modules and connections, then commits them into
//! an execution plan for a [`ModuleHost`](crate::host::ModuleHost).

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::path::Path;

use anyhow::Context;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

use crate::command::{Command, CommandKind, Ident, Value};
use crate::error::GraphError;
use crate::modules::ModuleKind;

/// Most modules one host holds.
pub const MAX_MODULES: usize = 16;

/// One module of a committed plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedModule {
    pub id: Ident,
    pub kind: ModuleKind,
    /// Modules whose outputs are summed into this module's input. Empty
    /// means the previous module in plan order.
    #[serde(default)]
    pub inputs: Vec<Ident>,
    /// Initial parameter values.
    #[serde(default)]
    pub params: BTreeMap<Ident, f64>,
}

/// Modules in execution order; every input precedes its consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchPlan {
    modules: Vec<PlannedModule>,
}

impl PatchPlan {
    /// Oscillator → envelope → low-pass filter.
    pub fn classic(frequency: f64) -> Self {
        let osc = Ident::literal("osc");
        let env = Ident::literal("env");
        let flt = Ident::literal("flt");
        let module = |id, kind, inputs| PlannedModule {
            id,
            kind,
            inputs,
            params: BTreeMap::new(),
        };
        let mut oscillator = module(osc, ModuleKind::Oscillator, Vec::new());
        oscillator.params.insert(Ident::literal("freq"), frequency);
        Self {
            modules: vec![
                oscillator,
                module(env, ModuleKind::Envelope, vec![osc]),
                module(flt, ModuleKind::Filter, vec![env]),
            ],
        }
    }

    pub fn modules(&self) -> &[PlannedModule] {
        &self.modules
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn position(&self, id: Ident) -> Option<usize> {
        self.modules.iter().position(|m| m.id == id)
    }

    pub fn kind_of(&self, id: Ident) -> Option<ModuleKind> {
        self.modules.iter().find(|m| m.id == id).map(|m| m.kind)
    }

    /// Whether `kind` addresses a module of this plan with a parameter or
    /// gate that module has.
    pub fn accepts(&self, kind: &CommandKind) -> bool {
        match *kind {
            CommandKind::SetParam { module, param, .. } => self
                .kind_of(module)
                .is_some_and(|k| k.param_names().contains(&param.as_str())),
            CommandKind::SetGate { module, .. } => {
                self.kind_of(module).is_some_and(ModuleKind::has_gate)
            }
            CommandKind::Patch { module, .. } => self.kind_of(module).is_some(),
        }
    }

    /// Largest number of entries a ledger of accepted commands can hold:
    /// every parameter, gate and bypass flag of every module.
    pub fn max_ledger_len(&self) -> usize {
        self.modules
            .iter()
            .map(|m| m.kind.param_names().len() + usize::from(m.kind.has_gate()) + 1)
            .sum()
    }

    pub fn execution_order(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.id.to_string()).collect()
    }

    /// Rechecks a plan that arrived from outside the builder.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.modules.is_empty() {
            return Err(GraphError::EmptyPatch);
        }
        if self.modules.len() > MAX_MODULES {
            return Err(GraphError::TooManyModules {
                count: self.modules.len(),
                max: MAX_MODULES,
            });
        }
        for (index, module) in self.modules.iter().enumerate() {
            if self.modules[..index].iter().any(|m| m.id == module.id) {
                return Err(GraphError::DuplicateModule(module.id.to_string()));
            }
            for input in &module.inputs {
                match self.position(*input) {
                    Some(pos) if pos < index => {}
                    Some(_) => {
                        return Err(GraphError::Cycle {
                            module: module.id.to_string(),
                        })
                    }
                    None => return Err(GraphError::UnknownModule(input.to_string())),
                }
            }
        }
        Ok(())
    }

    /// Parameter commands that reproduce the plan's initial values.
    pub fn initial_commands(&self) -> Vec<Command> {
        self.modules
            .iter()
            .flat_map(|module| {
                module
                    .params
                    .iter()
                    .map(move |(param, value)| Command::set_param(module.id, *param, Value::Float(*value)))
            })
            .collect()
    }

    /// Loads a patch document (modules plus connections) and commits it.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read patch {}", path.display()))?;
        let document: PatchDocument = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse patch {}", path.display()))?;
        let plan = document
            .commit()
            .with_context(|| format!("patch {} is invalid", path.display()))?;
        Ok(plan)
    }
}

/// Declared module in a patch document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleDecl {
    pub id: Ident,
    /// Module type name; aliases such as `osc` or `lowpass` are accepted.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub params: BTreeMap<Ident, f64>,
}

/// On-disk patch description.
///
/// ```json
/// { "modules": [ { "id": "osc", "type": "oscillator", "params": { "freq": 220 } },
///                { "id": "flt", "type": "filter" } ],
///   "connections": [ ["osc", "flt"] ] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchDocument {
    pub modules: Vec<ModuleDecl>,
    #[serde(default)]
    pub connections: Vec<(Ident, Ident)>,
}

impl PatchDocument {
    pub fn commit(&self) -> Result<PatchPlan, GraphError> {
        let mut builder = PatchBuilder::new();
        for decl in &self.modules {
            builder.create(decl.id, decl.kind.parse()?);
            for (param, value) in &decl.params {
                builder.set_param(decl.id, *param, *value);
            }
        }
        for (from, to) in &self.connections {
            builder.connect(*from, *to);
        }
        builder.commit()
    }
}

#[derive(Debug, Clone)]
struct Declared {
    id: Ident,
    kind: ModuleKind,
    params: BTreeMap<Ident, f64>,
}

/// Accumulates build operations; nothing is checked until [`commit`].
///
/// [`commit`]: PatchBuilder::commit
#[derive(Debug, Default, Clone)]
pub struct PatchBuilder {
    modules: Vec<Declared>,
    connections: Vec<(Ident, Ident)>,
    params: Vec<(Ident, Ident, f64)>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&mut self, id: Ident, kind: ModuleKind) -> &mut Self {
        self.modules.push(Declared {
            id,
            kind,
            params: BTreeMap::new(),
        });
        self
    }

    pub fn connect(&mut self, from: Ident, to: Ident) -> &mut Self {
        self.connections.push((from, to));
        self
    }

    pub fn set_param(&mut self, id: Ident, param: Ident, value: f64) -> &mut Self {
        self.params.push((id, param, value));
        self
    }

    /// Validates the declared graph and orders it for execution.
    ///
    /// Ties between independent modules keep declaration order.
    pub fn commit(&self) -> Result<PatchPlan, GraphError> {
        if self.modules.is_empty() {
            return Err(GraphError::EmptyPatch);
        }
        if self.modules.len() > MAX_MODULES {
            return Err(GraphError::TooManyModules {
                count: self.modules.len(),
                max: MAX_MODULES,
            });
        }

        let mut graph = DiGraph::<usize, ()>::with_capacity(self.modules.len(), self.connections.len());
        let mut index_of: HashMap<Ident, NodeIndex> = HashMap::new();
        for (position, module) in self.modules.iter().enumerate() {
            if index_of.insert(module.id, graph.add_node(position)).is_some() {
                return Err(GraphError::DuplicateModule(module.id.to_string()));
            }
        }
        let lookup = |id: &Ident| {
            index_of
                .get(id)
                .copied()
                .ok_or_else(|| GraphError::UnknownModule(id.to_string()))
        };
        for (from, to) in &self.connections {
            let (a, b) = (lookup(from)?, lookup(to)?);
            if graph.find_edge(a, b).is_none() {
                graph.add_edge(a, b, ());
            }
        }
        let mut declared = self.modules.clone();
        for (id, param, value) in &self.params {
            let node = lookup(id)?;
            declared[graph[node]].params.insert(*param, *value);
        }

        if let Err(cycle) = toposort(&graph, None) {
            let module = &self.modules[graph[cycle.node_id()]];
            return Err(GraphError::Cycle {
                module: module.id.to_string(),
            });
        }

        // Kahn's algorithm over declaration positions for a stable order.
        let mut in_degree: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = graph
            .node_indices()
            .filter(|n| in_degree[n.index()] == 0)
            .map(|n| Reverse(n.index()))
            .collect();
        let mut modules = Vec::with_capacity(declared.len());
        while let Some(Reverse(index)) = ready.pop() {
            let node = NodeIndex::new(index);
            let mut inputs: Vec<(usize, Ident)> = graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|n| (n.index(), self.modules[n.index()].id))
                .collect();
            inputs.sort_by_key(|(position, _)| *position);
            let decl = &declared[graph[node]];
            modules.push(PlannedModule {
                id: decl.id,
                kind: decl.kind,
                inputs: inputs.into_iter().map(|(_, id)| id).collect(),
                params: decl.params.clone(),
            });
            for next in graph.neighbors_directed(node, Direction::Outgoing) {
                in_degree[next.index()] -= 1;
                if in_degree[next.index()] == 0 {
                    ready.push(Reverse(next.index()));
                }
            }
        }

        Ok(PatchPlan { modules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(text: &str) -> Ident {
        Ident::new(text).expect("ident")
    }

    #[test]
    fn classic_chain_order() {
        let plan = PatchPlan::classic(440.0);
        assert_eq!(plan.execution_order(), vec!["osc", "env", "flt"]);
        assert_eq!(plan.modules()[1].inputs, vec![id("osc")]);
        assert_eq!(plan.modules()[0].params.get(&id("freq")), Some(&440.0));
        plan.validate().expect("valid");
    }

    #[test]
    fn connections_reorder_declarations() {
        let mut builder = PatchBuilder::new();
        builder
            .create(id("flt"), ModuleKind::Filter)
            .create(id("osc"), ModuleKind::Oscillator)
            .connect(id("osc"), id("flt"));
        let plan = builder.commit().expect("commit");
        assert_eq!(plan.execution_order(), vec!["osc", "flt"]);
    }

    #[test]
    fn cycles_are_rejected() {
        let mut builder = PatchBuilder::new();
        builder
            .create(id("a"), ModuleKind::Filter)
            .create(id("b"), ModuleKind::Filter)
            .connect(id("a"), id("b"))
            .connect(id("b"), id("a"));
        assert!(matches!(builder.commit(), Err(GraphError::Cycle { .. })));
    }

    #[test]
    fn graph_faults() {
        assert_eq!(PatchBuilder::new().commit(), Err(GraphError::EmptyPatch));

        let mut builder = PatchBuilder::new();
        builder
            .create(id("a"), ModuleKind::Filter)
            .create(id("a"), ModuleKind::Envelope);
        assert_eq!(builder.commit(), Err(GraphError::DuplicateModule("a".into())));

        let mut builder = PatchBuilder::new();
        builder
            .create(id("a"), ModuleKind::Filter)
            .connect(id("ghost"), id("a"));
        assert_eq!(builder.commit(), Err(GraphError::UnknownModule("ghost".into())));
    }

    #[test]
    fn document_round_trip_through_builder() {
        let json = r#"{
            "modules": [
                { "id": "osc", "type": "osc", "params": { "freq": 220 } },
                { "id": "flt", "type": "lowpass", "params": { "cutoff": 800 } }
            ],
            "connections": [["osc", "flt"]]
        }"#;
        let document: PatchDocument = serde_json::from_str(json).expect("json");
        let plan = document.commit().expect("commit");
        assert_eq!(plan.modules()[1].kind, ModuleKind::Filter);
        assert_eq!(plan.initial_commands().len(), 2);

        let bad: PatchDocument =
            serde_json::from_str(r#"{ "modules": [ { "id": "x", "type": "reverb" } ] }"#)
                .expect("json");
        assert_eq!(bad.commit(), Err(GraphError::UnknownKind("reverb".into())));
    }

    #[test]
    fn accepts_only_commands_the_plan_can_apply() {
        use crate::command::PatchOp;

        let plan = PatchPlan::classic(440.0);
        let set = |module, param| CommandKind::SetParam {
            module: id(module),
            param: id(param),
            value: Value::Float(100.0),
        };
        assert!(plan.accepts(&set("osc", "freq")));
        assert!(plan.accepts(&set("flt", "q")));
        assert!(!plan.accepts(&set("osc", "cutoff")));
        assert!(!plan.accepts(&set("ghost", "freq")));
        assert!(plan.accepts(&CommandKind::SetGate {
            module: id("env"),
            on: true
        }));
        assert!(!plan.accepts(&CommandKind::SetGate {
            module: id("osc"),
            on: true
        }));
        assert!(plan.accepts(&CommandKind::Patch {
            module: id("flt"),
            op: PatchOp::Bypass(true)
        }));
        // osc: 2 params + bypass, env: 4 params + gate + bypass, flt: 2 + bypass
        assert_eq!(plan.max_ledger_len(), 12);
    }

    #[test]
    fn validate_rejects_out_of_order_plans() {
        let mut plan = PatchPlan::classic(440.0);
        plan.modules.swap(0, 1);
        assert!(plan.validate().is_err());
    }
}
