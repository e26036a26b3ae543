use crate::error::{Error, Result};
use crate::graph::node::{Node, NodeId, NodeKind, NodeRef, VarId};
use crate::initializers::init_tensor_xavier_uniform;
use crate::ir::Visibility;
use crate::tensor::{Tensor, Type};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::{BTreeSet, HashMap};

/// Seed used by `Module::new` so that randomly initialized parameters are
/// reproducible from run to run.
pub const DEFAULT_SEED: u64 = 0x5eed;

/// How a variable is initialized and whether differentiation trains it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrainKind {
    /// Not trained. Initialized to zeros unless a payload is set.
    None,
    /// Trained, initialized to a constant.
    Broadcast(f32),
    /// Trained, initialized with Xavier uniform for the given fan-in.
    Xavier(usize),
}

impl TrainKind {
    pub fn is_trainable(self) -> bool {
        !matches!(self, TrainKind::None)
    }
}

/// A module-level leaf: declared input, output or parameter.
///
/// The payload is the variable's initializer. It is copied into the storage
/// location the first time the variable is lowered; after that the location
/// is authoritative.
#[derive(Debug, Clone)]
pub struct Variable {
    pub id: VarId,
    pub name: String,
    pub ty: Type,
    pub visibility: Visibility,
    pub train: TrainKind,
    payload: Tensor,
}

impl Variable {
    pub fn payload(&self) -> &Tensor {
        &self.payload
    }

    pub fn is_trainable(&self) -> bool {
        self.train.is_trainable()
    }
}

/// Id of a function inside its module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionId(pub usize);

/// A computation graph over module variables.
///
/// Nodes can only reference nodes that already exist, so the node list is
/// acyclic by construction.
#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    nodes: Vec<Node>,
    names: HashMap<String, NodeId>,
    in_place: bool,
}

impl Function {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            names: HashMap::new(),
            in_place: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    /// When set, elementwise unary nodes may overwrite their input's
    /// activation instead of allocating a new one.
    pub fn set_in_place(&mut self, in_place: bool) {
        self.in_place = in_place;
    }

    pub fn is_in_place(&self) -> bool {
        self.in_place
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes.get(id.0).ok_or_else(|| Error::InvalidNode {
            node: id.to_string(),
            reason: format!("no such node in function '{}'", self.name),
        })
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.names.get(name).map(|id| &self.nodes[id.0])
    }

    /// Append a node. Node inputs must already exist; the name is made unique
    /// by appending a counter when it is taken.
    pub fn add_node(
        &mut self,
        name: impl Into<String>,
        kind: NodeKind,
        inputs: Vec<NodeRef>,
        ty: Option<Type>,
    ) -> Result<NodeId> {
        let name = self.unique_name(name.into());
        if let Some(arity) = kind.arity() {
            if inputs.len() != arity {
                return Err(Error::InvalidNode {
                    node: name,
                    reason: format!("{} expects {} inputs, got {}", kind, arity, inputs.len()),
                });
            }
        }
        for input in &inputs {
            if let NodeRef::Node(id) = input {
                if id.0 >= self.nodes.len() {
                    return Err(Error::InvalidNode {
                        node: name,
                        reason: format!("input {id} does not exist yet"),
                    });
                }
            }
        }

        let id = NodeId(self.nodes.len());
        self.names.insert(name.clone(), id);
        self.nodes.push(Node {
            id,
            name,
            kind,
            inputs,
            ty,
        });
        Ok(id)
    }

    fn unique_name(&self, base: String) -> String {
        if !self.names.contains_key(&base) {
            return base;
        }
        (1..)
            .map(|n| format!("{base}{n}"))
            .find(|candidate| !self.names.contains_key(candidate))
            .unwrap_or(base)
    }

    /// Number of nodes consuming each node, indexed by node id.
    pub fn use_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.nodes.len()];
        for node in &self.nodes {
            for input in &node.inputs {
                if let NodeRef::Node(id) = input {
                    counts[id.0] += 1;
                }
            }
        }
        counts
    }

    /// Deterministic topological order (Kahn's algorithm, smallest ready id
    /// first).
    pub fn topo_order(&self) -> Result<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); n];

        for node in &self.nodes {
            for input in &node.inputs {
                if let NodeRef::Node(id) = input {
                    if id.0 >= n {
                        return Err(Error::InvalidNode {
                            node: node.name.clone(),
                            reason: format!("input {id} does not exist"),
                        });
                    }
                    users[id.0].push(node.id.0);
                    in_degree[node.id.0] += 1;
                }
            }
        }

        let mut ready: BTreeSet<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(n);
        while let Some(u) = ready.pop_first() {
            order.push(NodeId(u));
            for &v in &users[u] {
                in_degree[v] -= 1;
                if in_degree[v] == 0 {
                    ready.insert(v);
                }
            }
        }

        if order.len() != n {
            return Err(Error::Cycle(self.name.clone()));
        }
        Ok(order)
    }

    /// Pretty-print the graph for debugging.
    pub fn dump(&self) -> String {
        let mut out = format!("=== Function: {} ({} nodes) ===\n", self.name, self.nodes.len());
        for node in &self.nodes {
            let inputs: Vec<String> = node.inputs.iter().map(|r| r.to_string()).collect();
            let ty = node
                .ty
                .as_ref()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  {} [{}]: {} <- [{}] :: {}\n",
                node.id,
                node.name,
                node.kind,
                inputs.join(", "),
                ty
            ));
        }
        out
    }
}

/// Owner of variables and functions.
#[derive(Debug)]
pub struct Module {
    variables: Vec<Variable>,
    variable_names: HashMap<String, VarId>,
    functions: Vec<Function>,
    rng: StdRng,
}

impl Default for Module {
    fn default() -> Self {
        Self::new()
    }
}

impl Module {
    pub fn new() -> Self {
        Self::with_seed(DEFAULT_SEED)
    }

    /// Module whose random initializers draw from a generator seeded with `seed`.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            variables: Vec::new(),
            variable_names: HashMap::new(),
            functions: Vec::new(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Create a variable. Names are unique per module; a collision is a
    /// configuration error.
    pub fn create_variable(
        &mut self,
        name: impl Into<String>,
        ty: Type,
        visibility: Visibility,
        train: TrainKind,
    ) -> Result<VarId> {
        let name = name.into();
        if self.variable_names.contains_key(&name) {
            return Err(Error::DuplicateName {
                name,
                scope: "module variables",
            });
        }

        let payload = match train {
            TrainKind::None => Tensor::zeros(ty.clone()),
            TrainKind::Broadcast(value) => Tensor::full(ty.clone(), value),
            TrainKind::Xavier(fan_in) => {
                init_tensor_xavier_uniform(ty.clone(), fan_in, &mut self.rng)?
            }
        };

        let id = VarId(self.variables.len());
        self.variable_names.insert(name.clone(), id);
        self.variables.push(Variable {
            id,
            name,
            ty,
            visibility,
            train,
            payload,
        });
        Ok(id)
    }

    /// Return the variable called `name`, creating it when missing. An
    /// existing variable of a different type is a name collision.
    pub fn ensure_variable(
        &mut self,
        name: &str,
        ty: Type,
        visibility: Visibility,
        train: TrainKind,
    ) -> Result<VarId> {
        match self.variable_names.get(name) {
            Some(&id) if self.variables[id.0].ty == ty => Ok(id),
            Some(_) => Err(Error::DuplicateName {
                name: name.to_string(),
                scope: "module variables",
            }),
            None => self.create_variable(name, ty, visibility, train),
        }
    }

    pub fn variable(&self, id: VarId) -> Result<&Variable> {
        self.variables
            .get(id.0)
            .ok_or_else(|| Error::UnknownVariable(id.to_string()))
    }

    pub fn variable_by_name(&self, name: &str) -> Option<VarId> {
        self.variable_names.get(name).copied()
    }

    pub fn variables(&self) -> &[Variable] {
        &self.variables
    }

    /// Replace a variable's initializer.
    pub fn set_payload(&mut self, id: VarId, payload: Tensor) -> Result<()> {
        let var = self
            .variables
            .get_mut(id.0)
            .ok_or_else(|| Error::UnknownVariable(id.to_string()))?;
        if payload.ty() != &var.ty {
            return Err(Error::PayloadMismatch {
                name: var.name.clone(),
                expected: var.ty.to_string(),
                got: payload.ty().to_string(),
            });
        }
        var.payload = payload;
        Ok(())
    }

    /// Fill a variable's initializer with a constant.
    pub fn fill_payload(&mut self, id: VarId, value: f32) -> Result<()> {
        let var = self
            .variables
            .get_mut(id.0)
            .ok_or_else(|| Error::UnknownVariable(id.to_string()))?;
        var.payload.fill(value);
        Ok(())
    }

    pub fn create_function(&mut self, name: impl Into<String>) -> Result<FunctionId> {
        self.add_function(Function::new(name))
    }

    pub fn add_function(&mut self, function: Function) -> Result<FunctionId> {
        if self.functions.iter().any(|f| f.name() == function.name()) {
            return Err(Error::DuplicateName {
                name: function.name().to_string(),
                scope: "module functions",
            });
        }
        self.functions.push(function);
        Ok(FunctionId(self.functions.len() - 1))
    }

    pub fn function(&self, id: FunctionId) -> Result<&Function> {
        self.functions.get(id.0).ok_or(Error::UnknownFunction(id.0))
    }

    pub fn function_mut(&mut self, id: FunctionId) -> Result<&mut Function> {
        self.functions.get_mut(id.0).ok_or(Error::UnknownFunction(id.0))
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// Type of a value as seen from `function`.
    pub fn type_of(&self, function: &Function, value: NodeRef) -> Result<Type> {
        match value {
            NodeRef::Variable(id) => Ok(self.variable(id)?.ty.clone()),
            NodeRef::Node(id) => {
                let node = function.node(id)?;
                node.ty
                    .clone()
                    .ok_or_else(|| Error::UnresolvedType(node.name.clone()))
            }
        }
    }

    /// Human readable name of a value.
    pub fn name_of(&self, function: &Function, value: NodeRef) -> String {
        match value {
            NodeRef::Variable(id) => self
                .variable(id)
                .map(|v| v.name.clone())
                .unwrap_or_else(|_| id.to_string()),
            NodeRef::Node(id) => function
                .node(id)
                .map(|n| n.name.clone())
                .unwrap_or_else(|_| id.to_string()),
        }
    }
}
