pub mod shape_inference;

use thiserror::Error;

pub type NodeId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    F32,
    F64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    pub data_type: DataType,
    pub dims: Vec<usize>,
}

impl Shape {
    pub fn new(data_type: DataType, dims: Vec<usize>) -> Self {
        Self { data_type, dims }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Traversal mode of a recurrent operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
    Bidirectional,
}

impl Direction {
    /// Size of the direction axis of W, R, bias and initial state.
    pub fn num_directions(self) -> usize {
        match self {
            Self::Forward | Self::Reverse => 1,
            Self::Bidirectional => 2,
        }
    }
}

/// Unary activation usable as a recurrent gate function.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Activation {
    Sigmoid,
    Tanh,
    Relu,
    LeakyRelu { alpha: f32 },
    Elu { alpha: f32 },
    HardSigmoid { alpha: f32, beta: f32 },
    Softsign,
    Softplus,
}

impl Activation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sigmoid => "sigmoid",
            Self::Tanh => "tanh",
            Self::Relu => "relu",
            Self::LeakyRelu { .. } => "leaky_relu",
            Self::Elu { .. } => "elu",
            Self::HardSigmoid { .. } => "hard_sigmoid",
            Self::Softsign => "softsign",
            Self::Softplus => "softplus",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RnnOp {
    pub direction: Direction,
    pub activations: Vec<Activation>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GruOp {
    pub direction: Direction,
    pub activations: Vec<Activation>,
    pub linear_before_reset: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Parameter { name: String },
    /// Constant tensor; values are held as `f32` whatever the node's data type.
    Literal { values: Vec<f32> },
    /// Placeholder for an optional operand that was not supplied.
    Undefined,
    Slice {
        axes: Vec<usize>,
        starts: Vec<usize>,
        ends: Vec<usize>,
    },
    /// Removes the listed unit axes, or every unit axis when `axes` is empty.
    Squeeze { axes: Vec<usize> },
    /// Inserts unit axes at the listed positions of the output.
    Unsqueeze { axes: Vec<usize> },
    Transpose { perm: Vec<usize> },
    /// Places the operand's dims at `axis` of `dims` and repeats along the rest.
    Broadcast { axis: usize, dims: Vec<usize> },
    Add,
    Sub,
    Mul,
    Dot,
    Concat { axis: usize },
    Activation(Activation),
    Identity,
    Rnn(RnnOp),
    Gru(GruOp),
    /// Final hidden state of the recurrent node it consumes.
    RnnLastOutput,
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Parameter { .. } => "parameter",
            Op::Literal { .. } => "literal",
            Op::Undefined => "undefined",
            Op::Slice { .. } => "slice",
            Op::Squeeze { .. } => "squeeze",
            Op::Unsqueeze { .. } => "unsqueeze",
            Op::Transpose { .. } => "transpose",
            Op::Broadcast { .. } => "broadcast",
            Op::Add => "add",
            Op::Sub => "sub",
            Op::Mul => "mul",
            Op::Dot => "dot",
            Op::Concat { .. } => "concat",
            Op::Activation(act) => act.name(),
            Op::Identity => "identity",
            Op::Rnn(_) => "rnn",
            Op::Gru(_) => "gru",
            Op::RnnLastOutput => "rnn_last_output",
        }
    }

    pub fn is_recurrent(&self) -> bool {
        matches!(self, Op::Rnn(_) | Op::Gru(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IrError {
    #[error("Unknown node {0}")]
    UnknownNode(NodeId),
    #[error("Node {0} cannot consume itself")]
    SelfReference(NodeId),
    #[error("{0} nodes cannot be built from operands")]
    LeafOp(&'static str),
    #[error("{op} expects {expected} operands, got {actual}")]
    Arity {
        op: &'static str,
        expected: &'static str,
        actual: usize,
    },
    #[error("{op}: axis {axis} is out of range for rank {rank}")]
    AxisOutOfRange {
        op: &'static str,
        axis: usize,
        rank: usize,
    },
    #[error("{op}: axis {axis} is listed twice")]
    DuplicateAxis { op: &'static str, axis: usize },
    #[error("slice needs one start and end per axis, got {axes} axes, {starts} starts, {ends} ends")]
    SliceSpec {
        axes: usize,
        starts: usize,
        ends: usize,
    },
    #[error("slice [{start}, {end}) is out of bounds for axis {axis} of size {dim}")]
    SliceOutOfBounds {
        axis: usize,
        start: usize,
        end: usize,
        dim: usize,
    },
    #[error("cannot squeeze axis {axis} of size {dim}")]
    SqueezeNonUnit { axis: usize, dim: usize },
    #[error("invalid permutation {perm:?} for rank {rank}")]
    InvalidPermutation { perm: Vec<usize>, rank: usize },
    #[error("cannot broadcast {from:?} into {to:?} at axis {axis}")]
    BroadcastMismatch {
        from: Vec<usize>,
        to: Vec<usize>,
        axis: usize,
    },
    #[error("{op}: incompatible shapes {lhs:?} and {rhs:?}")]
    IncompatibleShapes {
        op: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("Data type mismatch: {lhs:?} and {rhs:?}")]
    DataTypeMismatch { lhs: DataType, rhs: DataType },
    #[error("{op} operand {slot} has shape {actual:?}, expected {expected}")]
    RecurrentOperand {
        op: &'static str,
        slot: usize,
        actual: Vec<usize>,
        expected: String,
    },
    #[error("Replacing node {node} changes its shape from {expected:?} to {actual:?}")]
    ReplacementShape {
        node: NodeId,
        expected: Shape,
        actual: Shape,
    },
    #[error("Literal of shape {dims:?} needs {expected} values, got {actual}")]
    LiteralSize {
        dims: Vec<usize>,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub op: Op,
    pub inputs: Vec<NodeId>,
    pub shape: Shape,
    consumers: Vec<NodeId>,
    prev: Option<NodeId>,
    next: Option<NodeId>,
}

impl Node {
    /// Nodes that take this node as an operand, in the order they were attached.
    pub fn consumers(&self) -> &[NodeId] {
        &self.consumers
    }
}

/// Arena of nodes with stable ids.
///
/// Program order is a doubly linked list threaded through the arena, so
/// inserting before an existing node never moves or renumbers anything.
/// `replace` rewrites a node's op and operands in place; every consumer of
/// the id observes the new operation.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<Node>,
    head: Option<NodeId>,
    tail: Option<NodeId>,
    outputs: Vec<NodeId>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn op(&self, id: NodeId) -> &Op {
        &self.nodes[id].op
    }

    pub fn inputs(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].inputs
    }

    pub fn shape(&self, id: NodeId) -> &Shape {
        &self.nodes[id].shape
    }

    pub fn consumers(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id].consumers
    }

    pub fn outputs(&self) -> &[NodeId] {
        &self.outputs
    }

    pub fn add_output(&mut self, id: NodeId) -> Result<(), IrError> {
        self.check(id)?;
        self.outputs.push(id);
        Ok(())
    }

    /// Nodes in program (topological) order.
    pub fn iter(&self) -> impl Iterator<Item = &Node> + '_ {
        std::iter::successors(self.head.map(|id| &self.nodes[id]), move |node| {
            node.next.map(|id| &self.nodes[id])
        })
    }

    /// Snapshot of the current program order.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.iter().map(|node| node.id).collect()
    }

    pub fn add_parameter(&mut self, name: impl Into<String>, shape: Shape) -> NodeId {
        let id = self.alloc(Op::Parameter { name: name.into() }, Vec::new(), shape);
        self.link_before(id, None);
        id
    }

    pub fn add_undefined(&mut self) -> NodeId {
        let id = self.alloc(Op::Undefined, Vec::new(), Shape::new(DataType::F32, Vec::new()));
        self.link_front(id);
        id
    }

    /// Materializes a constant tensor at the head of the program.
    pub fn add_literal(&mut self, shape: Shape, values: Vec<f32>) -> Result<NodeId, IrError> {
        if values.len() != shape.elements() {
            return Err(IrError::LiteralSize {
                expected: shape.elements(),
                actual: values.len(),
                dims: shape.dims,
            });
        }
        let id = self.alloc(Op::Literal { values }, Vec::new(), shape);
        self.link_front(id);
        Ok(id)
    }

    /// Appends a computed node at the end of the program.
    pub fn add_node(&mut self, op: Op, inputs: Vec<NodeId>) -> Result<NodeId, IrError> {
        let shape = self.infer(&op, &inputs)?;
        let id = self.alloc(op, inputs, shape);
        self.link_before(id, None);
        Ok(id)
    }

    pub fn insert_before(
        &mut self,
        anchor: NodeId,
        op: Op,
        inputs: Vec<NodeId>,
    ) -> Result<NodeId, IrError> {
        self.check(anchor)?;
        let shape = self.infer(&op, &inputs)?;
        let id = self.alloc(op, inputs, shape);
        self.link_before(id, Some(anchor));
        Ok(id)
    }

    pub fn replace(&mut self, anchor: NodeId, op: Op, inputs: Vec<NodeId>) -> Result<(), IrError> {
        self.check(anchor)?;
        if inputs.contains(&anchor) {
            return Err(IrError::SelfReference(anchor));
        }
        let shape = self.infer(&op, &inputs)?;
        if shape != self.nodes[anchor].shape {
            return Err(IrError::ReplacementShape {
                node: anchor,
                expected: self.nodes[anchor].shape.clone(),
                actual: shape,
            });
        }

        let old_inputs = std::mem::take(&mut self.nodes[anchor].inputs);
        for input in old_inputs {
            self.nodes[input].consumers.retain(|&c| c != anchor);
        }
        self.register_consumer(anchor, &inputs);
        let node = &mut self.nodes[anchor];
        node.op = op;
        node.inputs = inputs;
        Ok(())
    }

    fn check(&self, id: NodeId) -> Result<(), IrError> {
        if id < self.nodes.len() {
            Ok(())
        } else {
            Err(IrError::UnknownNode(id))
        }
    }

    fn infer(&self, op: &Op, inputs: &[NodeId]) -> Result<Shape, IrError> {
        let mut operands = Vec::with_capacity(inputs.len());
        for &input in inputs {
            operands.push(self.get(input).ok_or(IrError::UnknownNode(input))?);
        }
        shape_inference::infer_shape(op, &operands)
    }

    fn alloc(&mut self, op: Op, inputs: Vec<NodeId>, shape: Shape) -> NodeId {
        let id = self.nodes.len();
        self.register_consumer(id, &inputs);
        self.nodes.push(Node {
            id,
            op,
            inputs,
            shape,
            consumers: Vec::new(),
            prev: None,
            next: None,
        });
        id
    }

    fn register_consumer(&mut self, consumer: NodeId, inputs: &[NodeId]) {
        for &input in inputs {
            let consumers = &mut self.nodes[input].consumers;
            if !consumers.contains(&consumer) {
                consumers.push(consumer);
            }
        }
    }

    fn link_front(&mut self, id: NodeId) {
        let head = self.head;
        self.link_before(id, head);
    }

    /// Links `id` before `anchor`, or at the tail when there is no anchor.
    fn link_before(&mut self, id: NodeId, anchor: Option<NodeId>) {
        let prev = match anchor {
            Some(anchor) => self.nodes[anchor].prev,
            None => self.tail,
        };
        self.nodes[id].prev = prev;
        self.nodes[id].next = anchor;
        match prev {
            Some(prev) => self.nodes[prev].next = Some(id),
            None => self.head = Some(id),
        }
        match anchor {
            Some(anchor) => self.nodes[anchor].prev = Some(id),
            None => self.tail = Some(id),
        }
    }
}
