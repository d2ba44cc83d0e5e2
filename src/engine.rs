use crate::error::{Error, Result};
use num_traits::Float;
use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    ops::{Add, Mul, Sub},
    sync::Arc,
};
use tracing::trace;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Sqrt,
    Tanh,
}

impl UnaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Tanh => "tanh",
        }
    }

    fn apply<T: Float>(&self, x: T) -> T {
        match self {
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Tanh => x.tanh(),
        }
    }

    // d/dx op(x). sqrt is unguarded at zero and yields infinity there.
    fn derivative<T: Float>(&self, x: T) -> T {
        match self {
            UnaryOp::Sqrt => T::one() / ((T::one() + T::one()) * x.sqrt()),
            UnaryOp::Tanh => {
                let t = x.tanh();
                T::one() - t * t
            }
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
}

impl BinaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
        }
    }

    fn apply<T: Float>(&self, lhs: T, rhs: T) -> T {
        match self {
            BinaryOp::Add => lhs + rhs,
            BinaryOp::Sub => lhs - rhs,
            BinaryOp::Mul => lhs * rhs,
        }
    }

    // Combines operand values (l, r) and operand derivatives (dl, dr).
    fn derivative<T: Float>(&self, l: T, r: T, dl: T, dr: T) -> T {
        match self {
            BinaryOp::Add => dl + dr,
            BinaryOp::Sub => dl - dr,
            BinaryOp::Mul => l * dr + dl * r,
        }
    }
}

/// A vertex of the expression DAG. Immutable once built; shared by every
/// parent through `Arc`, compared by identity.
pub enum Node {
    Variable,
    Unary {
        op: UnaryOp,
        input: Arc<Node>,
    },
    Binary {
        op: BinaryOp,
        lhs: Arc<Node>,
        rhs: Arc<Node>,
    },
}

impl Node {
    pub fn is_variable(&self) -> bool {
        matches!(self, Node::Variable)
    }

    /// Operands in evaluation order.
    pub fn children(&self) -> Vec<&Arc<Node>> {
        match self {
            Node::Variable => Vec::new(),
            Node::Unary { input, .. } => vec![input],
            Node::Binary { lhs, rhs, .. } => vec![lhs, rhs],
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Node::Variable => write!(f, "var"),
            Node::Unary { op, .. } => write!(f, "{}", op.as_str()),
            Node::Binary { op, .. } => write!(f, "{}", op.as_str()),
        }
    }
}

// Shallow on purpose: a DAG with fan-in would print exponentially.
impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Node({})", self)
    }
}

/// Identity of a live node: the address of its shared allocation.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    pub fn of(node: &Arc<Node>) -> Self {
        NodeId(Arc::as_ptr(node) as usize)
    }
}

/// Handle on an optional root node. Combinators build a new node that
/// references the existing roots; nothing is copied or mutated.
#[derive(Clone, Default)]
pub struct Expr {
    root: Option<Arc<Node>>,
}

impl Expr {
    fn variable() -> Self {
        Self {
            root: Some(Arc::new(Node::Variable)),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_none()
    }

    pub fn root(&self) -> Option<&Arc<Node>> {
        self.root.as_ref()
    }

    pub fn id(&self) -> Option<NodeId> {
        self.root.as_ref().map(NodeId::of)
    }

    /// True when both handles point at the very same node.
    pub fn ptr_eq(&self, other: &Expr) -> bool {
        match (&self.root, &other.root) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn require_root(&self) -> Result<&Arc<Node>> {
        self.root.as_ref().ok_or(Error::EmptyExpression)
    }

    fn binary(&self, op: BinaryOp, rhs: &Expr) -> Result<Expr> {
        let node = Node::Binary {
            op,
            lhs: Arc::clone(self.require_root()?),
            rhs: Arc::clone(rhs.require_root()?),
        };
        Ok(Expr {
            root: Some(Arc::new(node)),
        })
    }

    fn unary(&self, op: UnaryOp) -> Result<Expr> {
        let node = Node::Unary {
            op,
            input: Arc::clone(self.require_root()?),
        };
        Ok(Expr {
            root: Some(Arc::new(node)),
        })
    }

    pub fn try_add(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn try_sub(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn try_mul(&self, rhs: &Expr) -> Result<Expr> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn try_sqrt(&self) -> Result<Expr> {
        self.unary(UnaryOp::Sqrt)
    }

    pub fn try_tanh(&self) -> Result<Expr> {
        self.unary(UnaryOp::Tanh)
    }

    /// Panics if the handle is empty; see [`Expr::try_sqrt`].
    pub fn sqrt(&self) -> Expr {
        self.try_sqrt()
            .unwrap_or_else(|err| panic!("sqrt of empty expression: {}", err))
    }

    /// Panics if the handle is empty; see [`Expr::try_tanh`].
    pub fn tanh(&self) -> Expr {
        self.try_tanh()
            .unwrap_or_else(|err| panic!("tanh of empty expression: {}", err))
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.root {
            Some(node) => write!(f, "Expr({} @ {:#x})", node, NodeId::of(node).0),
            None => write!(f, "Expr(empty)"),
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Expr {}

impl Hash for Expr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

// Operator forms of the fallible combinators, for owned and borrowed operands.
macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $try_method:ident) => {
        impl $trait<&Expr> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                self.$try_method(rhs).unwrap_or_else(|err| {
                    panic!("{} on empty expression: {}", stringify!($method), err)
                })
            }
        }

        impl $trait<Expr> for Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Expr> for Expr {
            type Output = Expr;

            fn $method(self, rhs: &Expr) -> Expr {
                (&self).$method(rhs)
            }
        }

        impl $trait<Expr> for &Expr {
            type Output = Expr;

            fn $method(self, rhs: Expr) -> Expr {
                self.$method(&rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, try_add);
impl_binary_op!(Sub, sub, try_sub);
impl_binary_op!(Mul, mul, try_mul);

#[derive(Clone)]
struct Slot<T> {
    node: Arc<Node>,
    value: T,
}

/// Snapshot of an evaluator's value table. The graph itself is shared and
/// never part of a checkpoint.
#[derive(Clone)]
pub struct Checkpoint<T>
where
    T: Float,
{
    values: HashMap<NodeId, Slot<T>>,
}

impl<T> Checkpoint<T>
where
    T: Float,
{
    /// Value recorded for `expr`'s root, if the snapshot holds one.
    pub fn value(&self, expr: &Expr) -> Option<T> {
        self.values.get(&expr.id()?).map(|slot| slot.value)
    }
}

/// Owns the value table for a set of variables and evaluates expressions
/// built over them.
#[derive(Clone)]
pub struct Evaluator<T>
where
    T: Float,
{
    values: HashMap<NodeId, Slot<T>>,
    computed: usize,
}

impl<T> Evaluator<T>
where
    T: Float,
{
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            computed: 0,
        }
    }

    /// Registers a new variable holding `value`.
    pub fn constant(&mut self, value: T) -> Expr {
        let expr = Expr::variable();
        if let Some(node) = expr.root() {
            self.store(node, value);
        }
        expr
    }

    /// Registers a new variable initialised to zero.
    pub fn parameter(&mut self) -> Expr {
        self.constant(T::zero())
    }

    fn variable_slot(&self, parameter: &Expr) -> Result<NodeId> {
        let node = parameter.require_root()?;
        let id = NodeId::of(node);
        if node.is_variable() && self.values.contains_key(&id) {
            Ok(id)
        } else {
            Err(Error::NotRegistered)
        }
    }

    pub fn get_parameter(&self, parameter: &Expr) -> Result<T> {
        let id = self.variable_slot(parameter)?;
        self.values
            .get(&id)
            .map(|slot| slot.value)
            .ok_or(Error::NotRegistered)
    }

    pub fn set_parameter(&mut self, parameter: &Expr, value: T) -> Result<()> {
        let id = self.variable_slot(parameter)?;
        let slot = self.values.get_mut(&id).ok_or(Error::NotRegistered)?;
        slot.value = value;
        Ok(())
    }

    /// Cached value of any node from the last forward pass, or of a variable.
    pub fn value(&self, expr: &Expr) -> Result<T> {
        let node = expr.require_root()?;
        self.cached(node).ok_or(Error::NotEvaluated)
    }

    pub fn value_of(&self, id: NodeId) -> Option<T> {
        self.values.get(&id).map(|slot| slot.value)
    }

    /// Number of operator nodes computed by the last forward pass.
    pub fn computed_nodes(&self) -> usize {
        self.computed
    }

    pub fn variable_count(&self) -> usize {
        self.values
            .values()
            .filter(|slot| slot.node.is_variable())
            .count()
    }

    fn cached(&self, node: &Arc<Node>) -> Option<T> {
        self.values.get(&NodeId::of(node)).map(|slot| slot.value)
    }

    fn store(&mut self, node: &Arc<Node>, value: T) {
        self.values.insert(
            NodeId::of(node),
            Slot {
                node: Arc::clone(node),
                value,
            },
        );
    }

    /// Forward pass from `expr`. Cached operator values from earlier passes
    /// are discarded first; each reachable node is computed exactly once.
    pub fn evaluate(&mut self, expr: &Expr) -> Result<T> {
        let root = expr.require_root()?;

        self.values.retain(|_, slot| slot.node.is_variable());
        self.computed = 0;

        // Post-order walk: a node is popped only once its operands are cached.
        let mut stack: Vec<&Arc<Node>> = vec![root];
        while let Some(&top) = stack.last() {
            if self.cached(top).is_some() {
                stack.pop();
                continue;
            }

            match top.as_ref() {
                // Registered variables are always cached, so this one belongs elsewhere.
                Node::Variable => return Err(Error::NotRegistered),
                Node::Unary { op, input } => match self.cached(input) {
                    Some(x) => {
                        stack.pop();
                        self.store(top, op.apply(x));
                        self.computed += 1;
                    }
                    None => stack.push(input),
                },
                Node::Binary { op, lhs, rhs } => match (self.cached(lhs), self.cached(rhs)) {
                    (Some(l), Some(r)) => {
                        stack.pop();
                        self.store(top, op.apply(l, r));
                        self.computed += 1;
                    }
                    (l, r) => {
                        if r.is_none() {
                            stack.push(rhs);
                        }
                        if l.is_none() {
                            stack.push(lhs);
                        }
                    }
                },
            }
        }

        trace!(computed = self.computed, "forward pass");
        self.cached(root).ok_or(Error::NotEvaluated)
    }

    /// d(expr)/d(parameter) by forward-mode propagation over a fresh
    /// derivative table. Reads forward values cached by the last
    /// [`Evaluator::evaluate`]; nodes missing from the table count as zero,
    /// so a stale table silently gives stale derivatives.
    pub fn evaluate_delta(&self, expr: &Expr, parameter: &Expr) -> Result<T> {
        let root = expr.require_root()?;
        let target = NodeId::of(parameter.require_root()?);
        let forward = |node: &Arc<Node>| self.cached(node).unwrap_or_else(T::zero);

        let mut deltas: HashMap<NodeId, T> = HashMap::new();
        let mut stack: Vec<&Arc<Node>> = vec![root];
        while let Some(&top) = stack.last() {
            let id = NodeId::of(top);
            if deltas.contains_key(&id) {
                stack.pop();
                continue;
            }

            match top.as_ref() {
                Node::Variable => {
                    stack.pop();
                    let seed = if id == target { T::one() } else { T::zero() };
                    deltas.insert(id, seed);
                }
                Node::Unary { op, input } => match deltas.get(&NodeId::of(input)).copied() {
                    Some(d) => {
                        stack.pop();
                        deltas.insert(id, op.derivative(forward(input)) * d);
                    }
                    None => stack.push(input),
                },
                Node::Binary { op, lhs, rhs } => {
                    let dl = deltas.get(&NodeId::of(lhs)).copied();
                    let dr = deltas.get(&NodeId::of(rhs)).copied();
                    match (dl, dr) {
                        (Some(dl), Some(dr)) => {
                            stack.pop();
                            deltas.insert(id, op.derivative(forward(lhs), forward(rhs), dl, dr));
                        }
                        (dl, dr) => {
                            if dr.is_none() {
                                stack.push(rhs);
                            }
                            if dl.is_none() {
                                stack.push(lhs);
                            }
                        }
                    }
                }
            }
        }

        Ok(deltas.get(&NodeId::of(root)).copied().unwrap_or_else(T::zero))
    }

    pub fn checkpoint(&self) -> Checkpoint<T> {
        Checkpoint {
            values: self.values.clone(),
        }
    }

    /// Replaces the whole value table with the snapshot's.
    pub fn restore(&mut self, checkpoint: &Checkpoint<T>) {
        self.values = checkpoint.values.clone();
        self.computed = 0;
    }
}

impl<T> Default for Evaluator<T>
where
    T: Float,
{
    fn default() -> Self {
        Self::new()
    }
}
