//! Graph inspection: converts an expression into an indexed `daggy` DAG and
//! renders it as Graphviz DOT.

use crate::engine::{Evaluator, Expr, Node, NodeId};
use crate::error::{Error, Result};
use daggy::{Dag, NodeIndex};
use num_traits::Float;
use std::{collections::HashMap, fmt, sync::Arc};

/// Which operand slot an edge feeds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Input,
    Lhs,
    Rhs,
}

impl Operand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operand::Input => "in",
            Operand::Lhs => "lhs",
            Operand::Rhs => "rhs",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeLabel {
    pub id: NodeId,
    pub kind: String,
    pub is_variable: bool,
}

fn operands(node: &Node) -> Vec<(Operand, &Arc<Node>)> {
    match node {
        Node::Variable => Vec::new(),
        Node::Unary { input, .. } => vec![(Operand::Input, input)],
        Node::Binary { lhs, rhs, .. } => vec![(Operand::Lhs, lhs), (Operand::Rhs, rhs)],
    }
}

/// One DAG node per distinct graph node, operands added before their
/// results. Edges point from operand to result.
pub fn to_dag(expr: &Expr) -> Result<Dag<NodeLabel, Operand>> {
    let root = expr.root().ok_or(Error::EmptyExpression)?;
    let mut dag = Dag::new();
    let mut indices: HashMap<NodeId, NodeIndex> = HashMap::new();

    let mut stack: Vec<&Arc<Node>> = vec![root];
    while let Some(&top) = stack.last() {
        let id = NodeId::of(top);
        if indices.contains_key(&id) {
            stack.pop();
            continue;
        }

        let pending: Vec<&Arc<Node>> = top
            .children()
            .into_iter()
            .filter(|child| !indices.contains_key(&NodeId::of(child)))
            .collect();
        if !pending.is_empty() {
            stack.extend(pending.into_iter().rev());
            continue;
        }

        stack.pop();
        let index = dag.add_node(NodeLabel {
            id,
            kind: top.to_string(),
            is_variable: top.is_variable(),
        });
        for (operand, child) in operands(top) {
            dag.add_edge(indices[&NodeId::of(child)], index, operand)
                .map_err(|_| Error::WouldCycle)?;
        }
        indices.insert(id, index);
    }

    Ok(dag)
}

/// Graphviz source for `expr`, annotated with the evaluator's cached values
/// (`?` for nodes the last pass did not reach).
pub fn to_dot<T>(expr: &Expr, evaluator: &Evaluator<T>) -> Result<String>
where
    T: Float + fmt::Display,
{
    let dag = to_dag(expr)?;

    let mut content = String::new();
    content.push_str("digraph {\n");
    content.push_str(r#"rankdir="LR""#);
    content.push_str("\nnode [shape=record]\n");

    // Operator nodes get a separate circle that their operands point into.
    for (index, node) in dag.raw_nodes().iter().enumerate() {
        let label = &node.weight;
        let value = evaluator
            .value_of(label.id)
            .map_or_else(|| "?".to_string(), |v| format!("{:.4}", v));

        if label.is_variable {
            content.push_str(&format!(
                "    {} [label=\"{{ var {} | {} }}\"]\n",
                index, index, value
            ));
        } else {
            content.push_str(&format!(
                "    {} [label=\"{{ n{} | {} }}\"]\n",
                index, index, value
            ));
            content.push_str(&format!(
                "    op{} [label=\"{}\" shape=circle]\n",
                index, label.kind
            ));
            content.push_str(&format!("    op{} -> {}\n", index, index));
        }
    }

    for edge in dag.raw_edges() {
        content.push_str(&format!(
            "    {} -> op{} [label=\"{}\"]\n",
            edge.source().index(),
            edge.target().index(),
            edge.weight.as_str()
        ));
    }
    content.push('}');

    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_nodes_appear_once() {
        let mut ev = Evaluator::<f64>::new();
        let x = ev.constant(2.0);
        let y = ev.constant(3.0);
        let e = (&x + &y) * &x;

        let dag = to_dag(&e).unwrap();
        assert_eq!(dag.node_count(), 4);
        assert_eq!(dag.edge_count(), 4);

        // Operands precede results, so the root is last.
        let last = dag.raw_nodes().last().unwrap();
        assert_eq!(Some(last.weight.id), e.id());
        assert_eq!(last.weight.kind, "*");
    }

    #[test]
    fn square_keeps_both_operand_edges() {
        let mut ev = Evaluator::<f64>::new();
        let x = ev.constant(2.0);
        let dag = to_dag(&(&x * &x)).unwrap();

        assert_eq!(dag.node_count(), 2);
        let slots: Vec<Operand> = dag.raw_edges().iter().map(|e| e.weight).collect();
        assert_eq!(slots, vec![Operand::Lhs, Operand::Rhs]);
    }

    #[test]
    fn dot_lists_values_and_operators() {
        let mut ev = Evaluator::<f64>::new();
        let a = ev.constant(-2.0);
        let b = ev.constant(3.0);
        let d = &a * &b;
        let f = (&d * (&a + &b)).tanh();
        ev.evaluate(&d).unwrap();

        let dot = to_dot(&f, &ev).unwrap();
        assert!(dot.starts_with("digraph {\nrankdir=\"LR\""));
        assert!(dot.contains("-2.0000"));
        assert!(dot.contains("-6.0000"));
        assert!(dot.contains("[label=\"tanh\" shape=circle]"));
        // Only `d` was evaluated, so the rest show as unknown.
        assert!(dot.contains("| ? }"));
        assert!(dot.ends_with('}'));
    }

    #[test]
    fn empty_expression_has_no_graph() {
        assert_eq!(to_dag(&Expr::empty()).err(), Some(Error::EmptyExpression));
    }
}
