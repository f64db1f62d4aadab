//! DAG composition: named nodes, conditional edges, validated topology
//!
//! A node runs when all of its incoming edges' conditions evaluate true on
//! the producer outputs. Nodes whose conditions are not met (or whose
//! producers were skipped) are skipped, and skips propagate downstream.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::task::JoinSet;

use super::{TaskFn, TaskOptions};
use crate::error::FluxError;
use crate::workflow::WorkflowContext;

/// Predicate over a producer's output.
pub type EdgeCondition = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct Node {
    task: TaskFn,
    options: TaskOptions,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("task", &"<task fn>")
            .field("options", &"<task options>")
            .finish()
    }
}

struct Edge {
    from: String,
    to: String,
    condition: Option<EdgeCondition>,
}

impl std::fmt::Debug for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Edge")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("condition", &self.condition.as_ref().map(|_| "<condition fn>"))
            .finish()
    }
}

/// Builder for a [`Graph`]. `build` validates the topology.
#[derive(Default)]
pub struct GraphBuilder {
    name: String,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn node(self, name: impl Into<String>, task: TaskFn) -> Self {
        self.node_with(name, task, TaskOptions::default())
    }

    pub fn node_with(
        mut self,
        name: impl Into<String>,
        task: TaskFn,
        options: TaskOptions,
    ) -> Self {
        self.nodes.insert(name.into(), Node { task, options });
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: None,
        });
        self
    }

    pub fn edge_when<F>(
        mut self,
        from: impl Into<String>,
        to: impl Into<String>,
        condition: F,
    ) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.edges.push(Edge {
            from: from.into(),
            to: to.into(),
            condition: Some(Arc::new(condition)),
        });
        self
    }

    /// Validate and freeze the graph: every edge endpoint must name a
    /// node, the topology must be acyclic, and every end node (no outgoing
    /// edges) must be reachable from a start node.
    pub fn build(self) -> Result<Graph, FluxError> {
        if self.nodes.is_empty() {
            return Err(FluxError::validation("graph has no nodes"));
        }
        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(FluxError::validation(format!(
                        "edge references unknown node `{endpoint}`"
                    )));
                }
            }
        }

        let order = self.topo_order()?;

        // Reachability from start nodes (no incoming edges)
        let has_incoming: HashSet<&String> = self.edges.iter().map(|e| &e.to).collect();
        let starts: Vec<&String> = self
            .nodes
            .keys()
            .filter(|n| !has_incoming.contains(n))
            .collect();
        if starts.is_empty() {
            return Err(FluxError::validation("graph has no start node"));
        }
        let mut reachable: HashSet<String> = starts.iter().map(|s| s.to_string()).collect();
        for name in &order {
            if self
                .edges
                .iter()
                .any(|e| e.to == *name && reachable.contains(&e.from))
            {
                reachable.insert(name.clone());
            }
        }
        for (name, _) in &self.nodes {
            let is_end = !self.edges.iter().any(|e| e.from == *name);
            if is_end && !reachable.contains(name) {
                return Err(FluxError::validation(format!(
                    "end node `{name}` is unreachable"
                )));
            }
        }

        Ok(Graph {
            name: self.name,
            nodes: self.nodes,
            edges: self.edges,
            order,
        })
    }

    /// Kahn's algorithm; an unconsumed remainder means a cycle.
    fn topo_order(&self) -> Result<Vec<String>, FluxError> {
        let mut indegree: HashMap<&String, usize> =
            self.nodes.keys().map(|n| (n, 0)).collect();
        for edge in &self.edges {
            if let Some(degree) = indegree.get_mut(&edge.to) {
                *degree += 1;
            }
        }

        let mut ready: Vec<&String> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(n, _)| *n)
            .collect();
        ready.sort();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop() {
            order.push(node.clone());
            for edge in self.edges.iter().filter(|e| e.from == *node) {
                if let Some(degree) = indegree.get_mut(&edge.to) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(&edge.to);
                        ready.sort();
                    }
                }
            }
        }

        if order.len() != self.nodes.len() {
            return Err(FluxError::validation("graph contains a cycle"));
        }
        Ok(order)
    }
}

/// A validated DAG of tasks with conditional edges.
#[derive(Debug)]
pub struct Graph {
    name: String,
    nodes: BTreeMap<String, Node>,
    edges: Vec<Edge>,
    order: Vec<String>,
}

impl Graph {
    pub fn builder(name: impl Into<String>) -> GraphBuilder {
        GraphBuilder {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Execute the graph. Ready nodes run concurrently; the return value
    /// maps each end node that actually ran to its output.
    pub async fn run(
        &self,
        ctx: &WorkflowContext,
        input: Value,
    ) -> Result<Map<String, Value>, FluxError> {
        let scoped = ctx.at_scope(ctx.scope().child(&self.name));
        let mut outputs: HashMap<String, Value> = HashMap::new();
        let mut skipped: HashSet<String> = HashSet::new();
        let mut remaining: Vec<String> = self.order.clone();

        while !remaining.is_empty() {
            // All predecessors settled = ready
            let ready: Vec<String> = remaining
                .iter()
                .filter(|name| {
                    self.incoming(name).all(|e| {
                        outputs.contains_key(&e.from) || skipped.contains(&e.from)
                    })
                })
                .cloned()
                .collect();
            if ready.is_empty() {
                return Err(FluxError::internal("graph made no progress"));
            }
            remaining.retain(|n| !ready.contains(n));

            let mut set = JoinSet::new();
            for name in ready {
                match self.node_args(&name, &input, &outputs, &skipped) {
                    Some(args) => {
                        let node = &self.nodes[&name];
                        let child = scoped.branch(scoped.scope().clone());
                        let task = node.task.clone();
                        let options = node.options.clone();
                        set.spawn(async move {
                            let result =
                                child.task_with(&name, args, options, task).await;
                            (name, result)
                        });
                    }
                    None => {
                        skipped.insert(name);
                    }
                }
            }

            while let Some(joined) = set.join_next().await {
                let (name, result) = joined.map_err(|e| {
                    FluxError::internal(format!("graph node panicked: {e}"))
                })?;
                outputs.insert(name, result?);
            }
        }

        let mut end_outputs = Map::new();
        for (name, _) in &self.nodes {
            let is_end = !self.edges.iter().any(|e| e.from == *name);
            if is_end {
                if let Some(value) = outputs.get(name) {
                    end_outputs.insert(name.clone(), value.clone());
                }
            }
        }
        Ok(end_outputs)
    }

    fn incoming<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Edge> {
        self.edges.iter().filter(move |e| e.to == name)
    }

    /// Arguments for a ready node, or `None` when it should be skipped.
    ///
    /// A single producer passes its output through; multiple producers are
    /// keyed by name. Start nodes receive the graph input.
    fn node_args(
        &self,
        name: &str,
        input: &Value,
        outputs: &HashMap<String, Value>,
        skipped: &HashSet<String>,
    ) -> Option<Value> {
        let incoming: Vec<&Edge> = self.incoming(name).collect();
        if incoming.is_empty() {
            return Some(input.clone());
        }

        let mut produced = Map::new();
        for edge in &incoming {
            if skipped.contains(&edge.from) {
                return None;
            }
            let output = outputs.get(&edge.from)?;
            if let Some(condition) = &edge.condition {
                if !condition(output) {
                    return None;
                }
            }
            produced.insert(edge.from.clone(), output.clone());
        }

        if produced.len() == 1 {
            Some(produced.into_iter().next().map(|(_, v)| v).unwrap_or(Value::Null))
        } else {
            Some(Value::Object(produced))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{BufferSink, ExecutionContext};
    use crate::error::ErrorKind;
    use crate::task::task_fn;
    use crate::workflow::RuntimeServices;
    use serde_json::json;
    use uuid::Uuid;

    fn passthrough() -> TaskFn {
        task_fn(|input| async move { Ok(input.args) })
    }

    fn test_ctx() -> WorkflowContext {
        let execution = Arc::new(ExecutionContext::new(
            Uuid::now_v7(),
            "wf",
            Arc::new(BufferSink::new()),
        ));
        WorkflowContext::new(
            execution,
            Arc::new(RuntimeServices::new()),
            Default::default(),
        )
    }

    #[test]
    fn test_rejects_cycles() {
        let error = Graph::builder("g")
            .node("a", passthrough())
            .node("b", passthrough())
            .edge("a", "b")
            .edge("b", "a")
            .build()
            .unwrap_err();
        assert_eq!(error.kind, ErrorKind::Validation);
        assert!(error.message.contains("cycle"));
    }

    #[test]
    fn test_rejects_unknown_nodes() {
        let error = Graph::builder("g")
            .node("a", passthrough())
            .edge("a", "ghost")
            .build()
            .unwrap_err();
        assert!(error.message.contains("ghost"));
    }

    #[tokio::test]
    async fn test_linear_flow() {
        let graph = Graph::builder("g")
            .node(
                "double",
                task_fn(|i| async move { Ok(json!(i.args.as_i64().unwrap_or(0) * 2)) }),
            )
            .node(
                "inc",
                task_fn(|i| async move { Ok(json!(i.args.as_i64().unwrap_or(0) + 1)) }),
            )
            .edge("double", "inc")
            .build()
            .unwrap();

        let outputs = graph.run(&test_ctx(), json!(5)).await.unwrap();
        assert_eq!(outputs.get("inc"), Some(&json!(11)));
    }

    #[tokio::test]
    async fn test_conditional_edge_skips_branch() {
        let graph = Graph::builder("g")
            .node("check", passthrough())
            .node("then", task_fn(|_| async { Ok(json!("ran then")) }))
            .node("else", task_fn(|_| async { Ok(json!("ran else")) }))
            .edge_when("check", "then", |v| v.as_i64().unwrap_or(0) > 0)
            .edge_when("check", "else", |v| v.as_i64().unwrap_or(0) <= 0)
            .build()
            .unwrap();

        let outputs = graph.run(&test_ctx(), json!(7)).await.unwrap();
        assert_eq!(outputs.get("then"), Some(&json!("ran then")));
        assert_eq!(outputs.get("else"), None);
    }

    #[tokio::test]
    async fn test_join_node_receives_named_outputs() {
        let graph = Graph::builder("g")
            .node("left", task_fn(|_| async { Ok(json!(1)) }))
            .node("right", task_fn(|_| async { Ok(json!(2)) }))
            .node(
                "sum",
                task_fn(|i| async move {
                    let l = i.args["left"].as_i64().unwrap_or(0);
                    let r = i.args["right"].as_i64().unwrap_or(0);
                    Ok(json!(l + r))
                }),
            )
            .edge("left", "sum")
            .edge("right", "sum")
            .build()
            .unwrap();

        let outputs = graph.run(&test_ctx(), json!(null)).await.unwrap();
        assert_eq!(outputs.get("sum"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_node_failure_propagates() {
        let graph = Graph::builder("g")
            .node("boom", task_fn(|_| async { Err(FluxError::user("nope")) }))
            .node("after", passthrough())
            .edge("boom", "after")
            .build()
            .unwrap();

        let error = graph.run(&test_ctx(), json!(null)).await.unwrap_err();
        assert_eq!(error.kind, ErrorKind::UserTaskFailure);
    }
}
