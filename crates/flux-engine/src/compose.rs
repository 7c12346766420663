//! `pipeline` and the node graph it's built from (spec.md §4.5.4): a
//! DAG of named nodes, each running a task, connected by
//! predicate-guarded edges. Cycles and edges to unknown nodes are
//! rejected at construction, not at run time — a programmer error
//! caught as early as possible, matching the rest of the engine's
//! construction-time validation (e.g. `TaskDef::jitter`'s clamp).

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use flux_storage::repository::Repository;
use serde_json::Value;

use crate::error::{GraphError, TaskError};
use crate::runtime::WorkflowContext;
use crate::task::TaskDef;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// `pipeline(f1, f2, …, fn, input)` (spec.md §4.5.4): `fn(…f2(f1(input))…)`,
/// each step invoked through [`WorkflowContext::invoke`] so it gets its
/// own `source_id`, retry/timeout/fallback/cache, exactly like any
/// other task call — a pipeline is sugar over sequential `invoke`s, not
/// a distinct execution primitive.
pub async fn pipeline<R: Repository>(
    ctx: &WorkflowContext<R>,
    stages: &[TaskDef<Value, Value>],
    input: Value,
) -> Result<Value, TaskError> {
    let mut value = input;
    for stage in stages {
        value = ctx.invoke(stage, value).await?;
    }
    Ok(value)
}

/// A single node's body: takes the upstream value (the graph's entry
/// input for a node with no predecessors, or the concatenation of its
/// predecessors' outputs otherwise) and produces this node's output.
/// Values travel as `serde_json::Value` so a graph can mix nodes of
/// different `In`/`Out` types, the way spec.md §4.5.4 describes nodes
/// as heterogeneous task wrappers.
pub type NodeFn<R> = Arc<
    dyn Fn(&WorkflowContext<R>, Value) -> BoxFuture<'static, Result<Value, GraphError>> + Send + Sync,
>;

/// A directed edge, optionally guarded by a predicate over the
/// upstream node's output — the edge is only traversed if the
/// predicate (when present) returns `true`.
pub struct Edge {
    to: String,
    guard: Option<Arc<dyn Fn(&Value) -> bool + Send + Sync>>,
}

struct Node<R: Repository> {
    run: NodeFn<R>,
    edges: Vec<Edge>,
}

/// A DAG of named nodes (spec.md §4.5.4). Build with [`Graph::new`] and
/// [`Graph::node`]/[`Graph::edge`], then [`Graph::run`] it from one or
/// more entry points.
pub struct Graph<R: Repository> {
    nodes: HashMap<String, Node<R>>,
    entries: Vec<String>,
}

impl<R: Repository> Graph<R> {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            entries: Vec::new(),
        }
    }

    /// Register a node. The first node registered with no incoming
    /// edges, determined at `run` time, is where unguarded traversal
    /// begins; call [`Graph::entry`] to be explicit.
    pub fn node(mut self, name: impl Into<String>, run: NodeFn<R>) -> Self {
        self.nodes.insert(name.into(), Node { run, edges: Vec::new() });
        self
    }

    /// Mark `name` as an entry point: the graph starts traversal here
    /// with the caller-supplied input value.
    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.entries.push(name.into());
        self
    }

    /// Add an unconditional edge `from -> to`.
    pub fn edge(mut self, from: impl AsRef<str>, to: impl Into<String>) -> Self {
        let edge = Edge { to: to.into(), guard: None };
        self.push_edge(from.as_ref(), edge);
        self
    }

    /// Add a guarded edge `from -> to`, traversed only when `guard`
    /// returns `true` for `from`'s output.
    pub fn guarded_edge(
        mut self,
        from: impl AsRef<str>,
        to: impl Into<String>,
        guard: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        let edge = Edge {
            to: to.into(),
            guard: Some(Arc::new(guard)),
        };
        self.push_edge(from.as_ref(), edge);
        self
    }

    fn push_edge(&mut self, from: &str, edge: Edge) {
        self.nodes
            .entry(from.to_string())
            .or_insert_with(|| Node {
                run: Arc::new(|_ctx, v| Box::pin(async move { Ok(v) })),
                edges: Vec::new(),
            })
            .edges
            .push(edge);
    }

    /// Validate the graph is acyclic and every edge target and entry
    /// point names a registered node, then run it to completion: each
    /// reached node's output becomes the input fed to every guarded
    /// edge whose guard passes (or every unguarded edge). Terminal
    /// nodes (no traversed outgoing edge) contribute their output to
    /// the returned map.
    pub async fn run(&self, ctx: &WorkflowContext<R>, input: Value) -> Result<HashMap<String, Value>, GraphError> {
        self.validate()?;

        let mut outputs = HashMap::new();
        let mut queue: VecDeque<(String, Value)> =
            self.entries.iter().map(|e| (e.clone(), input.clone())).collect();
        let mut visited = HashSet::new();

        while let Some((name, value)) = queue.pop_front() {
            if !visited.insert(name.clone()) {
                continue;
            }
            let node = self.nodes.get(&name).ok_or_else(|| GraphError::UnknownNode(name.clone()))?;
            let output = (node.run)(ctx, value).await?;

            if node.edges.is_empty() {
                outputs.insert(name.clone(), output.clone());
            }
            for edge in &node.edges {
                let passes = edge.guard.as_ref().map(|g| g(&output)).unwrap_or(true);
                if passes {
                    queue.push_back((edge.to.clone(), output.clone()));
                }
            }
        }

        Ok(outputs)
    }

    fn validate(&self) -> Result<(), GraphError> {
        for entry in &self.entries {
            if !self.nodes.contains_key(entry) {
                return Err(GraphError::UnknownNode(entry.clone()));
            }
        }
        for node in self.nodes.values() {
            for edge in &node.edges {
                if !self.nodes.contains_key(&edge.to) {
                    return Err(GraphError::UnknownNode(edge.to.clone()));
                }
            }
        }
        self.check_acyclic()
    }

    fn check_acyclic(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }
        let mut marks: HashMap<&str, Mark> = HashMap::new();

        fn visit<'a, R: Repository>(
            name: &'a str,
            nodes: &'a HashMap<String, Node<R>>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> Result<(), GraphError> {
            match marks.get(name) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(GraphError::Cycle),
                None => {}
            }
            marks.insert(name, Mark::Visiting);
            if let Some(node) = nodes.get(name) {
                for edge in &node.edges {
                    visit(&edge.to, nodes, marks)?;
                }
            }
            marks.insert(name, Mark::Done);
            Ok(())
        }

        for name in self.nodes.keys() {
            visit(name, &self.nodes, &mut marks)?;
        }
        Ok(())
    }
}

impl<R: Repository> Default for Graph<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_core::ids::{ExecutionId, ScopeCounter};
    use flux_storage::memory::InMemoryRepository;
    use serde_json::json;
    use std::sync::Arc as StdArc;

    fn test_ctx() -> WorkflowContext<InMemoryRepository> {
        let repo = StdArc::new(InMemoryRepository::new());
        let execution_id = ExecutionId::new();
        let checkpoint: crate::context::CheckpointFn = StdArc::new(|_event| Box::pin(async { Ok(()) }));
        let exec = StdArc::new(tokio::sync::Mutex::new(crate::context::ExecutionContext::new(
            execution_id,
            json!(null),
            checkpoint,
        )));
        WorkflowContext::new(execution_id, exec, repo, None, StdArc::new(ScopeCounter::new("graph-test")))
    }

    fn passthrough_doubling() -> NodeFn<InMemoryRepository> {
        Arc::new(|_ctx, v| {
            Box::pin(async move {
                let n = v.as_i64().unwrap_or(0);
                Ok(json!(n * 2))
            })
        })
    }

    #[tokio::test]
    async fn rejects_cycles_at_construction() {
        let graph: Graph<InMemoryRepository> = Graph::new()
            .node("a", passthrough_doubling())
            .node("b", passthrough_doubling())
            .entry("a")
            .edge("a", "b")
            .edge("b", "a");

        let ctx = test_ctx();
        let err = graph.run(&ctx, json!(1)).await.unwrap_err();
        assert!(matches!(err, GraphError::Cycle));
    }

    #[tokio::test]
    async fn guarded_edge_only_traverses_when_predicate_passes() {
        let graph: Graph<InMemoryRepository> = Graph::new()
            .node("start", passthrough_doubling())
            .node("even_only", passthrough_doubling())
            .entry("start")
            .guarded_edge("start", "even_only", |v| v.as_i64().unwrap_or(0) % 2 == 0);

        let ctx = test_ctx();
        let outputs = graph.run(&ctx, json!(3)).await.unwrap();
        assert_eq!(outputs.get("even_only"), Some(&json!(12)));
        assert!(outputs.get("start").is_none());
    }

    fn stage(name: &str, f: fn(i64) -> i64) -> TaskDef<Value, Value> {
        TaskDef::new(name.to_string(), move |call: crate::task::TaskCall<Value>| async move {
            let n = call.input.as_i64().unwrap_or(0);
            Ok(json!(f(n)))
        })
    }

    #[tokio::test]
    async fn pipeline_applies_stages_left_to_right() {
        let ctx = test_ctx();
        let stages = vec![stage("double", |n| n * 2), stage("add_one", |n| n + 1)];

        let out = pipeline(&ctx, &stages, json!(3)).await.unwrap();
        assert_eq!(out, json!(7));
    }
}
