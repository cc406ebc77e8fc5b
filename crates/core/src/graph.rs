//! Job graph
//!
//! Builds the DAG of jobs keyed by their CRC-32 name identities, with edges
//! pointing from dependency to dependent. Traversal is either sequential
//! (topological order) or concurrent: one task per node, gated on the
//! `done` signal of every inbound dependency, with services joined after
//! the global stop fires.

use crate::errors::{HoneError, Result};
use crate::job::{node_id, Job};
use futures_util::future::BoxFuture;
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error};

/// Per-job work invoked by the traversal. Decorators (logging, caching,
/// condition, reporting) wrap an inner callback into a new one.
#[derive(Clone)]
pub struct JobCallback(Arc<dyn Fn(Arc<Job>) -> BoxFuture<'static, Result<()>> + Send + Sync>);

impl JobCallback {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(Arc<Job>) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self(Arc::new(callback))
    }

    pub async fn run(&self, job: Arc<Job>) -> Result<()> {
        (self.0.as_ref())(job).await
    }
}

pub struct JobGraph {
    graph: DiGraph<Arc<Job>, ()>,
    nodes: HashMap<u32, NodeIndex>,
}

impl JobGraph {
    /// Build the graph from parsed jobs. Every `deps` entry must name a
    /// declared job.
    pub fn new(jobs: &[Arc<Job>]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for job in jobs {
            let index = graph.add_node(job.clone());
            nodes.insert(job.id(), index);
        }

        let mut built = Self { graph, nodes };

        for job in jobs {
            for dep in &job.deps {
                built.add_dep(&job.name, dep)?;
            }
        }

        Ok(built)
    }

    /// Inject a dependency edge (dep -> dependent), used by the parser for
    /// references discovered after construction.
    pub fn add_dep(&mut self, name: &str, dep: &str) -> Result<()> {
        let node = self.index_of(name).ok_or_else(|| {
            HoneError::config(format!("Job {name} is not declared."))
        })?;
        let dep_node = self.index_of(dep).ok_or_else(|| {
            HoneError::config(format!("Job {name} depends on unknown job {dep}."))
        })?;
        self.graph.update_edge(dep_node, node, ());
        Ok(())
    }

    fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.nodes.get(&node_id(name)).copied()
    }

    fn sorted(&self) -> Result<Vec<NodeIndex>> {
        toposort(&self.graph, None).map_err(|cycle| {
            let name = &self.graph[cycle.node_id()].name;
            HoneError::graph(format!("Dependency cycle detected involving job {name}."))
        })
    }

    /// Topologically-ordered node indices with a path to `target`,
    /// including the target itself.
    fn sorted_for_target(&self, target: &str) -> Result<Vec<NodeIndex>> {
        let target_index = self
            .index_of(target)
            .ok_or_else(|| HoneError::graph(format!("Target {target} not found.")))?;

        Ok(self
            .sorted()?
            .into_iter()
            .filter(|&index| {
                index == target_index || has_path_connecting(&self.graph, index, target_index, None)
            })
            .collect())
    }

    /// Visit every job in topological order, collecting errors but never
    /// stopping early.
    pub fn iter_sorted<F>(&self, mut visit: F) -> Vec<HoneError>
    where
        F: FnMut(&Arc<Job>) -> Result<()>,
    {
        let sorted = match self.sorted() {
            Ok(sorted) => sorted,
            Err(err) => return vec![err],
        };

        let mut errors = Vec::new();
        for index in sorted {
            if let Err(err) = visit(&self.graph[index]) {
                errors.push(err);
            }
        }
        errors
    }

    /// Like `iter_sorted`, restricted to jobs with a path to `target`.
    pub fn iter_target<F>(&self, target: &str, mut visit: F) -> Vec<HoneError>
    where
        F: FnMut(&Arc<Job>) -> Result<()>,
    {
        let sorted = match self.sorted_for_target(target) {
            Ok(sorted) => sorted,
            Err(err) => return vec![err],
        };

        let mut errors = Vec::new();
        for index in sorted {
            if let Err(err) = visit(&self.graph[index]) {
                errors.push(err);
            }
        }
        errors
    }

    /// Longest job name over the target's subgraph; drives log alignment.
    pub fn longest_target(&self, target: &str) -> (usize, Vec<HoneError>) {
        let mut longest = 0;
        let errors = self.iter_target(target, |job| {
            longest = longest.max(job.name.len());
            Ok(())
        });
        (longest, errors)
    }

    /// Run the callback concurrently over every job with a path to
    /// `target`. Each node waits for all inbound dependencies' `done`
    /// signals; a failed dependency short-circuits the node with a
    /// synthesized error and its callback is never invoked. Services are
    /// signalled to stop and joined once all node tasks have finished.
    pub async fn resolve_target(&self, target: &str, callback: JobCallback) -> Vec<HoneError> {
        let sorted = match self.sorted_for_target(target) {
            Ok(sorted) => sorted,
            Err(err) => return vec![err],
        };

        let (stop_tx, _) = broadcast::channel::<()>(1);

        let mut done_txs: HashMap<NodeIndex, watch::Sender<bool>> = HashMap::new();
        let mut done_rxs: HashMap<NodeIndex, watch::Receiver<bool>> = HashMap::new();
        for &index in &sorted {
            let (tx, rx) = watch::channel(false);
            done_txs.insert(index, tx);
            done_rxs.insert(index, rx);
        }

        let mut tasks = Vec::with_capacity(sorted.len());
        for &index in &sorted {
            let job = self.graph[index].clone();
            job.set_stop_channel(stop_tx.clone());

            let deps: Vec<(Arc<Job>, watch::Receiver<bool>)> = self
                .graph
                .neighbors_directed(index, Direction::Incoming)
                .map(|dep| (self.graph[dep].clone(), done_rxs[&dep].clone()))
                .collect();

            let Some(done_tx) = done_txs.remove(&index) else {
                continue;
            };
            let callback = callback.clone();

            tasks.push(tokio::spawn(async move {
                let mut failed = Vec::new();
                for (dep, mut rx) in deps {
                    // A dropped sender still means the dependency task is gone;
                    // judge it by its recorded error either way.
                    let _ = rx.wait_for(|finished| *finished).await;
                    if dep.error().is_some() {
                        failed.push(dep.name.clone());
                    }
                }

                let result = if failed.is_empty() {
                    let outcome = callback.run(job.clone()).await;
                    if let Err(err) = &outcome {
                        job.set_error(err.to_string());
                    }
                    outcome
                } else {
                    failed.sort();
                    let err = HoneError::DependencyFailure { failed };
                    job.set_error(err.to_string());
                    error!(job = %job.name, "{err}");
                    Err(err)
                };

                let _ = done_tx.send(true);
                result
            }));
        }

        let mut errors = Vec::new();
        for task in tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => errors.push(err),
                Err(join_err) => errors.push(HoneError::executor(format!(
                    "job task panicked: {join_err}"
                ))),
            }
        }

        // All non-service work has joined; signal services to shut down and
        // wait for their background branches.
        debug!("Stopping services.");
        let _ = stop_tx.send(());
        for &index in &sorted {
            if let Some(handle) = self.graph[index].take_detached() {
                if let Err(join_err) = handle.await {
                    errors.push(HoneError::executor(format!(
                        "service task panicked: {join_err}"
                    )));
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn job(name: &str, deps: &[&str]) -> Arc<Job> {
        let deps = deps
            .iter()
            .map(|d| format!("\"{d}\""))
            .collect::<Vec<_>>()
            .join(", ");
        Arc::new(
            json5::from_str(&format!(
                r#"{{ name: "{name}", image: "alpine", shell: "true", deps: [{deps}] }}"#
            ))
            .unwrap(),
        )
    }

    fn recording_callback() -> (JobCallback, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        let callback = JobCallback::new(move |job: Arc<Job>| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.lock().unwrap().push(job.name.clone());
                Ok(())
            })
        });
        (callback, seen)
    }

    #[test]
    fn test_iter_sorted_respects_dependencies() {
        let jobs = vec![job("deploy", &["build"]), job("build", &["test"]), job("test", &[])];
        let graph = JobGraph::new(&jobs).unwrap();

        let mut order = Vec::new();
        let errors = graph.iter_sorted(|j| {
            order.push(j.name.clone());
            Ok(())
        });
        assert!(errors.is_empty());

        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("test") < pos("build"));
        assert!(pos("build") < pos("deploy"));
    }

    #[test]
    fn test_iter_target_filters_unrelated_jobs() {
        let jobs = vec![job("a", &[]), job("b", &["a"]), job("c", &[])];
        let graph = JobGraph::new(&jobs).unwrap();

        let mut visited = Vec::new();
        let errors = graph.iter_target("b", |j| {
            visited.push(j.name.clone());
            Ok(())
        });
        assert!(errors.is_empty());
        visited.sort();
        assert_eq!(visited, vec!["a", "b"]);
    }

    #[test]
    fn test_missing_target() {
        let graph = JobGraph::new(&[job("a", &[])]).unwrap();
        let errors = graph.iter_target("nope", |_| Ok(()));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].to_string(), "Target nope not found.");
    }

    #[test]
    fn test_unknown_dep_is_config_error() {
        assert!(JobGraph::new(&[job("a", &["ghost"])]).is_err());
    }

    #[test]
    fn test_cycle_is_fatal() {
        let jobs = vec![job("a", &["b"]), job("b", &["a"])];
        let graph = JobGraph::new(&jobs).unwrap();
        let errors = graph.iter_sorted(|_| Ok(()));
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("cycle"));
    }

    #[test]
    fn test_longest_target() {
        let jobs = vec![job("compile", &[]), job("go", &["compile"]), job("x", &[])];
        let graph = JobGraph::new(&jobs).unwrap();
        let (longest, errors) = graph.longest_target("go");
        assert!(errors.is_empty());
        assert_eq!(longest, "compile".len());
    }

    #[tokio::test]
    async fn test_resolve_target_runs_ancestors_only() {
        let jobs = vec![job("a", &[]), job("b", &["a"]), job("c", &[])];
        let graph = JobGraph::new(&jobs).unwrap();
        let (callback, seen) = recording_callback();

        let errors = graph.resolve_target("b", callback).await;
        assert!(errors.is_empty());

        let mut visited = seen.lock().unwrap().clone();
        visited.sort();
        assert_eq!(visited, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_resolve_target_diamond_ordering() {
        let jobs = vec![
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ];
        let graph = JobGraph::new(&jobs).unwrap();
        let (callback, seen) = recording_callback();

        let errors = graph.resolve_target("d", callback).await;
        assert!(errors.is_empty());

        let order = seen.lock().unwrap().clone();
        assert_eq!(order.len(), 4);
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert_eq!(pos("a"), 0);
        assert_eq!(pos("d"), 3);
    }

    #[tokio::test]
    async fn test_dependency_failure_propagates_without_invoking_callbacks() {
        let jobs = vec![
            job("a", &[]),
            job("b", &["a"]),
            job("c", &["a"]),
            job("d", &["b", "c"]),
        ];
        let graph = JobGraph::new(&jobs).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        let callback = JobCallback::new(move |job: Arc<Job>| {
            let inner = inner.clone();
            Box::pin(async move {
                inner.lock().unwrap().push(job.name.clone());
                if job.name == "a" {
                    Err(HoneError::executor("exit status 1"))
                } else {
                    Ok(())
                }
            })
        });

        let errors = graph.resolve_target("d", callback).await;
        assert_eq!(errors.len(), 4);

        // Only the root's callback ran; descendants were short-circuited.
        assert_eq!(seen.lock().unwrap().clone(), vec!["a"]);

        for job in &jobs[1..] {
            let err = job.error().unwrap();
            assert!(err.contains("Failed dependencies"), "{err}");
            assert!(err.contains('a'), "{err}");
        }
    }

    #[tokio::test]
    async fn test_ready_siblings_run_concurrently() {
        let jobs = vec![job("a", &[]), job("b", &["a"]), job("c", &["a"]), job("d", &["b", "c"])];
        let graph = JobGraph::new(&jobs).unwrap();

        // b parks until c has started, which only works if both run at once.
        let (tx, rx) = tokio::sync::watch::channel(false);
        let tx = Arc::new(tx);
        let callback = {
            let tx = tx.clone();
            JobCallback::new(move |job: Arc<Job>| {
                let tx = tx.clone();
                let mut rx = rx.clone();
                Box::pin(async move {
                    match job.name.as_str() {
                        "b" => {
                            tokio::time::timeout(
                                Duration::from_secs(5),
                                rx.wait_for(|started| *started),
                            )
                            .await
                            .map_err(|_| HoneError::executor("peer never started"))?
                            .map_err(|e| HoneError::executor(e.to_string()))?;
                        }
                        "c" => {
                            let _ = tx.send(true);
                        }
                        _ => {}
                    }
                    Ok(())
                })
            })
        };

        let errors = graph.resolve_target("d", callback).await;
        assert!(errors.is_empty(), "{errors:?}");
    }
}
