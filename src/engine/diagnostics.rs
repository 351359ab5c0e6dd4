use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::stamp::OutputStamper;
use crate::store::Store;
use crate::task::TaskKey;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What a session did with each task it touched.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    /// Tasks whose body ran, with timings.
    pub execution_times: HashMap<TaskKey, TaskExecution>,
    /// Tasks whose stored data was checked and reused.
    pub up_to_date: HashSet<TaskKey>,
    /// Requires answered from the session's visited results.
    pub reused: usize,
}

enum Node {
    Task(TaskKey),
    Resource(String),
}

impl Diagnostics {
    pub fn executed(&self) -> usize {
        self.execution_times.len()
    }

    pub fn was_executed(&self, key: &TaskKey) -> bool {
        self.execution_times.contains_key(key)
    }

    pub(crate) fn record_execution(&mut self, key: &TaskKey, start: Instant, duration: Duration) {
        self.execution_times
            .insert(key.clone(), TaskExecution { start, duration });
    }

    /// Renders the stored dependency graph as a Mermaid diagram, tasks
    /// color-coded by execution duration in this session.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Cached (not executed)
    ///
    /// Resources are drawn as rounded nodes; an arrow into a task is a read, an
    /// arrow out of a task is a write.
    pub fn render_mermaid(&self, store: &Store) -> String {
        let mut graph: Graph<Node, String> = Graph::new();
        let mut tasks: HashMap<TaskKey, NodeIndex> = HashMap::new();
        let mut resources: HashMap<String, NodeIndex> = HashMap::new();

        let keys = store.keys();
        for key in &keys {
            tasks.insert(key.clone(), graph.add_node(Node::Task(key.clone())));
        }

        for key in &keys {
            let Some(data) = store.data(key) else {
                continue;
            };
            let caller = tasks[key];

            for dep in &data.task_requires {
                let callee = *tasks
                    .entry(dep.callee.clone())
                    .or_insert_with(|| graph.add_node(Node::Task(dep.callee.clone())));
                let label = match &dep.stamp.stamper {
                    OutputStamper::Equals => String::from("equals"),
                    OutputStamper::Inconsequential => String::from("inconsequential"),
                    OutputStamper::Projection(id) => id.to_string(),
                };
                graph.add_edge(callee, caller, label);
            }

            for dep in &data.resource_requires {
                let resource = *resources
                    .entry(dep.key.to_string())
                    .or_insert_with(|| graph.add_node(Node::Resource(dep.key.to_string())));
                graph.add_edge(resource, caller, String::from("read"));
            }

            for dep in &data.resource_provides {
                let resource = *resources
                    .entry(dep.key.to_string())
                    .or_insert_with(|| graph.add_node(Node::Resource(dep.key.to_string())));
                graph.add_edge(caller, resource, String::from("write"));
            }
        }

        let (min_time, max_time) = self.time_range();

        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        for index in graph.node_indices() {
            match &graph[index] {
                Node::Task(key) => {
                    let name = key.to_string().replace('"', "\\\"");

                    let (label_extra, color_code) = match self.execution_times.get(key) {
                        Some(exec) => {
                            let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);
                            (format!("{:.2?}", exec.duration), heat(t))
                        }
                        None => ("Cached".to_string(), "#ADD8E6".to_string()), // Light Blue
                    };

                    let _ = writeln!(f, "    {:?}[\"{}\\n{}\"]", index.index(), name, label_extra);
                    let _ = writeln!(f, "    style {:?} fill:{}", index.index(), color_code);
                }
                Node::Resource(key) => {
                    let name = key.replace('"', "\\\"");
                    let _ = writeln!(f, "    {:?}([\"{}\"])", index.index(), name);
                }
            }
        }

        for edge in graph.edge_indices() {
            let Some((source, target)) = graph.edge_endpoints(edge) else {
                continue;
            };
            let _ = writeln!(
                f,
                "    {:?} -- \"{}\" --> {:?}",
                source.index(),
                graph[edge],
                target.index()
            );
        }

        f
    }

    fn time_range(&self) -> (f64, f64) {
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in self.execution_times.values() {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            // No tasks ran
            min_time = 0.0;
            max_time = 0.0;
        }

        // Avoid divide by zero if all tasks took same time
        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        (min_time, max_time)
    }
}

/// Green at 0.0, yellow at 0.5, red at 1.0.
fn heat(t: f64) -> String {
    let (r, g, b) = if t < 0.5 {
        let r = (255.0 * t * 2.0) as u8;
        (r, 255, 0)
    } else {
        let g = (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8;
        (255, g, 0)
    };

    format!("#{:02X}{:02X}{:02X}", r, g, b)
}
