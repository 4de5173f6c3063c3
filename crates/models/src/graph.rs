// Copyright (c) 2024 Spider Project Authors
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};

use dal::ID;
use serde::{Deserialize, Serialize};

use crate::task::{Task, TaskInput, TaskOutput};

/// Construction-time failures. Returned, never panicked.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("task {0} is already present in the graph")]
    DuplicateTaskId(ID),

    #[error("task {0} is not present in the graph")]
    UnknownSource(ID),

    #[error("output slot {index} of task {task} does not exist")]
    SlotOutOfRange { task: ID, index: usize },

    #[error("edge from {src}[{src_slot}] ({src_type}) to {dst}[{dst_slot}] ({dst_type}) mismatches types")]
    TypeMismatch {
        src: ID,
        src_slot: usize,
        src_type: String,
        dst: ID,
        dst_slot: usize,
        dst_type: String,
    },

    #[error("edge from {src} to {dst} would introduce a cycle")]
    CycleDetected { src: ID, dst: ID },

    #[error("task {0} has incoming edges and cannot be an input task")]
    NotInputEligible(ID),

    #[error("task {0} has outgoing edges and cannot be an output task")]
    NotOutputEligible(ID),
}

/// A directed acyclic graph of tasks under construction on the client side.
///
/// Edges are implicit in `TaskInput::OutputRef` bindings. Every mutating
/// operation re-establishes the invariants: unique task ids, edges only to
/// present tasks with in-range slots, matching type tags, and acyclicity.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TaskGraph {
    tasks: HashMap<ID, Task>,

    /// Insertion order, used for deterministic iteration.
    order: Vec<ID>,

    input_tasks: Vec<ID>,
    output_tasks: Vec<ID>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_task(&mut self, task: Task) -> Result<(), GraphError> {
        if self.tasks.contains_key(&task.id) {
            return Err(GraphError::DuplicateTaskId(task.id));
        }

        // Any edges the task arrives with must already satisfy the graph
        // invariants.
        for input in &task.inputs {
            if let TaskInput::OutputRef { task: src, index, type_tag } = input {
                let src_task = self
                    .tasks
                    .get(src)
                    .ok_or(GraphError::UnknownSource(*src))?;
                let output = src_task.outputs.get(*index).ok_or(
                    GraphError::SlotOutOfRange {
                        task: *src,
                        index: *index,
                    },
                )?;
                if output.type_tag() != type_tag {
                    return Err(GraphError::TypeMismatch {
                        src: *src,
                        src_slot: *index,
                        src_type: output.type_tag().to_owned(),
                        dst: task.id,
                        dst_slot: 0,
                        dst_type: type_tag.clone(),
                    });
                }
            }
        }

        self.order.push(task.id);
        self.tasks.insert(task.id, task);
        Ok(())
    }

    pub fn add_task_input(&mut self, task_id: ID, input: TaskInput) -> Result<(), GraphError> {
        if let TaskInput::OutputRef { task: src, .. } = &input {
            if !self.tasks.contains_key(src) {
                return Err(GraphError::UnknownSource(*src));
            }
        }
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(GraphError::UnknownSource(task_id))?;
        task.add_input(input);
        Ok(())
    }

    pub fn add_task_output(&mut self, task_id: ID, output: TaskOutput) -> Result<(), GraphError> {
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(GraphError::UnknownSource(task_id))?;
        task.add_output(output);
        Ok(())
    }

    /// Wires output slot `src_slot` of `src` into input slot `dst_slot` of
    /// `dst`. The destination slot must already be declared (its tag is what
    /// gets checked) and the edge must not close a cycle.
    pub fn bind_task_output_to_task_input(
        &mut self,
        src: ID,
        src_slot: usize,
        dst: ID,
        dst_slot: usize,
    ) -> Result<(), GraphError> {
        let src_task = self.tasks.get(&src).ok_or(GraphError::UnknownSource(src))?;
        let src_type = src_task
            .outputs
            .get(src_slot)
            .ok_or(GraphError::SlotOutOfRange {
                task: src,
                index: src_slot,
            })?
            .type_tag()
            .to_owned();

        let dst_task = self.tasks.get(&dst).ok_or(GraphError::UnknownSource(dst))?;
        let dst_type = dst_task
            .inputs
            .get(dst_slot)
            .ok_or(GraphError::SlotOutOfRange {
                task: dst,
                index: dst_slot,
            })?
            .type_tag()
            .to_owned();

        if src_type != dst_type {
            return Err(GraphError::TypeMismatch {
                src,
                src_slot,
                src_type,
                dst,
                dst_slot,
                dst_type,
            });
        }

        // The new edge src -> dst closes a cycle iff src is reachable from
        // dst over the currently-present edges.
        if src == dst || self.reaches(dst, src) {
            return Err(GraphError::CycleDetected { src, dst });
        }

        let dst_task = self.tasks.get_mut(&dst).expect("checked above");
        dst_task.inputs[dst_slot] = TaskInput::OutputRef {
            task: src,
            index: src_slot,
            type_tag: dst_type,
        };

        Ok(())
    }

    /// Only tasks with no incoming task-output edges may be input tasks.
    pub fn mark_input_task(&mut self, task_id: ID) -> Result<(), GraphError> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(GraphError::UnknownSource(task_id))?;

        let has_edge_input = task
            .inputs
            .iter()
            .any(|i| matches!(i, TaskInput::OutputRef { .. }));
        if has_edge_input {
            return Err(GraphError::NotInputEligible(task_id));
        }

        if !self.input_tasks.contains(&task_id) {
            self.input_tasks.push(task_id);
        }
        Ok(())
    }

    /// Only tasks with no outgoing task-output edges may be output tasks.
    pub fn mark_output_task(&mut self, task_id: ID) -> Result<(), GraphError> {
        if !self.tasks.contains_key(&task_id) {
            return Err(GraphError::UnknownSource(task_id));
        }

        let has_downstream = self.tasks.values().any(|t| {
            t.inputs
                .iter()
                .any(|i| matches!(i, TaskInput::OutputRef { task, .. } if *task == task_id))
        });
        if has_downstream {
            return Err(GraphError::NotOutputEligible(task_id));
        }

        if !self.output_tasks.contains(&task_id) {
            self.output_tasks.push(task_id);
        }
        Ok(())
    }

    pub fn get_task(&self, id: ID) -> Option<&Task> {
        self.tasks.get(&id)
    }

    /// Tasks in insertion order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn input_tasks(&self) -> &[ID] {
        &self.input_tasks
    }

    pub fn output_tasks(&self) -> &[ID] {
        &self.output_tasks
    }

    /// All (src, src_slot, dst, dst_slot) edges present in the graph.
    pub fn edges(&self) -> Vec<(ID, usize, ID, usize)> {
        let mut edges = Vec::new();
        for id in &self.order {
            let task = &self.tasks[id];
            for (dst_slot, input) in task.inputs.iter().enumerate() {
                if let TaskInput::OutputRef { task: src, index, .. } = input {
                    edges.push((*src, *index, *id, dst_slot));
                }
            }
        }
        edges
    }

    /// Depth-first reachability over present edges: is `to` reachable from
    /// `from` by walking downstream?
    fn reaches(&self, from: ID, to: ID) -> bool {
        let mut downstream: HashMap<ID, Vec<ID>> = HashMap::new();
        for (src, _, dst, _) in self.edges() {
            downstream.entry(src).or_default().push(dst);
        }

        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(at) = stack.pop() {
            if at == to {
                return true;
            }
            if !seen.insert(at) {
                continue;
            }
            if let Some(next) = downstream.get(&at) {
                stack.extend(next.iter().copied());
            }
        }
        false
    }

    /// Full-graph validation: every invariant the incremental operations
    /// maintain, re-checked from scratch. Storage runs this before accepting
    /// a job.
    pub fn validate(&self) -> Result<(), GraphError> {
        for task in self.tasks.values() {
            for input in &task.inputs {
                if let TaskInput::OutputRef { task: src, index, type_tag } = input {
                    let src_task = self
                        .tasks
                        .get(src)
                        .ok_or(GraphError::UnknownSource(*src))?;
                    let output =
                        src_task
                            .outputs
                            .get(*index)
                            .ok_or(GraphError::SlotOutOfRange {
                                task: *src,
                                index: *index,
                            })?;
                    if output.type_tag() != type_tag {
                        return Err(GraphError::TypeMismatch {
                            src: *src,
                            src_slot: *index,
                            src_type: output.type_tag().to_owned(),
                            dst: task.id,
                            dst_slot: 0,
                            dst_type: type_tag.clone(),
                        });
                    }
                }
            }
        }

        // DFS three-color pass over the whole edge set.
        let mut downstream: HashMap<ID, Vec<ID>> = HashMap::new();
        for (src, _, dst, _) in self.edges() {
            downstream.entry(src).or_default().push(dst);
        }

        let mut done: HashSet<ID> = HashSet::new();
        for &start in self.tasks.keys() {
            if done.contains(&start) {
                continue;
            }
            let mut on_path: HashSet<ID> = HashSet::new();
            let mut stack: Vec<(ID, usize)> = vec![(start, 0)];
            on_path.insert(start);

            while let Some((at, next_child)) = stack.pop() {
                let children = downstream.get(&at).map(|v| v.as_slice()).unwrap_or(&[]);
                if next_child < children.len() {
                    stack.push((at, next_child + 1));
                    let child = children[next_child];
                    if on_path.contains(&child) {
                        return Err(GraphError::CycleDetected { src: at, dst: child });
                    }
                    if !done.contains(&child) {
                        on_path.insert(child);
                        stack.push((child, 0));
                    }
                } else {
                    on_path.remove(&at);
                    done.insert(at);
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TaskOutput;

    fn int_task(name: &str, arity: usize) -> Task {
        let mut t = Task::new(name);
        for _ in 0..arity {
            t.add_input(TaskInput::literal(&0i64).unwrap());
        }
        t.add_output(TaskOutput::declared::<i64>());
        t
    }

    #[test]
    fn duplicate_task_id_is_rejected() {
        let mut graph = TaskGraph::new();
        let task = int_task("sum", 2);
        let id = task.id;
        graph.add_task(task.clone()).unwrap();
        assert_eq!(graph.add_task(task), Err(GraphError::DuplicateTaskId(id)));
    }

    #[test]
    fn bind_requires_known_source() {
        let mut graph = TaskGraph::new();
        let task = int_task("sum", 2);
        let id = task.id;
        graph.add_task(task).unwrap();

        let ghost = ID::new();
        assert_eq!(
            graph.bind_task_output_to_task_input(ghost, 0, id, 0),
            Err(GraphError::UnknownSource(ghost))
        );
    }

    #[test]
    fn bind_checks_slot_bounds() {
        let mut graph = TaskGraph::new();
        let a = int_task("square", 1);
        let b = int_task("sqrt", 1);
        let (a_id, b_id) = (a.id, b.id);
        graph.add_task(a).unwrap();
        graph.add_task(b).unwrap();

        assert_eq!(
            graph.bind_task_output_to_task_input(a_id, 7, b_id, 0),
            Err(GraphError::SlotOutOfRange { task: a_id, index: 7 })
        );
    }

    #[test]
    fn bind_checks_types() {
        let mut graph = TaskGraph::new();
        let a = int_task("square", 1);
        let mut b = Task::new("concat");
        b.add_input(TaskInput::literal(&"x".to_owned()).unwrap());
        b.add_output(TaskOutput::declared::<String>());
        let (a_id, b_id) = (a.id, b.id);
        graph.add_task(a).unwrap();
        graph.add_task(b).unwrap();

        assert!(matches!(
            graph.bind_task_output_to_task_input(a_id, 0, b_id, 0),
            Err(GraphError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let mut graph = TaskGraph::new();
        let a = int_task("a", 1);
        let b = int_task("b", 1);
        let c = int_task("c", 1);
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        graph.add_task(a).unwrap();
        graph.add_task(b).unwrap();
        graph.add_task(c).unwrap();

        graph.bind_task_output_to_task_input(a_id, 0, b_id, 0).unwrap();
        graph.bind_task_output_to_task_input(b_id, 0, c_id, 0).unwrap();

        assert_eq!(
            graph.bind_task_output_to_task_input(c_id, 0, a_id, 0),
            Err(GraphError::CycleDetected { src: c_id, dst: a_id })
        );

        // The graph is still valid after the failed bind.
        graph.validate().unwrap();
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let mut graph = TaskGraph::new();
        let a = int_task("a", 1);
        let a_id = a.id;
        graph.add_task(a).unwrap();

        assert_eq!(
            graph.bind_task_output_to_task_input(a_id, 0, a_id, 0),
            Err(GraphError::CycleDetected { src: a_id, dst: a_id })
        );
    }

    #[test]
    fn input_output_eligibility() {
        let mut graph = TaskGraph::new();
        let a = int_task("a", 1);
        let b = int_task("b", 1);
        let (a_id, b_id) = (a.id, b.id);
        graph.add_task(a).unwrap();
        graph.add_task(b).unwrap();
        graph.bind_task_output_to_task_input(a_id, 0, b_id, 0).unwrap();

        assert_eq!(
            graph.mark_input_task(b_id),
            Err(GraphError::NotInputEligible(b_id))
        );
        assert_eq!(
            graph.mark_output_task(a_id),
            Err(GraphError::NotOutputEligible(a_id))
        );

        graph.mark_input_task(a_id).unwrap();
        graph.mark_output_task(b_id).unwrap();
        assert_eq!(graph.input_tasks(), &[a_id]);
        assert_eq!(graph.output_tasks(), &[b_id]);
    }

    #[test]
    fn edges_enumerate_bindings() {
        let mut graph = TaskGraph::new();
        let a = int_task("a", 1);
        let b = int_task("b", 1);
        let (a_id, b_id) = (a.id, b.id);
        graph.add_task(a).unwrap();
        graph.add_task(b).unwrap();
        graph.bind_task_output_to_task_input(a_id, 0, b_id, 0).unwrap();

        assert_eq!(graph.edges(), vec![(a_id, 0, b_id, 0)]);
    }
}
