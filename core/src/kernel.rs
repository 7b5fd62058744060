use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Duration;
use chrono::Utc;

use tx_protocol::ScoreBreakdown;
use tx_protocol::ScoredTask;
use tx_protocol::Task;
use tx_protocol::TaskError;
use tx_protocol::TaskId;
use tx_protocol::TaskStatus;
use tx_state::AddDependencyOutcome;
use tx_state::DeleteOutcome;
use tx_state::StateRuntime;
use tx_state::TaskCreateParams;
use tx_state::TaskPatch;

use crate::clock::Clock;

const BLOCKS_BONUS_PER_TASK: i64 = 25;
const AGE_BONUS_24H: i64 = 50;
const AGE_BONUS_48H: i64 = 100;
const DEPTH_PENALTY_PER_LEVEL: i64 = 10;
const BLOCKED_PENALTY: i64 = 1000;

/// Result of a status mutation; completion also carries the tasks it
/// unblocked.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub task: Task,
    pub newly_ready: Vec<Task>,
}

/// The task kernel: status machine, dependency graph, readiness, scoring.
#[derive(Clone)]
pub struct TaskKernel {
    state: Arc<StateRuntime>,
    clock: Clock,
}

impl TaskKernel {
    pub fn new(state: Arc<StateRuntime>, clock: Clock) -> Self {
        Self { state, clock }
    }

    pub async fn add(&self, params: TaskCreateParams) -> Result<Task, TaskError> {
        if params.title.trim().is_empty() {
            return Err(TaskError::Validation {
                message: "task title must not be empty".to_string(),
            });
        }
        if let Some(parent_id) = params.parent_id.as_ref() {
            self.get(parent_id).await?;
        }
        let task = self.state.create_task(&params, self.clock.now()).await?;
        Ok(task)
    }

    pub async fn get(&self, id: &TaskId) -> Result<Task, TaskError> {
        self.state
            .get_task(id)
            .await?
            .ok_or_else(|| TaskError::NotFound {
                id: id.to_string(),
            })
    }

    pub async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<Task>, TaskError> {
        Ok(self.state.list_tasks(status, limit).await?)
    }

    pub async fn update(&self, id: &TaskId, patch: TaskPatch) -> Result<Task, TaskError> {
        if let Some(Some(parent_id)) = patch.parent_id.as_ref() {
            if parent_id == id {
                return Err(TaskError::Validation {
                    message: "a task cannot be its own parent".to_string(),
                });
            }
            self.get(parent_id).await?;
        }
        let updated = self.state.update_task(id, &patch, self.clock.now()).await?;
        if !updated {
            // Either the row is gone or the optimistic check failed.
            let current = self.get(id).await?;
            if patch.expected_updated_at.is_some() {
                return Err(TaskError::Validation {
                    message: format!(
                        "task {id} changed at {}; reload before updating",
                        current.updated_at
                    ),
                });
            }
        }
        self.get(id).await
    }

    /// Status mutation through the transition oracle. `force` bypasses the
    /// graph for operator tools and recovery paths.
    pub async fn set_status(
        &self,
        id: &TaskId,
        to: TaskStatus,
        force: bool,
    ) -> Result<StatusChange, TaskError> {
        let task = self.get(id).await?;
        if !force && !task.status.can_transition_to(to) {
            return Err(TaskError::InvalidStatusTransition {
                from: task.status,
                to,
            });
        }
        if to == TaskStatus::Done {
            let outcome = self
                .state
                .complete_task(id, self.clock.now())
                .await?
                .ok_or_else(|| TaskError::NotFound {
                    id: id.to_string(),
                })?;
            return Ok(StatusChange {
                task: outcome.task,
                newly_ready: outcome.newly_ready,
            });
        }
        self.state.set_task_status(id, to, self.clock.now()).await?;
        Ok(StatusChange {
            task: self.get(id).await?,
            newly_ready: Vec::new(),
        })
    }

    pub async fn done(&self, id: &TaskId) -> Result<StatusChange, TaskError> {
        self.set_status(id, TaskStatus::Done, false).await
    }

    pub async fn delete(&self, id: &TaskId, cascade: bool) -> Result<u64, TaskError> {
        match self.state.delete_task(id, cascade).await? {
            DeleteOutcome::Deleted { rows } => Ok(rows),
            DeleteOutcome::NotFound => Err(TaskError::NotFound {
                id: id.to_string(),
            }),
            DeleteOutcome::HasChildren => Err(TaskError::HasChildren { id: id.clone() }),
        }
    }

    /// Adds `blocker` to the task's blocker set.
    pub async fn add_blocker(
        &self,
        task: &TaskId,
        blocker: &TaskId,
    ) -> Result<(), TaskError> {
        match self
            .state
            .add_dependency_checked(blocker, task, self.clock.now())
            .await?
        {
            AddDependencyOutcome::Added | AddDependencyOutcome::AlreadyExists => Ok(()),
            AddDependencyOutcome::SelfLoop => Err(TaskError::Validation {
                message: "a task cannot block itself".to_string(),
            }),
            AddDependencyOutcome::WouldCycle => Err(TaskError::CircularDependency {
                blocker: blocker.clone(),
                blocked: task.clone(),
            }),
            AddDependencyOutcome::MissingTask { id } => Err(TaskError::NotFound {
                id: id.to_string(),
            }),
        }
    }

    pub async fn remove_blocker(
        &self,
        task: &TaskId,
        blocker: &TaskId,
    ) -> Result<bool, TaskError> {
        Ok(self.state.remove_dependency(blocker, task).await?)
    }

    /// Ready-to-run computation. Exactly five bulk queries regardless of
    /// candidate count: (a) claimable unclaimed tasks, (b) their blockers,
    /// (c) the edges they block, (d) all parent links, (e) blocker statuses.
    /// Everything else is derived in memory, sorted by score, truncated.
    pub async fn get_ready(&self, limit: usize) -> Result<Vec<ScoredTask>, TaskError> {
        let now = self.clock.now();
        let candidates = self.state.claimable_unclaimed_tasks().await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let candidate_ids: Vec<TaskId> = candidates.iter().map(|t| t.id.clone()).collect();

        let blocker_edges = self.state.blockers_of_many(&candidate_ids).await?;
        let blocking_edges = self.state.blocking_of_many(&candidate_ids).await?;
        let parents = self.state.parent_pairs().await?;

        let mut blockers_by_task: HashMap<&TaskId, Vec<&TaskId>> = HashMap::new();
        for (blocker, blocked) in &blocker_edges {
            blockers_by_task.entry(blocked).or_default().push(blocker);
        }
        let mut blocks_count: HashMap<&TaskId, i64> = HashMap::new();
        for (blocker, _) in &blocking_edges {
            *blocks_count.entry(blocker).or_default() += 1;
        }
        let parent_of: HashMap<&TaskId, &TaskId> = parents
            .iter()
            .filter_map(|(id, parent)| parent.as_ref().map(|p| (id, p)))
            .collect();

        let blocker_ids: Vec<TaskId> = blocker_edges
            .iter()
            .map(|(blocker, _)| blocker.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let blocker_statuses: HashMap<TaskId, TaskStatus> = self
            .state
            .statuses_for(&blocker_ids)
            .await?
            .into_iter()
            .collect();

        let mut ready = Vec::new();
        for task in &candidates {
            let all_done = blockers_by_task
                .get(&task.id)
                .map(|blockers| {
                    blockers.iter().all(|blocker| {
                        blocker_statuses.get(*blocker) == Some(&TaskStatus::Done)
                    })
                })
                .unwrap_or(true);
            if !all_done {
                continue;
            }
            let blocks = blocks_count.get(&task.id).copied().unwrap_or(0);
            let depth = depth_of(&task.id, &parent_of);
            ready.push(ScoredTask {
                breakdown: score_breakdown(task, blocks, depth, now),
                task: task.clone(),
            });
        }
        ready.sort_by(|a, b| {
            b.breakdown
                .total
                .cmp(&a.breakdown.total)
                .then_with(|| a.task.id.cmp(&b.task.id))
        });
        ready.truncate(limit);
        Ok(ready)
    }

    /// Score a single task for display; shares the readiness arithmetic.
    pub async fn score(&self, id: &TaskId) -> Result<ScoreBreakdown, TaskError> {
        let task = self.get(id).await?;
        let blocking = self.state.blocking_of_many(&[id.clone()]).await?;
        let parents = self.state.parent_pairs().await?;
        let parent_of: HashMap<&TaskId, &TaskId> = parents
            .iter()
            .filter_map(|(id, parent)| parent.as_ref().map(|p| (id, p)))
            .collect();
        Ok(score_breakdown(
            &task,
            blocking.len() as i64,
            depth_of(id, &parent_of),
            self.clock.now(),
        ))
    }

    /// Depth-first tree of all tasks, roots first, with depth per row.
    pub async fn tree(&self) -> Result<Vec<(Task, usize)>, TaskError> {
        let tasks = self.state.all_tasks().await?;
        let mut children: HashMap<&TaskId, Vec<&Task>> = HashMap::new();
        let ids: HashSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        let mut roots: Vec<&Task> = Vec::new();
        for task in &tasks {
            match task.parent_id.as_ref() {
                Some(parent) if ids.contains(parent) => {
                    children.entry(parent).or_default().push(task);
                }
                _ => roots.push(task),
            }
        }
        let mut rows = Vec::new();
        let mut stack: Vec<(&Task, usize)> = roots.into_iter().rev().map(|t| (t, 0)).collect();
        while let Some((task, depth)) = stack.pop() {
            rows.push((task.clone(), depth));
            if let Some(kids) = children.get(&task.id) {
                for kid in kids.iter().rev() {
                    stack.push((*kid, depth + 1));
                }
            }
        }
        Ok(rows)
    }

    /// Batch completion with optimistic stale-write protection.
    pub async fn bulk_done(&self, ids: &[TaskId]) -> Result<u64, TaskError> {
        let mut expected = Vec::with_capacity(ids.len());
        for id in ids {
            let task = self.get(id).await?;
            expected.push((id.clone(), task.updated_at));
        }
        Ok(self
            .state
            .bulk_set_status(&expected, TaskStatus::Done, self.clock.now())
            .await?)
    }

    pub async fn bulk_score(&self, ids: &[TaskId], score: i64) -> Result<u64, TaskError> {
        let mut expected = Vec::with_capacity(ids.len());
        for id in ids {
            let task = self.get(id).await?;
            expected.push((id.clone(), task.updated_at));
        }
        Ok(self
            .state
            .bulk_set_score(&expected, score, self.clock.now())
            .await?)
    }

    /// Reset tasks to backlog (forced; operator tool).
    pub async fn bulk_reset(&self, ids: &[TaskId]) -> Result<u64, TaskError> {
        let mut expected = Vec::with_capacity(ids.len());
        for id in ids {
            let task = self.get(id).await?;
            expected.push((id.clone(), task.updated_at));
        }
        Ok(self
            .state
            .bulk_set_status(&expected, TaskStatus::Backlog, self.clock.now())
            .await?)
    }

    pub async fn bulk_delete(&self, ids: &[TaskId], cascade: bool) -> Result<u64, TaskError> {
        let mut total = 0;
        for id in ids {
            total += self.delete(id, cascade).await?;
        }
        Ok(total)
    }
}

fn depth_of(id: &TaskId, parent_of: &HashMap<&TaskId, &TaskId>) -> i64 {
    let mut depth = 0;
    let mut current = id;
    let mut seen: HashSet<&TaskId> = HashSet::new();
    while let Some(parent) = parent_of.get(current) {
        if !seen.insert(current) {
            break;
        }
        depth += 1;
        current = parent;
    }
    depth
}

fn score_breakdown(task: &Task, blocks: i64, depth: i64, now: DateTime<Utc>) -> ScoreBreakdown {
    let age = now - task.created_at;
    let age_bonus = if age > Duration::hours(48) {
        AGE_BONUS_48H
    } else if age > Duration::hours(24) {
        AGE_BONUS_24H
    } else {
        0
    };
    let blocks_bonus = BLOCKS_BONUS_PER_TASK * blocks;
    let depth_penalty = DEPTH_PENALTY_PER_LEVEL * depth;
    let blocked_penalty = if task.status == TaskStatus::Blocked {
        BLOCKED_PENALTY
    } else {
        0
    };
    ScoreBreakdown {
        base: task.score,
        blocks_bonus,
        age_bonus,
        depth_penalty,
        blocked_penalty,
        total: task.score + blocks_bonus + age_bonus - depth_penalty - blocked_penalty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_kernel;
    use pretty_assertions::assert_eq;

    fn create(title: &str, status: TaskStatus) -> TaskCreateParams {
        TaskCreateParams {
            title: title.to_string(),
            status,
            ..TaskCreateParams::default()
        }
    }

    #[tokio::test]
    async fn ready_hides_blocked_tasks_until_blocker_is_done() {
        let (kernel, _clock, _dir) = test_kernel().await;
        let t1 = kernel.add(create("t1", TaskStatus::Ready)).await.expect("add");
        let t2 = kernel.add(create("t2", TaskStatus::Ready)).await.expect("add");
        kernel.add_blocker(&t1.id, &t2.id).await.expect("block");

        // t1 is blocked by t2; only t2 is ready.
        let ready = kernel.get_ready(10).await.expect("ready");
        let ids: Vec<_> = ready.iter().map(|s| s.task.id.clone()).collect();
        assert_eq!(ids, vec![t2.id.clone()]);

        let change = kernel.done(&t2.id).await.expect("done");
        assert_eq!(
            change.newly_ready.iter().map(|t| t.id.clone()).collect::<Vec<_>>(),
            vec![t1.id.clone()]
        );

        let ready = kernel.get_ready(10).await.expect("ready");
        let ids: Vec<_> = ready.iter().map(|s| s.task.id.clone()).collect();
        assert_eq!(ids, vec![t1.id.clone()]);
    }

    #[tokio::test]
    async fn scoring_rewards_blocking_and_age_and_penalizes_depth() {
        let (kernel, clock, _dir) = test_kernel().await;

        let blocker = kernel
            .add(create("blocker of two", TaskStatus::Ready))
            .await
            .expect("add");
        let b1 = kernel.add(create("b1", TaskStatus::Ready)).await.expect("add");
        let b2 = kernel.add(create("b2", TaskStatus::Ready)).await.expect("add");
        kernel.add_blocker(&b1.id, &blocker.id).await.expect("block");
        kernel.add_blocker(&b2.id, &blocker.id).await.expect("block");

        let child = kernel
            .add(TaskCreateParams {
                title: "deep child".to_string(),
                status: TaskStatus::Ready,
                parent_id: Some(b1.id.clone()),
                ..TaskCreateParams::default()
            })
            .await
            .expect("add");

        clock.advance(Duration::hours(30));
        let breakdown = kernel.score(&blocker.id).await.expect("score");
        assert_eq!(breakdown.blocks_bonus, 50);
        assert_eq!(breakdown.age_bonus, 50);
        assert_eq!(breakdown.depth_penalty, 0);
        assert_eq!(breakdown.total, 100);

        let breakdown = kernel.score(&child.id).await.expect("score");
        assert_eq!(breakdown.depth_penalty, 10);
        assert_eq!(breakdown.total, 40);

        clock.advance(Duration::hours(20));
        let breakdown = kernel.score(&blocker.id).await.expect("score");
        assert_eq!(breakdown.age_bonus, 100);

        // The blocker outranks everything in the ready ordering.
        let ready = kernel.get_ready(10).await.expect("ready");
        assert_eq!(ready[0].task.id, blocker.id);
    }

    #[tokio::test]
    async fn transition_oracle_rejects_illegal_moves() {
        let (kernel, _clock, _dir) = test_kernel().await;
        let task = kernel.add(create("t", TaskStatus::Backlog)).await.expect("add");
        kernel
            .set_status(&task.id, TaskStatus::Active, false)
            .await
            .expect("backlog -> active is legal");
        let err = kernel
            .set_status(&task.id, TaskStatus::Ready, false)
            .await
            .expect_err("active -> ready is not in the graph");
        assert!(matches!(err, TaskError::InvalidStatusTransition { .. }));

        // Forced transitions bypass the oracle.
        kernel
            .set_status(&task.id, TaskStatus::Ready, true)
            .await
            .expect("forced transition");
    }

    #[tokio::test]
    async fn reopen_keeps_completed_at() {
        let (kernel, _clock, _dir) = test_kernel().await;
        let task = kernel.add(create("t", TaskStatus::Ready)).await.expect("add");
        let change = kernel.done(&task.id).await.expect("done");
        let completed_at = change.task.completed_at.expect("completed_at set");

        let change = kernel
            .set_status(&task.id, TaskStatus::Backlog, false)
            .await
            .expect("reopen");
        assert_eq!(change.task.status, TaskStatus::Backlog);
        assert_eq!(change.task.completed_at, Some(completed_at));
    }

    #[tokio::test]
    async fn cycle_rejection_leaves_graph_unchanged() {
        let (kernel, _clock, _dir) = test_kernel().await;
        let a = kernel.add(create("a", TaskStatus::Ready)).await.expect("add");
        let b = kernel.add(create("b", TaskStatus::Ready)).await.expect("add");
        let c = kernel.add(create("c", TaskStatus::Ready)).await.expect("add");
        // a depends on b, b depends on c.
        kernel.add_blocker(&a.id, &b.id).await.expect("block");
        kernel.add_blocker(&b.id, &c.id).await.expect("block");

        let err = kernel
            .add_blocker(&c.id, &a.id)
            .await
            .expect_err("closing the loop must fail");
        assert!(matches!(err, TaskError::CircularDependency { .. }));
    }

    #[tokio::test]
    async fn delete_refuses_children_without_cascade() {
        let (kernel, _clock, _dir) = test_kernel().await;
        let parent = kernel.add(create("parent", TaskStatus::Backlog)).await.expect("add");
        kernel
            .add(TaskCreateParams {
                title: "child".to_string(),
                parent_id: Some(parent.id.clone()),
                ..TaskCreateParams::default()
            })
            .await
            .expect("add child");

        let err = kernel
            .delete(&parent.id, false)
            .await
            .expect_err("children must block deletion");
        assert!(matches!(err, TaskError::HasChildren { .. }));
        assert_eq!(kernel.delete(&parent.id, true).await.expect("cascade"), 2);
    }
}
