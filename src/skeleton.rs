//! External collaborator interfaces (spec.md §6) — the skeleton data structure and goal
//! source are consumed, not implemented, by this crate. `InMemorySkeleton` is a minimal
//! test double used by the solver's own scenario tests and is not part of the public
//! surface a host is expected to use.

use crate::transform::Rigid;
use std::collections::HashMap;

/// The skeleton data structure: parent table, local bone poses, bone-children lookup.
/// Implemented by the host; this crate only reads and writes through this trait.
pub trait SkeletonProvider {
    fn bone_count(&self) -> usize;
    fn bone_parent(&self, id: usize) -> Option<usize>;
    fn bone_children(&self, id: usize) -> Vec<usize>;
    fn bone_pose(&self, id: usize) -> Rigid;
    fn set_bone_pose(&mut self, id: usize, pose: Rigid);
    fn parentless_bones(&self) -> Vec<usize>;
    fn find_bone(&self, name: &str) -> Option<usize>;
}

/// Per-effector goal lookup, in the skeleton's local frame (spec.md §6 "Goal source").
pub trait GoalSource {
    fn goal_pose(&self, bone_id: usize) -> Option<Rigid>;
}

/// A plain in-memory skeleton, useful for tests and for hosts with no existing scene graph
/// to adapt. Not a recommended production skeleton representation — hosts with an existing
/// bone hierarchy should implement `SkeletonProvider` directly over it instead of copying
/// into this type.
#[derive(Debug, Clone, Default)]
pub struct InMemorySkeleton {
    names: Vec<String>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    poses: Vec<Rigid>,
}

impl InMemorySkeleton {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a bone and return its id. `parent` must already exist in this skeleton.
    pub fn add_bone(&mut self, name: impl Into<String>, parent: Option<usize>, pose: Rigid) -> usize {
        let id = self.names.len();
        self.names.push(name.into());
        self.parents.push(parent);
        self.children.push(Vec::new());
        self.poses.push(pose);
        if let Some(p) = parent {
            self.children[p].push(id);
        }
        id
    }
}

impl SkeletonProvider for InMemorySkeleton {
    fn bone_count(&self) -> usize {
        self.names.len()
    }

    fn bone_parent(&self, id: usize) -> Option<usize> {
        self.parents[id]
    }

    fn bone_children(&self, id: usize) -> Vec<usize> {
        self.children[id].clone()
    }

    fn bone_pose(&self, id: usize) -> Rigid {
        self.poses[id]
    }

    fn set_bone_pose(&mut self, id: usize, pose: Rigid) {
        self.poses[id] = pose;
    }

    fn parentless_bones(&self) -> Vec<usize> {
        self.parents
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_none())
            .map(|(i, _)| i)
            .collect()
    }

    fn find_bone(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// A fixed lookup table of per-bone goal poses (skeleton-local frame), the simplest possible
/// `GoalSource`.
#[derive(Debug, Clone, Default)]
pub struct StaticGoals {
    goals: HashMap<usize, Rigid>,
}

impl StaticGoals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, bone_id: usize, pose: Rigid) {
        self.goals.insert(bone_id, pose);
    }
}

impl GoalSource for StaticGoals {
    fn goal_pose(&self, bone_id: usize) -> Option<Rigid> {
        self.goals.get(&bone_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    #[test]
    fn in_memory_skeleton_tracks_parent_child() {
        let mut sk = InMemorySkeleton::new();
        let root = sk.add_bone("root", None, Rigid::IDENTITY);
        let child = sk.add_bone("child", Some(root), Rigid::new(Quat::IDENTITY, Vec3::Y));

        assert_eq!(sk.bone_parent(child), Some(root));
        assert_eq!(sk.bone_children(root), vec![child]);
        assert_eq!(sk.parentless_bones(), vec![root]);
        assert_eq!(sk.find_bone("child"), Some(child));
    }

    #[test]
    fn static_goals_returns_none_for_unset_bone() {
        let goals = StaticGoals::new();
        assert!(goals.goal_pose(3).is_none());
    }
}
