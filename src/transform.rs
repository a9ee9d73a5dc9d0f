//! Lazy local/global rigid transform with parent back-reference.
//!
//! Mirrors the teacher's dirty-bit lazy-refresh idiom (see the pose cache in the teacher
//! crate's `bone::cache`), generalized from a fixed skeleton-wide bitset to one node per
//! shadow-tree bone, since the shadow tree's shape is solver-configured rather than fixed.

use glam::{Quat, Vec3};
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// A rigid transform: rotation then translation, no scale (scale is ignored by the solver
/// per spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rigid {
    pub rotation: Quat,
    pub translation: Vec3,
}

impl Rigid {
    pub const IDENTITY: Self = Self {
        rotation: Quat::IDENTITY,
        translation: Vec3::ZERO,
    };

    pub fn new(rotation: Quat, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Compose `self ∘ other`, i.e. apply `other` first, then `self`.
    pub fn compose(&self, other: &Rigid) -> Rigid {
        Rigid {
            rotation: self.rotation * other.rotation,
            translation: self.translation + self.rotation * other.translation,
        }
    }

    pub fn inverse(&self) -> Rigid {
        let inv_rot = self.rotation.inverse();
        Rigid {
            rotation: inv_rot,
            translation: inv_rot * -self.translation,
        }
    }

    #[inline]
    pub fn transform_point(&self, p: Vec3) -> Vec3 {
        self.rotation * p + self.translation
    }

    #[inline]
    pub fn transform_vector(&self, v: Vec3) -> Vec3 {
        self.rotation * v
    }
}

impl Default for Rigid {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// One coordinate frame in the shadow tree.
///
/// Invariant: `global` always reflects `parent.global ∘ local` by the time `get_global`
/// returns. Rather than a single dirty bit (which can't see an ancestor's local change
/// without a child-notification list), each node stamps its cached global with the local
/// and parent versions it was computed from; a mismatch on either triggers a recompute, and
/// recomputing bumps this node's own version so its children notice in turn (spec.md §9
/// "Cyclic references in transforms").
#[derive(Debug)]
pub struct BoneTransform {
    parent: RefCell<Option<Weak<BoneTransform>>>,
    local: Cell<Rigid>,
    local_version: Cell<u64>,
    global: Cell<Rigid>,
    global_version: Cell<u64>,
    cached_local_version: Cell<u64>,
    cached_parent_version: Cell<u64>,
}

impl BoneTransform {
    pub fn new(parent: Option<&Rc<BoneTransform>>) -> Rc<Self> {
        Rc::new(Self {
            parent: RefCell::new(parent.map(Rc::downgrade)),
            local: Cell::new(Rigid::IDENTITY),
            local_version: Cell::new(1),
            global: Cell::new(Rigid::IDENTITY),
            global_version: Cell::new(0),
            cached_local_version: Cell::new(0),
            cached_parent_version: Cell::new(0),
        })
    }

    pub fn with_local(parent: Option<&Rc<BoneTransform>>, local: Rigid) -> Rc<Self> {
        let node = Self::new(parent);
        node.set_local(local);
        node
    }

    pub fn set_local(&self, local: Rigid) {
        self.local.set(local);
        self.local_version.set(self.local_version.get() + 1);
    }

    pub fn get_local(&self) -> Rigid {
        self.local.get()
    }

    /// Set the global pose directly; recomputes local so the invariant holds immediately.
    pub fn set_global(&self, global: Rigid) {
        let parent_version = self.parent_version();
        let parent_global = self.parent_global();
        self.local.set(parent_global.inverse().compose(&global));
        self.local_version.set(self.local_version.get() + 1);
        self.global.set(global);
        self.cached_local_version.set(self.local_version.get());
        self.cached_parent_version.set(parent_version);
        self.global_version.set(self.global_version.get() + 1);
    }

    pub fn get_global(&self) -> Rigid {
        let parent_version = self.parent_version();
        if self.cached_local_version.get() == self.local_version.get()
            && self.cached_parent_version.get() == parent_version
        {
            return self.global.get();
        }
        let parent_global = self.parent_global();
        let global = parent_global.compose(&self.local.get());
        self.global.set(global);
        self.cached_local_version.set(self.local_version.get());
        self.cached_parent_version.set(parent_version);
        self.global_version.set(self.global_version.get() + 1);
        global
    }

    /// Re-parent this node, preserving its current global pose by recomputing local against
    /// the new parent (spec.md §4.1).
    pub fn set_parent(&self, new_parent: Option<&Rc<BoneTransform>>) {
        let global = self.get_global();
        *self.parent.borrow_mut() = new_parent.map(Rc::downgrade);
        self.set_global(global);
    }

    /// Apply a rotation expressed in the global frame to this node's local transform.
    pub fn rotate_local_with_global(&self, q: Quat) {
        let parent_global = self.parent_global();
        let local = self.local.get();
        let new_local_rot = parent_global.rotation.inverse() * q * parent_global.rotation * local.rotation;
        self.set_local(Rigid::new(new_local_rot, local.translation));
    }

    /// Apply a translation delta expressed in the global frame.
    pub fn translate_global(&self, delta: Vec3) {
        let parent_global = self.parent_global();
        let local = self.local.get();
        let local_delta = parent_global.rotation.inverse() * delta;
        self.set_local(Rigid::new(local.rotation, local.translation + local_delta));
    }

    /// This node's global-cache version, forcing a refresh first so a child comparing
    /// against it always sees an up-to-date value.
    fn global_version(&self) -> u64 {
        self.get_global();
        self.global_version.get()
    }

    fn parent_version(&self) -> u64 {
        match self.parent.borrow().as_ref() {
            Some(weak) => weak.upgrade().map(|p| p.global_version()).unwrap_or(0),
            None => 0,
        }
    }

    fn parent_global(&self) -> Rigid {
        match self.parent.borrow().as_ref() {
            Some(weak) => weak.upgrade().map(|p| p.get_global()).unwrap_or_default(),
            None => Rigid::IDENTITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detached_node_global_equals_local() {
        let node = BoneTransform::new(None);
        let local = Rigid::new(Quat::from_rotation_y(0.5), Vec3::new(1.0, 2.0, 3.0));
        node.set_local(local);
        assert_eq!(node.get_global(), local);
    }

    #[test]
    fn global_composes_with_parent() {
        let parent = BoneTransform::new(None);
        parent.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(1.0, 0.0, 0.0)));

        let child = BoneTransform::new(Some(&parent));
        child.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(0.0, 1.0, 0.0)));

        let global = child.get_global();
        assert!((global.translation - Vec3::new(1.0, 1.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn global_refresh_picks_up_parent_changes_automatically() {
        let parent = BoneTransform::new(None);
        let child = BoneTransform::new(Some(&parent));
        child.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(1.0, 0.0, 0.0)));

        assert_eq!(child.get_global().translation, Vec3::new(1.0, 0.0, 0.0));

        parent.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(5.0, 0.0, 0.0)));
        assert_eq!(child.get_global().translation, Vec3::new(6.0, 0.0, 0.0));
    }

    #[test]
    fn set_global_preserves_invariant() {
        let parent = BoneTransform::new(None);
        parent.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(2.0, 0.0, 0.0)));
        let child = BoneTransform::new(Some(&parent));

        let desired_global = Rigid::new(Quat::IDENTITY, Vec3::new(5.0, 0.0, 0.0));
        child.set_global(desired_global);
        assert!((child.get_global().translation - desired_global.translation).length() < 1e-6);
    }

    #[test]
    fn set_parent_preserves_global_pose() {
        let old_parent = BoneTransform::new(None);
        old_parent.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(1.0, 0.0, 0.0)));
        let new_parent = BoneTransform::new(None);
        new_parent.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(0.0, 10.0, 0.0)));

        let child = BoneTransform::new(Some(&old_parent));
        child.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(0.0, 1.0, 0.0)));
        let global_before = child.get_global();

        child.set_parent(Some(&new_parent));
        assert!((child.get_global().translation - global_before.translation).length() < 1e-6);

        // Re-parenting still tracks the new parent's subsequent changes.
        new_parent.set_local(Rigid::new(Quat::IDENTITY, Vec3::new(0.0, 11.0, 0.0)));
        assert!((child.get_global().translation - Vec3::new(1.0, 12.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn set_global_cache_is_not_immediately_invalidated() {
        let parent = BoneTransform::new(None);
        let child = BoneTransform::new(Some(&parent));
        let desired_global = Rigid::new(Quat::from_rotation_y(0.3), Vec3::new(1.0, 0.0, 0.0));
        child.set_global(desired_global);
        // A second read with nothing changed must hit the cache and return the same value.
        assert_eq!(child.get_global(), desired_global);
    }
}
