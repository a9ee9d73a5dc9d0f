//! The shadow tree's joint type (spec.md §3 "IK bone", §4.4).
//!
//! An `IkBone` owns a chain of three `BoneTransform` frames plus an optional constraint and
//! an optional effector. The shadow tree is built once per segmentation pass and is entirely
//! separate from the external skeleton (spec.md §9 "Shadow tree vs. skeleton") — poses cross
//! the boundary only through `Solver::solve`'s pull/push steps.

use crate::effector::Effector;
use crate::error::IkError;
use crate::kusudama::Kusudama;
use crate::transform::{BoneTransform, Rigid};
use glam::Vec3;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// One joint in the solver's private copy of the skeleton.
pub struct IkBone {
    pub bone_id: usize,
    parent: RefCell<Option<Weak<IkBone>>>,
    children: RefCell<Vec<Rc<IkBone>>>,

    /// The pose the solver is updating; mirrors the external skeleton's local transform for
    /// this bone, parented the same way the external skeleton is.
    pub godot_skeleton_aligned: Rc<BoneTransform>,
    /// A frame whose -Y axis points at the child centroid; constraint math happens in terms
    /// of this axis rather than the raw skeleton-aligned frame.
    pub bone_direction: Rc<BoneTransform>,
    /// Anchored to the parent's aligned frame; swing limits are evaluated here.
    pub orientation_transform: Rc<BoneTransform>,
    /// Anchored to the parent's aligned frame; twist limits are evaluated here.
    pub twist_transform: Rc<BoneTransform>,

    constraint: RefCell<Option<Kusudama>>,
    effector: RefCell<Option<Rc<Effector>>>,

    pub cos_half_dampen: Cell<f32>,
    cos_half_returnful: RefCell<Vec<f32>>,
}

impl IkBone {
    pub fn new(bone_id: usize, parent: Option<&Rc<IkBone>>) -> Rc<Self> {
        let parent_aligned = parent.map(|p| &p.godot_skeleton_aligned);
        let godot_skeleton_aligned = BoneTransform::new(parent_aligned);
        let bone_direction = BoneTransform::new(Some(&godot_skeleton_aligned));
        let orientation_transform = BoneTransform::new(parent_aligned);
        let twist_transform = BoneTransform::new(parent_aligned);

        let bone = Rc::new(Self {
            bone_id,
            parent: RefCell::new(parent.map(Rc::downgrade)),
            children: RefCell::new(Vec::new()),
            godot_skeleton_aligned,
            bone_direction,
            orientation_transform,
            twist_transform,
            constraint: RefCell::new(None),
            effector: RefCell::new(None),
            cos_half_dampen: Cell::new((std::f32::consts::PI / 2.0).cos()),
            cos_half_returnful: RefCell::new(Vec::new()),
        });

        if let Some(p) = parent {
            p.children.borrow_mut().push(Rc::clone(&bone));
        }
        bone
    }

    pub fn parent(&self) -> Option<Rc<IkBone>> {
        self.parent.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    pub fn children(&self) -> Vec<Rc<IkBone>> {
        self.children.borrow().clone()
    }

    pub fn constraint(&self) -> Option<Kusudama> {
        self.constraint.borrow().clone()
    }

    pub fn set_constraint(&self, constraint: Kusudama) {
        *self.constraint.borrow_mut() = Some(constraint);
    }

    pub fn clear_constraint(&self) {
        *self.constraint.borrow_mut() = None;
    }

    pub fn orientationally_constrained(&self) -> bool {
        self.constraint.borrow().as_ref().is_some_and(|k| k.orientationally_constrained)
    }

    pub fn axially_constrained(&self) -> bool {
        self.constraint.borrow().as_ref().is_some_and(|k| k.axially_constrained)
    }

    pub fn effector(&self) -> Option<Rc<Effector>> {
        self.effector.borrow().clone()
    }

    pub fn set_effector(&self, effector: Rc<Effector>) {
        *self.effector.borrow_mut() = Some(effector);
    }

    pub fn clear_effector(&self) {
        *self.effector.borrow_mut() = None;
    }

    pub fn has_effector_descendant(&self) -> bool {
        if self.effector().is_some() {
            return true;
        }
        self.children().iter().any(|c| c.has_effector_descendant())
    }

    /// Orient `bone_direction`'s local frame so its -Y axis points at `child_centroid`
    /// (expressed in this bone's aligned-frame local coordinates). Called once per bone at
    /// segmentation time (spec.md §3's `bone_direction` invariant).
    pub fn align_bone_direction(&self, child_centroid_local: Vec3) {
        let dir = child_centroid_local.normalize_or_zero();
        let rotation = if dir == Vec3::ZERO {
            glam::Quat::IDENTITY
        } else {
            glam::Quat::from_rotation_arc(-Vec3::Y, dir)
        };
        self.bone_direction.set_local(Rigid::new(rotation, Vec3::ZERO));
    }

    /// Resize and fill the per-iteration returnful-pull table (spec.md §3: `cos_half_returnful[i]`
    /// of length = outer iteration count). Ramps from no pull on the first iteration up to the
    /// constraint's `resistance` by the last, matching the original's intent of easing
    /// constraint pressure in over a frame rather than snapping it on immediately.
    pub fn rebuild_cos_half_returnful(&self, iterations: usize) {
        let resistance = self.constraint.borrow().as_ref().map(|k| k.resistance).unwrap_or(0.0);
        let mut table = Vec::with_capacity(iterations);
        for i in 0..iterations {
            let t = if iterations <= 1 { 1.0 } else { i as f32 / (iterations - 1) as f32 };
            let half_angle = (std::f32::consts::PI / 2.0) * resistance * t;
            table.push(half_angle.cos());
        }
        *self.cos_half_returnful.borrow_mut() = table;
    }

    pub fn cos_half_returnful_at(&self, iteration: usize) -> f32 {
        self.cos_half_returnful
            .borrow()
            .get(iteration)
            .copied()
            .unwrap_or(1.0)
    }

    pub fn set_damp(&self, damp_radians: f32) -> Result<(), IkError> {
        if !(damp_radians > 0.0 && damp_radians <= std::f32::consts::PI) {
            return Err(IkError::OutOfRangeConfig(format!(
                "damp {damp_radians} outside (0, pi]"
            )));
        }
        self.cos_half_dampen.set((damp_radians / 2.0).cos());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_no_parent() {
        let root = IkBone::new(0, None);
        assert!(root.is_root());
    }

    #[test]
    fn child_is_registered_with_parent() {
        let root = IkBone::new(0, None);
        let child = IkBone::new(1, Some(&root));
        assert_eq!(root.children().len(), 1);
        assert_eq!(child.parent().unwrap().bone_id, 0);
    }

    #[test]
    fn bone_direction_inherits_skeleton_aligned() {
        let root = IkBone::new(0, None);
        root.godot_skeleton_aligned
            .set_local(Rigid::new(glam::Quat::IDENTITY, Vec3::new(1.0, 0.0, 0.0)));
        assert!((root.bone_direction.get_global().translation - Vec3::new(1.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn align_bone_direction_points_minus_y_at_centroid() {
        let root = IkBone::new(0, None);
        root.align_bone_direction(Vec3::X);
        let rotated = root.bone_direction.get_local().rotation * -Vec3::Y;
        assert!((rotated - Vec3::X).length() < 1e-5);
    }

    #[test]
    fn returnful_table_ramps_with_resistance() {
        let root = IkBone::new(0, None);
        let mut k = Kusudama::new();
        k.resistance = 1.0;
        root.set_constraint(k);
        root.rebuild_cos_half_returnful(4);
        assert!(root.cos_half_returnful_at(0) > root.cos_half_returnful_at(3));
    }

    #[test]
    fn damp_rejects_out_of_range() {
        let root = IkBone::new(0, None);
        assert!(root.set_damp(4.0).is_err());
        assert!(root.set_damp(-0.1).is_err());
        assert!(root.set_damp(0.0).is_err(), "zero damp would freeze every per-frame update silently");
    }
}
