//! A bone tagged as a goal (spec.md §3 "Effector", §4.4 heading refresh).

use crate::bone::IkBone;
use crate::error::IkError;
use crate::transform::Rigid;
use glam::Vec3;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// Per-axis direction priorities, kept as a small fixed-size record rather than a dynamic
/// object per spec.md §9 ("Effector priority vector").
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AxisPriorities {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl AxisPriorities {
    pub const NONE: Self = Self { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Result<Self, IkError> {
        for (axis, v) in [("x", x), ("y", y), ("z", z)] {
            if !(0.0..=1.0).contains(&v) {
                return Err(IkError::OutOfRangeConfig(format!(
                    "effector priority {axis} = {v} outside [0, 1]"
                )));
            }
        }
        Ok(Self { x, y, z })
    }

    fn axes(&self) -> [(Vec3, f32); 3] {
        [(Vec3::X, self.x), (Vec3::Y, self.y), (Vec3::Z, self.z)]
    }

    /// `N = 1 + 2 * #(axes with p_i > 0)` (spec.md §3).
    pub fn heading_count(&self) -> usize {
        1 + 2 * self.axes().iter().filter(|(_, p)| *p > 0.0).count()
    }
}

/// A bone tagged as a goal.
pub struct Effector {
    pub bone_id: usize,
    target_global_transform: Cell<Rigid>,
    pub priorities: AxisPriorities,
    pub weight: f32,
    pub passthrough_factor: f32,
    /// Back-reference to the shadow-tree bone this effector is attached to, bound once at
    /// segmentation time via `bind_bone`. Used to read the bone's *current* pose for
    /// `push_tip_headings`/`push_current_headings_uniform`.
    ik_bone: RefCell<Option<Weak<IkBone>>>,
}

impl Effector {
    pub fn new(
        bone_id: usize,
        weight: f32,
        priorities: AxisPriorities,
        passthrough_factor: f32,
    ) -> Result<Self, IkError> {
        if !(0.0..=1.0).contains(&weight) {
            return Err(IkError::OutOfRangeConfig(format!("effector weight {weight} outside [0, 1]")));
        }
        if !(0.0..=1.0).contains(&passthrough_factor) {
            return Err(IkError::OutOfRangeConfig(format!(
                "effector passthrough_factor {passthrough_factor} outside [0, 1]"
            )));
        }
        Ok(Self {
            bone_id,
            target_global_transform: Cell::new(Rigid::IDENTITY),
            priorities,
            weight,
            passthrough_factor,
            ik_bone: RefCell::new(None),
        })
    }

    pub fn heading_count(&self) -> usize {
        self.priorities.heading_count()
    }

    pub fn target_global_transform(&self) -> Rigid {
        self.target_global_transform.get()
    }

    pub fn set_target_global_transform(&self, t: Rigid) {
        self.target_global_transform.set(t);
    }

    /// Bind this effector to its shadow-tree bone. Called once by segmentation when the bone
    /// owning this effector is constructed.
    pub fn bind_bone(&self, bone: &Rc<IkBone>) {
        *self.ik_bone.borrow_mut() = Some(Rc::downgrade(bone));
    }

    /// The bone-direction's live global transform, substituted for the goal when computing
    /// tip headings (spec.md §4.4 `update_tip_headings`). Identity if unbound.
    pub fn current_bone_direction(&self) -> Rigid {
        self.ik_bone
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|b| b.bone_direction.get_global())
            .unwrap_or(Rigid::IDENTITY)
    }

    /// Append this effector's target headings, scaled by `scale` (the cumulative passthrough
    /// factor of the chain carrying it up from a descendant segment), into `out`. `origin` is
    /// the evaluating bone's `bone_direction` global origin (spec.md §4.4).
    pub fn push_target_headings(&self, origin: Vec3, scale: f32, out: &mut Vec<Vec3>, weights: &mut Vec<f32>) {
        Self::push_headings_from(self.target_global_transform(), origin, scale, 1.0, self, out, weights);
    }

    /// Append this effector's *current* tip headings (using the bone-direction's live global
    /// transform instead of the goal) into `out`, scaling axis headings by
    /// `min(‖current.origin − origin‖, 1)` so QCP balances position against orientation
    /// (spec.md §4.4 `update_tip_headings`).
    pub fn push_tip_headings(&self, origin: Vec3, current: Rigid, scale: f32, out: &mut Vec<Vec3>, weights: &mut Vec<f32>) {
        let axis_scale = (current.translation - origin).length().min(1.0);
        Self::push_headings_from(current, origin, scale, axis_scale, self, out, weights);
    }

    /// Like `push_tip_headings` but without the distance-based axis scaling, used for
    /// `tip_headings_uniform` so the stabilization loop's convergence measurement is on equal
    /// footing with `target_headings` (spec.md §4.4).
    pub fn push_current_headings_uniform(&self, origin: Vec3, current: Rigid, scale: f32, out: &mut Vec<Vec3>, weights: &mut Vec<f32>) {
        Self::push_headings_from(current, origin, scale, 1.0, self, out, weights);
    }

    fn push_headings_from(
        transform: Rigid,
        origin: Vec3,
        scale: f32,
        axis_scale: f32,
        effector: &Effector,
        out: &mut Vec<Vec3>,
        weights: &mut Vec<f32>,
    ) {
        out.push(transform.translation - origin);
        weights.push(effector.weight * scale);

        for (axis, priority) in effector.priorities.axes() {
            if priority <= 0.0 {
                continue;
            }
            let w = effector.weight * scale * priority;
            out.push(transform.transform_point(priority * axis * axis_scale) - origin);
            weights.push(w);
            out.push(transform.transform_point(-priority * axis * axis_scale) - origin);
            weights.push(w);
        }
    }
}
