//! Bone segment: the unit of QCP iteration (spec.md §3 "Bone segment", §4.4).
//!
//! A segment is a chain of `IkBone`s from a root down to an effector or a branching tip.
//! Segmentation builds this forest top-down from the skeleton; the per-frame pass solves
//! children before parents (post-order), and each bone runs a bounded stabilization loop
//! around its own QCP-plus-constraint update.

use crate::bone::IkBone;
use crate::effector::Effector;
use crate::kusudama::clamp_to_cos_half_angle;
use crate::qcp::Qcp;
use crate::skeleton::SkeletonProvider;
use crate::transform::Rigid;
use glam::{Quat, Vec3};
use std::cell::RefCell;
use std::collections::HashSet;
use std::f32::consts::PI;
use std::rc::Rc;

/// One effector's contribution to a segment's heading arrays, scaled by the cumulative
/// passthrough factor of the chain that carried it up from a descendant segment.
pub struct SegmentEffector {
    pub effector: Rc<Effector>,
    pub scale: f32,
}

/// A chain of bones solved together each outer iteration.
pub struct BoneSegment {
    pub bones: Vec<Rc<IkBone>>,
    pub child_segments: Vec<BoneSegment>,
    pub effectors: Vec<SegmentEffector>,
    pub default_stabilizing_pass_count: u32,
    pub is_root: bool,

    target_headings: RefCell<Vec<Vec3>>,
    tip_headings: RefCell<Vec<Vec3>>,
    tip_headings_uniform: RefCell<Vec<Vec3>>,
    heading_weights: RefCell<Vec<f32>>,
    last_rmsd_squared: std::cell::Cell<f32>,
}

impl BoneSegment {
    fn new(bones: Vec<Rc<IkBone>>, child_segments: Vec<BoneSegment>, is_root: bool, default_stabilizing_pass_count: u32) -> Self {
        let tip = bones.last().expect("segment must have at least one bone").clone();
        let effectors = collect_effectors(&tip, &child_segments);
        let heading_total: usize = effectors.iter().map(|se| se.effector.heading_count()).sum();

        Self {
            bones,
            child_segments,
            effectors,
            default_stabilizing_pass_count,
            is_root,
            target_headings: RefCell::new(vec![Vec3::ZERO; heading_total]),
            tip_headings: RefCell::new(vec![Vec3::ZERO; heading_total]),
            tip_headings_uniform: RefCell::new(vec![Vec3::ZERO; heading_total]),
            heading_weights: RefCell::new(vec![0.0; heading_total]),
            last_rmsd_squared: std::cell::Cell::new(0.0),
        }
    }

    pub fn tip(&self) -> &Rc<IkBone> {
        self.bones.last().expect("segment must have at least one bone")
    }

    pub fn last_rmsd_squared(&self) -> f32 {
        self.last_rmsd_squared.get()
    }

    /// All bones appearing in this segment or any descendant segment (spec.md Property 7).
    pub fn all_bone_ids(&self) -> HashSet<usize> {
        let mut out: HashSet<usize> = self.bones.iter().map(|b| b.bone_id).collect();
        for child in &self.child_segments {
            out.extend(child.all_bone_ids());
        }
        out
    }

    /// One outer-iteration pass over this segment and its children (spec.md §4.4 "Per-frame
    /// pass"). Children always solve first.
    pub fn solve(&self, qcp: &Qcp, damp: f32, constraint_mode: bool) {
        for child in &self.child_segments {
            child.solve(qcp, damp, constraint_mode);
        }
        let effective_damp = if self.is_root { PI } else { damp };
        for bone in self.bones.iter().rev() {
            self.update_optimal_rotation(bone, qcp, effective_damp, constraint_mode);
        }
    }

    fn update_optimal_rotation(&self, bone: &Rc<IkBone>, qcp: &Qcp, damp: f32, constraint_mode: bool) {
        let max_passes = self.default_stabilizing_pass_count;
        let mut previous_deviation = f32::INFINITY;

        for _ in 0..=max_passes {
            let prev_pose = bone.godot_skeleton_aligned.get_local();

            self.refresh_target_headings(bone);
            self.refresh_tip_headings(bone);

            if !constraint_mode {
                let sol = {
                    let target = self.target_headings.borrow();
                    let tip = self.tip_headings.borrow();
                    let weights = self.heading_weights.borrow();
                    qcp.solve(&tip, &target, &weights, self.is_root)
                };
                let r = clamp_to_cos_half_angle(sol.rotation, (damp / 2.0).cos());
                bone.godot_skeleton_aligned.rotate_local_with_global(r);
                if self.is_root {
                    let g = bone.godot_skeleton_aligned.get_global();
                    bone.godot_skeleton_aligned
                        .set_global(Rigid::new(g.rotation, g.translation + sol.translation));
                }
                self.last_rmsd_squared.set(sol.rmsd_squared);
            }

            if bone.parent().is_some() {
                self.apply_constraints(bone, damp);
            }

            if max_passes > 0 {
                self.refresh_tip_headings_uniform(bone);
                let msd = {
                    let tip = self.tip_headings_uniform.borrow();
                    let target = self.target_headings.borrow();
                    let weights = self.heading_weights.borrow();
                    manual_msd(&tip, &target, &weights)
                };
                if msd <= previous_deviation * 1.0001 {
                    previous_deviation = msd;
                    break;
                } else {
                    bone.godot_skeleton_aligned.set_local(prev_pose);
                }
            }
        }
    }

    fn apply_constraints(&self, bone: &Rc<IkBone>, damp: f32) {
        let Some(kusudama) = bone.constraint() else {
            return;
        };

        if bone.orientationally_constrained() {
            let frame_rot = bone.orientation_transform.get_global().rotation;
            let d_global = bone.bone_direction.get_global().rotation * Vec3::Y;
            let d_local = frame_rot.inverse() * d_global;
            let max_half_angle = 2.0 * bone.cos_half_dampen.get().clamp(-1.0, 1.0).acos();
            let q_local = kusudama.snap_to_orientation_limit(d_local, max_half_angle.min(damp));
            if q_local != Quat::IDENTITY {
                let q_global = frame_rot * q_local * frame_rot.inverse();
                bone.godot_skeleton_aligned.rotate_local_with_global(q_global);
            }
        }

        if bone.axially_constrained() {
            let frame_rot = bone.twist_transform.get_global().rotation;
            let local_rotation = frame_rot.inverse() * bone.godot_skeleton_aligned.get_global().rotation;

            let snap_angle = kusudama.snap_to_twist_limit(local_rotation);
            if snap_angle.abs() > 1e-7 {
                let q_global = frame_rot * Quat::from_rotation_y(snap_angle) * frame_rot.inverse();
                bone.godot_skeleton_aligned.rotate_local_with_global(q_global);
            }

            let local_rotation = frame_rot.inverse() * bone.godot_skeleton_aligned.get_global().rotation;
            let pull_angle = kusudama.pull_toward_twist_center(local_rotation);
            if pull_angle.abs() > 1e-7 {
                let q_global = frame_rot * Quat::from_rotation_y(pull_angle) * frame_rot.inverse();
                bone.godot_skeleton_aligned.rotate_local_with_global(q_global);
            }
        }
    }

    fn refresh_target_headings(&self, bone: &Rc<IkBone>) {
        let origin = bone.bone_direction.get_global().translation;
        let mut headings = Vec::with_capacity(self.target_headings.borrow().len());
        let mut weights = Vec::with_capacity(headings.capacity());
        for se in &self.effectors {
            se.effector.push_target_headings(origin, se.scale, &mut headings, &mut weights);
        }
        *self.target_headings.borrow_mut() = headings;
        *self.heading_weights.borrow_mut() = weights;
    }

    fn refresh_tip_headings(&self, bone: &Rc<IkBone>) {
        let origin = bone.bone_direction.get_global().translation;
        let mut headings = Vec::with_capacity(self.tip_headings.borrow().len());
        let mut weights = Vec::with_capacity(headings.capacity());
        for se in &self.effectors {
            let current = se.effector.current_bone_direction();
            se.effector.push_tip_headings(origin, current, se.scale, &mut headings, &mut weights);
        }
        *self.tip_headings.borrow_mut() = headings;
    }

    fn refresh_tip_headings_uniform(&self, bone: &Rc<IkBone>) {
        let origin = bone.bone_direction.get_global().translation;
        let mut headings = Vec::with_capacity(self.tip_headings_uniform.borrow().len());
        let mut weights = Vec::new();
        for se in &self.effectors {
            let current = se.effector.current_bone_direction();
            se.effector.push_current_headings_uniform(origin, current, se.scale, &mut headings, &mut weights);
        }
        *self.tip_headings_uniform.borrow_mut() = headings;
    }
}

fn collect_effectors(tip: &Rc<IkBone>, child_segments: &[BoneSegment]) -> Vec<SegmentEffector> {
    let mut out = Vec::new();
    if let Some(effector) = tip.effector() {
        out.push(SegmentEffector { effector, scale: 1.0 });
    }
    for child in child_segments {
        for se in &child.effectors {
            let scale = se.scale * se.effector.passthrough_factor;
            if scale > 0.0 {
                out.push(SegmentEffector {
                    effector: Rc::clone(&se.effector),
                    scale,
                });
            }
        }
    }
    out
}

/// Weighted mean squared deviation between two heading arrays, used only by the
/// stabilization loop's "got closer?" gate (spec.md §4.4).
fn manual_msd(a: &[Vec3], b: &[Vec3], weights: &[f32]) -> f32 {
    let wsum: f32 = weights.iter().sum();
    if wsum <= 0.0 {
        return 0.0;
    }
    let sum: f32 = a
        .iter()
        .zip(b)
        .zip(weights)
        .map(|((x, y), w)| w * (*x - *y).length_squared())
        .sum();
    sum / wsum
}

/// Recursively build the IK-bone shadow tree, keeping only bones on a path to an effector
/// (spec.md §4.4 step 4: "discard subtrees with no effector descendants").
pub fn build_shadow_tree(
    skeleton: &dyn SkeletonProvider,
    effector_ids: &HashSet<usize>,
    effector_map: &std::collections::HashMap<usize, Rc<Effector>>,
) -> Vec<Rc<IkBone>> {
    skeleton
        .parentless_bones()
        .into_iter()
        .filter_map(|root_id| build_subtree(skeleton, root_id, None, effector_ids, effector_map))
        .collect()
}

fn build_subtree(
    skeleton: &dyn SkeletonProvider,
    id: usize,
    parent: Option<&Rc<IkBone>>,
    effector_ids: &HashSet<usize>,
    effector_map: &std::collections::HashMap<usize, Rc<Effector>>,
) -> Option<Rc<IkBone>> {
    if !has_effector_descendant(skeleton, id, effector_ids) {
        return None;
    }

    let bone = IkBone::new(id, parent);
    bone.godot_skeleton_aligned.set_local(skeleton.bone_pose(id));
    if let Some(effector) = effector_map.get(&id) {
        effector.bind_bone(&bone);
        bone.set_effector(Rc::clone(effector));
    }

    let mut centroid = Vec3::ZERO;
    let mut count = 0;
    for child_id in skeleton.bone_children(id) {
        if let Some(_child_bone) = build_subtree(skeleton, child_id, Some(&bone), effector_ids, effector_map) {
            centroid += skeleton.bone_pose(child_id).translation;
            count += 1;
        }
    }
    if count == 0 {
        // Leaf in the shadow tree (it must be an effector itself, per has_effector_descendant):
        // align toward the original skeleton's own child centroid, per spec.md §3.
        for child_id in skeleton.bone_children(id) {
            centroid += skeleton.bone_pose(child_id).translation;
            count += 1;
        }
    }
    bone.align_bone_direction(if count > 0 { centroid / count as f32 } else { -Vec3::Y });

    Some(bone)
}

fn has_effector_descendant(skeleton: &dyn SkeletonProvider, id: usize, effector_ids: &HashSet<usize>) -> bool {
    if effector_ids.contains(&id) {
        return true;
    }
    skeleton
        .bone_children(id)
        .iter()
        .any(|&c| has_effector_descendant(skeleton, c, effector_ids))
}

/// Build the segment forest over an already-constructed shadow tree (spec.md §4.4
/// "Segment generation").
pub fn build_segments(roots: &[Rc<IkBone>], stabilizing_passes: u32) -> Vec<BoneSegment> {
    roots.iter().map(|r| build_segment(Rc::clone(r), true, stabilizing_passes)).collect()
}

fn build_segment(root: Rc<IkBone>, is_root: bool, stabilizing_passes: u32) -> BoneSegment {
    let mut bones = vec![Rc::clone(&root)];
    let mut current = root;
    loop {
        if current.effector().is_some() {
            break;
        }
        let children = current.children();
        if children.len() != 1 {
            break;
        }
        current = children.into_iter().next().unwrap();
        bones.push(Rc::clone(&current));
    }
    let tip = current;
    let child_segments: Vec<BoneSegment> = tip
        .children()
        .into_iter()
        .map(|c| build_segment(c, false, stabilizing_passes))
        .collect();

    BoneSegment::new(bones, child_segments, is_root, stabilizing_passes)
}

/// Read-only per-segment diagnostics (spec.md §6 "Diagnostic surface").
#[derive(Debug, Clone)]
pub struct SegmentDiagnostic {
    pub root_bone_id: usize,
    pub tip_bone_id: usize,
    pub effector_bone_ids: Vec<usize>,
    pub rmsd_squared: f32,
}

impl BoneSegment {
    pub fn collect_diagnostics(&self, out: &mut Vec<SegmentDiagnostic>) {
        out.push(SegmentDiagnostic {
            root_bone_id: self.bones[0].bone_id,
            tip_bone_id: self.tip().bone_id,
            effector_bone_ids: self.effectors.iter().map(|se| se.effector.bone_id).collect(),
            rmsd_squared: self.last_rmsd_squared(),
        });
        for child in &self.child_segments {
            child.collect_diagnostics(out);
        }
    }
}

/// Flatten the shadow forest into a bone-id lookup, for the solver façade's pull/push steps.
pub fn flatten(roots: &[Rc<IkBone>]) -> std::collections::HashMap<usize, Rc<IkBone>> {
    fn walk(bone: &Rc<IkBone>, map: &mut std::collections::HashMap<usize, Rc<IkBone>>) {
        map.insert(bone.bone_id, Rc::clone(bone));
        for c in bone.children() {
            walk(&c, map);
        }
    }
    let mut map = std::collections::HashMap::new();
    for r in roots {
        walk(r, &mut map);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effector::AxisPriorities;
    use crate::skeleton::InMemorySkeleton;
    use std::collections::HashMap;

    fn chain_skeleton(n: usize) -> InMemorySkeleton {
        let mut sk = InMemorySkeleton::new();
        let mut parent = None;
        for _ in 0..n {
            parent = Some(sk.add_bone("b", parent, Rigid::new(Quat::IDENTITY, Vec3::Y)));
        }
        sk
    }

    #[test]
    fn single_chain_produces_one_segment() {
        let sk = chain_skeleton(3);
        let tip_id = 2;
        let effector = Rc::new(Effector::new(tip_id, 1.0, AxisPriorities::NONE, 0.0).unwrap());
        let mut effector_map = HashMap::new();
        effector_map.insert(tip_id, Rc::clone(&effector));
        let effector_ids: HashSet<usize> = [tip_id].into_iter().collect();

        let roots = build_shadow_tree(&sk, &effector_ids, &effector_map);
        assert_eq!(roots.len(), 1);
        let segments = build_segments(&roots, 0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].bones.len(), 3);
        assert!(segments[0].child_segments.is_empty());
        assert_eq!(segments[0].all_bone_ids().len(), 3);
    }

    #[test]
    fn branching_skeleton_produces_child_segments() {
        let mut sk = InMemorySkeleton::new();
        let root = sk.add_bone("root", None, Rigid::IDENTITY);
        let a1 = sk.add_bone("a1", Some(root), Rigid::new(Quat::IDENTITY, Vec3::Y));
        let a2 = sk.add_bone("a2", Some(a1), Rigid::new(Quat::IDENTITY, Vec3::Y));
        let b1 = sk.add_bone("b1", Some(root), Rigid::new(Quat::IDENTITY, Vec3::X));
        let b2 = sk.add_bone("b2", Some(b1), Rigid::new(Quat::IDENTITY, Vec3::X));

        let mut effector_map = HashMap::new();
        effector_map.insert(a2, Rc::new(Effector::new(a2, 1.0, AxisPriorities::NONE, 0.0).unwrap()));
        effector_map.insert(b2, Rc::new(Effector::new(b2, 1.0, AxisPriorities::NONE, 0.0).unwrap()));
        let effector_ids: HashSet<usize> = [a2, b2].into_iter().collect();

        let roots = build_shadow_tree(&sk, &effector_ids, &effector_map);
        assert_eq!(roots.len(), 1);
        let segments = build_segments(&roots, 0);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].bones.len(), 1); // just the root, which branches immediately
        assert_eq!(segments[0].child_segments.len(), 2);

        let all = segments[0].all_bone_ids();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn non_effector_subtree_is_discarded() {
        let mut sk = InMemorySkeleton::new();
        let root = sk.add_bone("root", None, Rigid::IDENTITY);
        let a1 = sk.add_bone("a1", Some(root), Rigid::new(Quat::IDENTITY, Vec3::Y));
        let _dead = sk.add_bone("dead", Some(root), Rigid::new(Quat::IDENTITY, Vec3::X));

        let mut effector_map = HashMap::new();
        effector_map.insert(a1, Rc::new(Effector::new(a1, 1.0, AxisPriorities::NONE, 0.0).unwrap()));
        let effector_ids: HashSet<usize> = [a1].into_iter().collect();

        let roots = build_shadow_tree(&sk, &effector_ids, &effector_map);
        let segments = build_segments(&roots, 0);
        assert_eq!(segments[0].all_bone_ids().len(), 2); // root + a1, "dead" excluded
    }
}
