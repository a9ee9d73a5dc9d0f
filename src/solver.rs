//! The solver façade (spec.md §3 "Solver state", §4.5).
//!
//! Owns the shadow forest and segment tree, drives the outer iteration count, and maps
//! skeleton poses to and from the shadow tree at frame boundaries. Configuration is a plain
//! `serde`-derived struct, matching the teacher's `RotationAnimationClipJson` convention.

use crate::bone::IkBone;
use crate::effector::{AxisPriorities, Effector};
use crate::error::{IkError, IkResult};
use crate::kusudama::{Kusudama, OpenCone};
use crate::qcp::Qcp;
use crate::segment::{self, BoneSegment, SegmentDiagnostic};
use crate::skeleton::{GoalSource, SkeletonProvider};
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::f32::consts::PI;
use std::rc::Rc;

/// A single swing cone in a bone's configuration (spec.md §6).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConeConfig {
    pub cone_center: Vec3,
    pub cone_radius: f32,
    #[serde(default = "default_cushion")]
    pub cushion: f32,
}

fn default_cushion() -> f32 {
    1.0
}

/// Per-bone twist-and-swing configuration (spec.md §6).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BoneConstraintConfig {
    #[serde(default)]
    pub twist_min: f32,
    #[serde(default)]
    pub twist_range: f32,
    #[serde(default)]
    pub axially_constrained: bool,
    #[serde(default)]
    pub cones: Vec<ConeConfig>,
    #[serde(default)]
    pub orientationally_constrained: bool,
    #[serde(default)]
    pub resistance: f32,
    #[serde(default)]
    pub damp: Option<f32>,
}

/// Per-effector configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectorConfig {
    pub bone_name: String,
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub direction_priorities: (f32, f32, f32),
    #[serde(default)]
    pub passthrough_factor: f32,
}

fn default_weight() -> f32 {
    1.0
}

/// Solver-wide configuration (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    #[serde(default = "default_iterations")]
    pub iterations_per_frame: u32,
    #[serde(default = "default_damp")]
    pub default_damp: f32,
    #[serde(default)]
    pub stabilization_passes: u32,
    #[serde(default)]
    pub constraint_mode: bool,
}

fn default_iterations() -> u32 {
    15
}

fn default_damp() -> f32 {
    PI / 2.0
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            iterations_per_frame: default_iterations(),
            default_damp: default_damp(),
            stabilization_passes: 0,
            constraint_mode: false,
        }
    }
}

impl SolverConfig {
    fn validate(&self) -> IkResult<()> {
        if self.iterations_per_frame == 0 {
            return Err(IkError::OutOfRangeConfig("iterations_per_frame must be >= 1".into()));
        }
        if !(self.default_damp > 0.0 && self.default_damp <= PI) {
            return Err(IkError::OutOfRangeConfig(format!(
                "default_damp {} outside (0, pi]",
                self.default_damp
            )));
        }
        Ok(())
    }
}

/// A host-persistable snapshot of a solver's full configuration (spec.md §6's "opaque
/// configuration blob"), matching the teacher's `RotationAnimationClipJson` convention:
/// a plain `#[serde(default)]`-heavy struct round-tripped through `serde_json`, not a
/// realtime wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigBundle {
    pub solver: SolverConfig,
    #[serde(default)]
    pub effectors: Vec<EffectorConfig>,
    #[serde(default)]
    pub bone_constraints: HashMap<String, BoneConstraintConfig>,
}

/// Owns the shadow forest, the segment tree, and the bone-id -> IK-bone map; the single
/// entry point a host drives once per frame.
pub struct Solver {
    config: SolverConfig,
    qcp: Qcp,
    bone_configs: HashMap<String, BoneConstraintConfig>,
    effector_configs: Vec<EffectorConfig>,

    roots: Vec<Rc<IkBone>>,
    bones: HashMap<usize, Rc<IkBone>>,
    segments: Vec<BoneSegment>,
    dirty: bool,
}

impl Solver {
    pub fn new(config: SolverConfig) -> IkResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            qcp: Qcp::default(),
            bone_configs: HashMap::new(),
            effector_configs: Vec::new(),
            roots: Vec::new(),
            bones: HashMap::new(),
            segments: Vec::new(),
            dirty: true,
        })
    }

    pub fn set_config(&mut self, config: SolverConfig) -> IkResult<()> {
        config.validate()?;
        self.config = config;
        self.dirty = true;
        Ok(())
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Register (or replace) a goal-bearing bone. Marks the solver dirty so the next `solve`
    /// rebuilds the shadow forest.
    pub fn add_effector(&mut self, config: EffectorConfig) -> IkResult<()> {
        if !(0.0..=1.0).contains(&config.weight) {
            return Err(IkError::OutOfRangeConfig(format!("effector weight {} outside [0, 1]", config.weight)));
        }
        if !(0.0..=1.0).contains(&config.passthrough_factor) {
            return Err(IkError::OutOfRangeConfig(format!(
                "effector passthrough_factor {} outside [0, 1]",
                config.passthrough_factor
            )));
        }
        self.effector_configs.retain(|e| e.bone_name != config.bone_name);
        self.effector_configs.push(config);
        self.dirty = true;
        Ok(())
    }

    pub fn remove_effector(&mut self, bone_name: &str) {
        self.effector_configs.retain(|e| e.bone_name != bone_name);
        self.dirty = true;
    }

    /// Set (or replace) a bone's twist/swing configuration. Marks the solver dirty.
    pub fn set_bone_constraint(&mut self, bone_name: impl Into<String>, config: BoneConstraintConfig) -> IkResult<()> {
        if !(0.0..=2.0 * PI).contains(&config.twist_range) {
            return Err(IkError::OutOfRangeConfig(format!(
                "twist_range {} outside [0, 2*pi]",
                config.twist_range
            )));
        }
        for cone in &config.cones {
            if !(0.0..=PI).contains(&cone.cone_radius) {
                return Err(IkError::OutOfRangeConfig(format!(
                    "cone radius {} outside [0, pi]",
                    cone.cone_radius
                )));
            }
        }
        self.bone_configs.insert(bone_name.into(), config);
        self.dirty = true;
        Ok(())
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Snapshot the solver-wide config, registered effectors, and per-bone constraints into
    /// one serializable bundle (spec.md §6).
    pub fn config_bundle(&self) -> ConfigBundle {
        ConfigBundle {
            solver: self.config.clone(),
            effectors: self.effector_configs.clone(),
            bone_constraints: self.bone_configs.clone(),
        }
    }

    /// Serialize the current configuration as pretty-printed JSON.
    pub fn to_json(&self) -> IkResult<String> {
        serde_json::to_string_pretty(&self.config_bundle())
            .map_err(|e| IkError::Serialization(e.to_string()))
    }

    /// Rebuild a solver from a previously serialized `to_json` bundle. Per-bone/effector
    /// entries that fail their own validation are skipped rather than rejecting the whole
    /// bundle (spec.md §7 `OutOfRangeConfig`: clamp at the setter, never fail the host).
    pub fn from_json(json: &str) -> IkResult<Self> {
        let bundle: ConfigBundle =
            serde_json::from_str(json).map_err(|e| IkError::Serialization(e.to_string()))?;
        let mut solver = Self::new(bundle.solver)?;
        for effector in bundle.effectors {
            let _ = solver.add_effector(effector);
        }
        for (bone_name, constraint) in bundle.bone_constraints {
            let _ = solver.set_bone_constraint(bone_name, constraint);
        }
        Ok(solver)
    }

    /// Per-frame protocol (spec.md §4.5). A no-op, silently, if no effectors are configured or
    /// the skeleton is empty (spec.md §7 `Unconfigured`).
    pub fn solve(&mut self, skeleton: &mut dyn SkeletonProvider, goals: &dyn GoalSource) -> Vec<SegmentDiagnostic> {
        if skeleton.bone_count() == 0 || self.effector_configs.is_empty() {
            return Vec::new();
        }

        if self.dirty {
            self.rebuild(skeleton);
        }
        if self.segments.is_empty() {
            return Vec::new();
        }

        for (&id, bone) in &self.bones {
            bone.godot_skeleton_aligned.set_local(skeleton.bone_pose(id));
        }

        for bone in self.bones.values() {
            if let Some(effector) = bone.effector() {
                if let Some(goal) = goals.goal_pose(bone.bone_id) {
                    effector.set_target_global_transform(goal);
                }
            }
        }

        for _ in 0..self.config.iterations_per_frame {
            for segment in &self.segments {
                segment.solve(&self.qcp, self.config.default_damp, self.config.constraint_mode);
            }
        }

        for (&id, bone) in &self.bones {
            skeleton.set_bone_pose(id, bone.godot_skeleton_aligned.get_local());
        }

        let mut diagnostics = Vec::new();
        for segment in &self.segments {
            segment.collect_diagnostics(&mut diagnostics);
        }
        diagnostics
    }

    fn rebuild(&mut self, skeleton: &dyn SkeletonProvider) {
        let mut effector_map: HashMap<usize, Rc<Effector>> = HashMap::new();
        for cfg in &self.effector_configs {
            let Some(bone_id) = skeleton.find_bone(&cfg.bone_name) else {
                continue;
            };
            let priorities = AxisPriorities::new(
                cfg.direction_priorities.0,
                cfg.direction_priorities.1,
                cfg.direction_priorities.2,
            )
            .unwrap_or(AxisPriorities::NONE);
            if let Ok(effector) = Effector::new(bone_id, cfg.weight, priorities, cfg.passthrough_factor) {
                effector_map.insert(bone_id, Rc::new(effector));
            }
        }
        let effector_ids: HashSet<usize> = effector_map.keys().copied().collect();

        let roots = segment::build_shadow_tree(skeleton, &effector_ids, &effector_map);
        let bones = segment::flatten(&roots);

        for (name, cfg) in &self.bone_configs {
            let Some(bone_id) = skeleton.find_bone(name) else {
                continue;
            };
            let Some(bone) = bones.get(&bone_id) else {
                continue;
            };
            let mut kusudama = Kusudama::new();
            let cones: Vec<OpenCone> = cfg
                .cones
                .iter()
                .map(|c| OpenCone::new(c.cone_center, c.cone_radius).with_cushion(c.cushion))
                .collect();
            if kusudama.set_cones(cones).is_err() {
                continue;
            }
            if kusudama.set_twist_range(cfg.twist_min, cfg.twist_range).is_err() {
                continue;
            }
            kusudama.orientationally_constrained = cfg.orientationally_constrained;
            kusudama.axially_constrained = cfg.axially_constrained;
            kusudama.resistance = cfg.resistance.clamp(0.0, 1.0);
            bone.set_constraint(kusudama);
            if let Some(damp) = cfg.damp {
                let _ = bone.set_damp(damp);
            }
        }

        for bone in bones.values() {
            bone.rebuild_cos_half_returnful(self.config.iterations_per_frame as usize);
        }

        self.segments = segment::build_segments(&roots, self.config.stabilization_passes);
        self.roots = roots;
        self.bones = bones;
        self.dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{InMemorySkeleton, StaticGoals};
    use crate::transform::Rigid;
    use glam::Quat;

    fn three_bone_chain() -> InMemorySkeleton {
        let mut sk = InMemorySkeleton::new();
        let root = sk.add_bone("root", None, Rigid::new(Quat::IDENTITY, Vec3::ZERO));
        let mid = sk.add_bone("mid", Some(root), Rigid::new(Quat::IDENTITY, Vec3::Y));
        sk.add_bone("tip", Some(mid), Rigid::new(Quat::IDENTITY, Vec3::Y));
        sk
    }

    /// Scenario S1: single unconstrained chain, reachable goal.
    #[test]
    fn reaches_reachable_goal() {
        let mut sk = three_bone_chain();
        let tip = sk.find_bone("tip").unwrap();

        let mut solver = Solver::new(SolverConfig {
            iterations_per_frame: 10,
            ..Default::default()
        })
        .unwrap();
        solver
            .add_effector(EffectorConfig {
                bone_name: "tip".into(),
                weight: 1.0,
                direction_priorities: (0.0, 0.0, 0.0),
                passthrough_factor: 0.0,
            })
            .unwrap();

        let mut goals = StaticGoals::new();
        goals.set(tip, Rigid::new(Quat::IDENTITY, Vec3::new(1.0, 2.0, 0.0)));

        solver.solve(&mut sk, &goals);

        let tip_world = world_position(&sk, tip);
        assert!((tip_world - Vec3::new(1.0, 2.0, 0.0)).length() < 0.05, "tip = {tip_world:?}");
    }

    /// Scenario S5: identity input.
    #[test]
    fn rest_pose_with_matching_goal_stays_near_identity() {
        let mut sk = three_bone_chain();
        let tip = sk.find_bone("tip").unwrap();

        let mut solver = Solver::new(SolverConfig::default()).unwrap();
        solver
            .add_effector(EffectorConfig {
                bone_name: "tip".into(),
                weight: 1.0,
                direction_priorities: (0.0, 0.0, 0.0),
                passthrough_factor: 0.0,
            })
            .unwrap();

        let resting_tip = world_position(&sk, tip);
        let mut goals = StaticGoals::new();
        goals.set(tip, Rigid::new(Quat::IDENTITY, resting_tip));

        solver.solve(&mut sk, &goals);

        for id in 0..sk.bone_count() {
            let rot = sk.bone_pose(id).rotation;
            assert!(rot.angle_between(Quat::IDENTITY) < 1e-2, "bone {id} rotated by {}", rot.angle_between(Quat::IDENTITY));
        }
    }

    #[test]
    fn empty_effector_set_is_a_silent_noop() {
        let mut sk = three_bone_chain();
        let mut solver = Solver::new(SolverConfig::default()).unwrap();
        let goals = StaticGoals::new();
        let diagnostics = solver.solve(&mut sk, &goals);
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn out_of_range_config_is_rejected() {
        let mut solver = Solver::new(SolverConfig::default()).unwrap();
        let bad = BoneConstraintConfig {
            twist_range: 100.0,
            ..Default::default()
        };
        assert!(solver.set_bone_constraint("root", bad).is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut solver = Solver::new(SolverConfig {
            iterations_per_frame: 7,
            ..Default::default()
        })
        .unwrap();
        solver
            .add_effector(EffectorConfig {
                bone_name: "tip".into(),
                weight: 0.8,
                direction_priorities: (1.0, 0.0, 0.0),
                passthrough_factor: 0.1,
            })
            .unwrap();
        solver
            .set_bone_constraint(
                "mid",
                BoneConstraintConfig {
                    twist_min: -0.5,
                    twist_range: 1.0,
                    resistance: 0.5,
                    ..Default::default()
                },
            )
            .unwrap();

        let json = solver.to_json().unwrap();
        let restored = Solver::from_json(&json).unwrap();

        assert_eq!(restored.config().iterations_per_frame, 7);
        assert_eq!(restored.effector_configs.len(), 1);
        assert_eq!(restored.effector_configs[0].bone_name, "tip");
        assert!(restored.bone_configs.contains_key("mid"));
    }

    #[test]
    fn malformed_json_is_a_serialization_error() {
        assert!(matches!(Solver::from_json("not json"), Err(IkError::Serialization(_))));
    }

    #[test]
    fn zero_default_damp_is_rejected() {
        let zero_damp = SolverConfig {
            default_damp: 0.0,
            ..Default::default()
        };
        assert!(Solver::new(zero_damp).is_err(), "damp 0 would freeze every non-root bone silently");
    }

    fn y_shaped_skeleton() -> (InMemorySkeleton, usize, usize) {
        let mut sk = InMemorySkeleton::new();
        let root = sk.add_bone("root", None, Rigid::new(Quat::IDENTITY, Vec3::ZERO));
        let a1 = sk.add_bone("a1", Some(root), Rigid::new(Quat::IDENTITY, Vec3::Y));
        let a2 = sk.add_bone("a2", Some(a1), Rigid::new(Quat::IDENTITY, Vec3::Y));
        let b1 = sk.add_bone("b1", Some(root), Rigid::new(Quat::IDENTITY, Vec3::X));
        let b2 = sk.add_bone("b2", Some(b1), Rigid::new(Quat::IDENTITY, Vec3::X));
        (sk, a2, b2)
    }

    /// Scenario S2: a cone swing limit holds even starting from a 90-degree swing, well
    /// outside a pi/6 cone. The goal matches the tip's actual (swing-independent) position,
    /// so QCP has nothing to correct; only the swing clamp has work to do.
    #[test]
    fn kusudama_clamp_limits_swing_to_cone_radius() {
        let mut sk = three_bone_chain();
        let tip = sk.find_bone("tip").unwrap();

        sk.set_bone_pose(tip, Rigid::new(Quat::from_rotation_x(PI / 2.0), Vec3::Y));
        let tip_pos = world_position(&sk, tip);

        let mut solver = Solver::new(SolverConfig {
            iterations_per_frame: 10,
            ..Default::default()
        })
        .unwrap();
        solver
            .add_effector(EffectorConfig {
                bone_name: "tip".into(),
                weight: 1.0,
                direction_priorities: (0.0, 0.0, 0.0),
                passthrough_factor: 0.0,
            })
            .unwrap();
        solver
            .set_bone_constraint(
                "tip",
                BoneConstraintConfig {
                    orientationally_constrained: true,
                    cones: vec![ConeConfig {
                        cone_center: Vec3::Y,
                        cone_radius: PI / 6.0,
                        cushion: 1.0,
                    }],
                    ..Default::default()
                },
            )
            .unwrap();

        let mut goals = StaticGoals::new();
        goals.set(tip, Rigid::new(Quat::IDENTITY, tip_pos));
        solver.solve(&mut sk, &goals);

        let swung = sk.bone_pose(tip).rotation * Vec3::Y;
        assert!(
            swung.dot(Vec3::Y) >= (PI / 6.0).cos() - 1e-2,
            "swing escaped the cone: dot = {}",
            swung.dot(Vec3::Y)
        );
    }

    /// Scenario S3: a twist range holds even starting from a 90-degree twist about +Y, well
    /// outside a [-pi/4, pi/4] range. The goal matches the tip's actual position, so QCP has
    /// nothing to correct; only the twist clamp has work to do.
    #[test]
    fn twist_limit_clamps_large_required_twist() {
        let mut sk = three_bone_chain();
        let tip = sk.find_bone("tip").unwrap();

        sk.set_bone_pose(tip, Rigid::new(Quat::from_rotation_y(PI / 2.0), Vec3::Y));
        let tip_pos = world_position(&sk, tip);

        let mut solver = Solver::new(SolverConfig {
            iterations_per_frame: 10,
            ..Default::default()
        })
        .unwrap();
        solver
            .add_effector(EffectorConfig {
                bone_name: "tip".into(),
                weight: 1.0,
                direction_priorities: (0.0, 0.0, 0.0),
                passthrough_factor: 0.0,
            })
            .unwrap();
        solver
            .set_bone_constraint(
                "tip",
                BoneConstraintConfig {
                    axially_constrained: true,
                    twist_min: -PI / 4.0,
                    twist_range: PI / 2.0,
                    ..Default::default()
                },
            )
            .unwrap();

        let mut goals = StaticGoals::new();
        goals.set(tip, Rigid::new(Quat::IDENTITY, tip_pos));
        solver.solve(&mut sk, &goals);

        let local_rotation = sk.bone_pose(tip).rotation;
        let (_, twist) = crate::kusudama::swing_twist_decompose(local_rotation, Vec3::Y);
        let (axis, angle) = twist.to_axis_angle();
        let signed_twist = angle * axis.y.signum();
        assert!(signed_twist.abs() <= PI / 4.0 + 1e-2, "twist escaped its range: {signed_twist}");
    }

    /// Scenario S4: two effectors sharing a root converge together over 15 iterations, each
    /// landing substantially closer to its own goal than after a single iteration.
    #[test]
    fn two_effector_shared_ancestor_converges() {
        let (sk_template, a2, b2) = y_shaped_skeleton();
        let goal_a = Vec3::new(1.5, 1.0, 0.0);
        let goal_b = Vec3::new(0.0, 1.0, 1.5);
        let mut goals = StaticGoals::new();
        goals.set(a2, Rigid::new(Quat::IDENTITY, goal_a));
        goals.set(b2, Rigid::new(Quat::IDENTITY, goal_b));

        let deviation_after = |iterations: u32| {
            let mut sk = sk_template.clone();
            let mut solver = Solver::new(SolverConfig {
                iterations_per_frame: iterations,
                ..Default::default()
            })
            .unwrap();
            for name in ["a2", "b2"] {
                solver
                    .add_effector(EffectorConfig {
                        bone_name: name.into(),
                        weight: 1.0,
                        direction_priorities: (0.0, 0.0, 0.0),
                        passthrough_factor: 0.0,
                    })
                    .unwrap();
            }
            solver.solve(&mut sk, &goals);
            let da = (world_position(&sk, a2) - goal_a).length_squared();
            let db = (world_position(&sk, b2) - goal_b).length_squared();
            (da + db) / 2.0
        };

        let after_one = deviation_after(1);
        let after_many = deviation_after(15);
        assert!(
            after_many <= after_one * 0.7,
            "after_one={after_one}, after_many={after_many}"
        );
    }

    /// Property 8: the stabilization loop only ever accepts a pass that doesn't regress its
    /// own tracked deviation, reverting otherwise — so turning stabilization passes on never
    /// leaves the final pose farther from the goal than skipping them.
    #[test]
    fn stabilization_passes_never_increase_final_deviation() {
        let sk_template = three_bone_chain();
        let tip = sk_template.find_bone("tip").unwrap();
        let goal = Vec3::new(1.3, -0.4, 0.6);

        let deviation_with = |stabilization_passes: u32| {
            let mut sk = sk_template.clone();
            let mut solver = Solver::new(SolverConfig {
                iterations_per_frame: 1,
                stabilization_passes,
                ..Default::default()
            })
            .unwrap();
            solver
                .add_effector(EffectorConfig {
                    bone_name: "tip".into(),
                    weight: 1.0,
                    direction_priorities: (0.0, 0.0, 0.0),
                    passthrough_factor: 0.0,
                })
                .unwrap();
            let mut goals = StaticGoals::new();
            goals.set(tip, Rigid::new(Quat::IDENTITY, goal));
            solver.solve(&mut sk, &goals);
            (world_position(&sk, tip) - goal).length_squared()
        };

        let without_stabilization = deviation_with(0);
        let with_stabilization = deviation_with(4);
        assert!(with_stabilization <= without_stabilization + 1e-6);
    }

    fn world_position(sk: &InMemorySkeleton, id: usize) -> Vec3 {
        let mut transform = Rigid::IDENTITY;
        let mut chain = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            chain.push(c);
            cur = sk.bone_parent(c);
        }
        for &b in chain.iter().rev() {
            transform = transform.compose(&sk.bone_pose(b));
        }
        transform.translation
    }
}
