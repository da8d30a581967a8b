//! Height geometry engine.
//!
//! Decomposes each pose into seven segments and calibrates them with the
//! reference scale. Two strategies are available:
//!
//! - **2D**: segments measured on truncated pixel coordinates.
//! - **3D**: the same pixel segments, each multiplied by the ratio of its
//!   normalized 3D length to its normalized 2D length, compensating for
//!   foreshortening of limbs that point toward or away from the camera.

use crate::config::ConfigError;
use crate::geometry::{segment_lengths, to_normalized_2d, to_normalized_3d, to_pixel};
use crate::landmarks::{BodyPart, Landmark, Pose, Skeleton};
use crate::types::{HeightEstimate, HeightReport};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// `cm_direct` and `cm_sum` closer than this are reported as consistent.
const CONSISTENCY_TOLERANCE_CM: f64 = 1e-2;
/// Projected segment lengths below this leave the 3D ratio at 1.
const MIN_PROJECTED_LENGTH: f64 = 1e-12;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeightError {
    #[error("pixel_per_cm must be positive, got {0}")]
    InvalidScale(f64),
    #[error("image dimensions must be positive, got {width}x{height}")]
    InvalidDimensions { width: f64, height: f64 },
    #[error("person {person}: landmark {part} missing or not finite")]
    MissingLandmark { person: usize, part: BodyPart },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GeometryMode {
    #[serde(rename = "2D")]
    TwoD,
    #[serde(rename = "3D")]
    ThreeD,
}

impl FromStr for GeometryMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "2D" => Ok(Self::TwoD),
            "3D" => Ok(Self::ThreeD),
            _ => Err(ConfigError::UnknownMode {
                setting: "geometry.mode",
                value: s.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for GeometryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::TwoD => "2D",
            Self::ThreeD => "3D",
        })
    }
}

/// What to do with a person whose landmarks are unusable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MalformedPosePolicy {
    /// Fail the whole frame.
    #[default]
    Abort,
    /// Drop the person and keep measuring the rest.
    Skip,
}

impl FromStr for MalformedPosePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "skip" => Ok(Self::Skip),
            _ => Err(ConfigError::UnknownMode {
                setting: "geometry.malformed_pose",
                value: s.to_string(),
            }),
        }
    }
}

/// Everything the engine needs for one frame.
#[derive(Debug, Clone, Copy)]
pub struct HeightInput<'a> {
    pub poses: &'a [Pose],
    pub img_width: f64,
    pub img_height: f64,
    pub pixel_per_cm: f64,
}

#[derive(Debug, Clone, Copy)]
pub struct HeightCalculator {
    mode: GeometryMode,
    policy: MalformedPosePolicy,
}

impl HeightCalculator {
    pub fn new(mode: GeometryMode, policy: MalformedPosePolicy) -> Self {
        Self { mode, policy }
    }

    pub fn mode(&self) -> GeometryMode {
        self.mode
    }

    /// Measure every pose in the frame.
    pub fn process(&self, input: &HeightInput<'_>) -> Result<HeightReport, HeightError> {
        if !(input.pixel_per_cm.is_finite() && input.pixel_per_cm > 0.0) {
            return Err(HeightError::InvalidScale(input.pixel_per_cm));
        }
        if !(input.img_width > 0.0 && input.img_height > 0.0) {
            return Err(HeightError::InvalidDimensions {
                width: input.img_width,
                height: input.img_height,
            });
        }

        let mut report = HeightReport::default();

        for (person, pose) in input.poses.iter().enumerate() {
            let skeleton = match Skeleton::from_pose(pose) {
                Ok(s) => s,
                Err(part) => match self.policy {
                    MalformedPosePolicy::Abort => {
                        return Err(HeightError::MissingLandmark { person, part })
                    }
                    MalformedPosePolicy::Skip => {
                        tracing::warn!(person, part = %part, "skipping person with malformed landmarks");
                        continue;
                    }
                },
            };

            let estimate = self.estimate(
                &skeleton,
                input.img_width,
                input.img_height,
                input.pixel_per_cm,
            );
            log_consistency(person, &estimate);
            report.push_person(person, estimate);
        }

        Ok(report)
    }

    /// Measure one person. `pixel_per_cm` must already be validated.
    pub fn estimate(
        &self,
        skeleton: &Skeleton<Landmark>,
        img_width: f64,
        img_height: f64,
        pixel_per_cm: f64,
    ) -> HeightEstimate {
        let pixels = segment_lengths(&skeleton.map(|lm| to_pixel(lm, img_width, img_height)));

        match self.mode {
            GeometryMode::TwoD => {
                let height_px: f64 = pixels.iter().sum();
                let cm_direct = height_px / pixel_per_cm;
                let cm_sum: f64 = pixels.iter().map(|d| d / pixel_per_cm).sum();
                HeightEstimate::from_parts(pixels, cm_direct, cm_sum)
            }
            GeometryMode::ThreeD => {
                let k = correction_ratios(skeleton);
                let corrected: [f64; 7] =
                    std::array::from_fn(|i| (pixels[i] / pixel_per_cm) * k[i]);
                let cm_direct: f64 = corrected.iter().sum();
                // Recalibrates segments that are already in centimetres.
                let cm_sum: f64 = corrected.iter().map(|d| d / pixel_per_cm).sum();
                HeightEstimate::from_parts(corrected, cm_direct, cm_sum)
            }
        }
    }
}

/// Per-segment ratio of normalized 3D length to normalized 2D length.
///
/// A segment with no measurable 2D extent keeps a ratio of 1.
pub fn correction_ratios(skeleton: &Skeleton<Landmark>) -> [f64; 7] {
    let flat = segment_lengths(&skeleton.map(to_normalized_2d));
    let deep = segment_lengths(&skeleton.map(to_normalized_3d));

    std::array::from_fn(|i| {
        if flat[i] > MIN_PROJECTED_LENGTH {
            deep[i] / flat[i]
        } else {
            1.0
        }
    })
}

fn log_consistency(person: usize, estimate: &HeightEstimate) {
    if estimate.diff < CONSISTENCY_TOLERANCE_CM {
        tracing::debug!(
            person,
            cm_direct = estimate.cm_direct,
            cm_sum = estimate.cm_sum,
            diff = estimate.diff,
            "height estimate consistent"
        );
    } else {
        tracing::warn!(
            person,
            cm_direct = estimate.cm_direct,
            cm_sum = estimate.cm_sum,
            diff = estimate.diff,
            "height estimate inconsistent between direct and summed calibration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::landmarks::POSE_LANDMARK_COUNT;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const W: f64 = 1024.0;
    const H: f64 = 1024.0;

    /// Straight-standing pose placed on exact pixel positions of a 1024x1024 frame.
    fn canonical_pose(z: f64) -> Pose {
        let mut lms = vec![Landmark::new(0.5, 0.5, z); POSE_LANDMARK_COUNT];
        let mut set = |part: BodyPart, x: f64, y: f64| {
            lms[part.index()] = Landmark::new(x / W, y / H, z);
        };
        set(BodyPart::Nose, 512.0, 100.0);
        set(BodyPart::MouthLeft, 532.0, 120.0);
        set(BodyPart::MouthRight, 492.0, 120.0);
        set(BodyPart::LeftShoulder, 612.0, 200.0);
        set(BodyPart::RightShoulder, 412.0, 200.0);
        set(BodyPart::LeftHip, 562.0, 500.0);
        set(BodyPart::RightHip, 462.0, 500.0);
        set(BodyPart::LeftKnee, 562.0, 720.0);
        set(BodyPart::LeftAnkle, 562.0, 930.0);
        set(BodyPart::LeftHeel, 552.0, 950.0);
        set(BodyPart::LeftFootIndex, 612.0, 950.0);
        Pose::new(lms)
    }

    fn random_pose(rng: &mut StdRng, fixed_z: Option<f64>) -> Pose {
        Pose::new(
            (0..POSE_LANDMARK_COUNT)
                .map(|_| {
                    let z = fixed_z.unwrap_or_else(|| rng.gen_range(-0.5..0.5));
                    Landmark::new(rng.gen_range(0.05..0.95), rng.gen_range(0.05..0.95), z)
                })
                .collect(),
        )
    }

    fn run(mode: GeometryMode, poses: &[Pose], w: f64, h: f64, ppcm: f64) -> HeightReport {
        HeightCalculator::new(mode, MalformedPosePolicy::Abort)
            .process(&HeightInput {
                poses,
                img_width: w,
                img_height: h,
                pixel_per_cm: ppcm,
            })
            .unwrap()
    }

    #[test]
    fn test_canonical_pose_2d_matches_hand_computation() {
        let report = run(GeometryMode::TwoD, &[canonical_pose(0.0)], W, H, 5.0);

        // ankle-heel-foot, knee-ankle, hip-knee, shoulder-hip,
        // mouth-shoulder, nose-mouth, head-top
        let expected = [20.0, 210.0, 220.0, 300.0, 80.0, 20.0, 3.236 * 20.0];
        for (got, want) in report.distances[0].iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-4, "{got} vs {want}");
        }

        let total_cm = expected.iter().sum::<f64>() / 5.0;
        assert!((report.heights[0] - total_cm).abs() < 1e-4);
        assert!((report.cm_direct[0] - total_cm).abs() < 1e-4);
        assert!((report.cm_sum[0] - total_cm).abs() < 1e-4);
        assert!(report.diffs[0] < 1e-6);
    }

    #[test]
    fn test_2d_direct_and_sum_agree_for_random_poses() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let pose = random_pose(&mut rng, None);
            let w = rng.gen_range(200.0..4000.0f64).floor();
            let h = rng.gen_range(200.0..4000.0f64).floor();
            let ppcm = rng.gen_range(0.5..20.0);
            let report = run(GeometryMode::TwoD, &[pose], w, h, ppcm);
            assert!(
                report.diffs[0] < 1e-6,
                "cm_direct {} vs cm_sum {}",
                report.cm_direct[0],
                report.cm_sum[0]
            );
        }
    }

    #[test]
    fn test_3d_with_flat_depth_matches_2d() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut poses = vec![canonical_pose(0.3)];
        poses.extend((0..100).map(|_| random_pose(&mut rng, Some(-0.2))));

        let flat = run(GeometryMode::TwoD, &poses, 1920.0, 1080.0, 4.0);
        let deep = run(GeometryMode::ThreeD, &poses, 1920.0, 1080.0, 4.0);

        for (person, pose) in poses.iter().enumerate() {
            let skeleton = Skeleton::from_pose(pose).unwrap();
            for k in correction_ratios(&skeleton) {
                assert!(k.is_finite());
                assert!((k - 1.0).abs() < 1e-6, "person {person}: k = {k}");
            }
            assert!(
                (flat.cm_direct[person] - deep.cm_direct[person]).abs() < 1e-6,
                "person {person}: 2D {} vs 3D {}",
                flat.cm_direct[person],
                deep.cm_direct[person]
            );
            assert!((deep.cm_sum[person] - deep.cm_direct[person] / 4.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_3d_cm_sum_divides_corrected_segments_by_scale() {
        let mut pose = canonical_pose(0.0);
        pose.landmarks[BodyPart::LeftKnee.index()].z = -0.3;
        let report = run(GeometryMode::ThreeD, &[pose], W, H, 5.0);

        let expected_sum: f64 = report.distances[0].iter().map(|d| d / 5.0).sum();
        assert!((report.cm_sum[0] - expected_sum).abs() < 1e-9);
        assert!((report.cm_sum[0] - report.cm_direct[0] / 5.0).abs() < 1e-9);
        assert!((report.diffs[0] - (report.cm_direct[0] - report.cm_sum[0])).abs() < 1e-9);
        assert!(report.diffs[0] > 100.0);
    }

    #[test]
    fn test_3d_ratio_lengthens_foreshortened_limb() {
        let mut pose = canonical_pose(0.0);
        // Knee 0.3 units closer to the camera than the ankle.
        pose.landmarks[BodyPart::LeftKnee.index()].z = -0.3;
        let skeleton = Skeleton::from_pose(&pose).unwrap();

        let k = correction_ratios(&skeleton);
        let dy = 210.0 / H;
        let expected = (dy * dy + 0.09f64).sqrt() / dy;
        assert!((k[1] - expected).abs() < 1e-9, "{} vs {expected}", k[1]);

        let flat = run(GeometryMode::TwoD, &[pose.clone()], W, H, 5.0);
        let deep = run(GeometryMode::ThreeD, &[pose], W, H, 5.0);
        let flat_knee_cm = flat.distances[0][1] / 5.0;
        assert!((deep.distances[0][1] - flat_knee_cm * expected).abs() < 1e-6);
        assert!(deep.cm_direct[0] > flat.cm_direct[0]);
    }

    #[test]
    fn test_3d_degenerate_segment_ratio_is_one() {
        let mut pose = canonical_pose(0.0);
        // Nose on the mouth line: nose-mouth and head-top segments vanish in 2D.
        pose.landmarks[BodyPart::Nose.index()] = Landmark::new(512.0 / W, 120.0 / H, 0.2);
        let skeleton = Skeleton::from_pose(&pose).unwrap();
        let k = correction_ratios(&skeleton);
        assert_eq!(k[5], 1.0);
        assert_eq!(k[6], 1.0);
    }

    #[test]
    fn test_zero_scale_rejected() {
        let calc = HeightCalculator::new(GeometryMode::TwoD, MalformedPosePolicy::Abort);
        let err = calc
            .process(&HeightInput {
                poses: &[canonical_pose(0.0)],
                img_width: W,
                img_height: H,
                pixel_per_cm: 0.0,
            })
            .unwrap_err();
        assert_eq!(err, HeightError::InvalidScale(0.0));
    }

    #[test]
    fn test_zero_dimensions_rejected() {
        let calc = HeightCalculator::new(GeometryMode::ThreeD, MalformedPosePolicy::Abort);
        let err = calc
            .process(&HeightInput {
                poses: &[],
                img_width: 0.0,
                img_height: H,
                pixel_per_cm: 1.0,
            })
            .unwrap_err();
        assert!(matches!(err, HeightError::InvalidDimensions { .. }));
    }

    #[test]
    fn test_missing_landmark_aborts_batch() {
        let truncated = Pose::new(canonical_pose(0.0).landmarks[..20].to_vec());
        let calc = HeightCalculator::new(GeometryMode::TwoD, MalformedPosePolicy::Abort);
        let err = calc
            .process(&HeightInput {
                poses: &[canonical_pose(0.0), truncated],
                img_width: W,
                img_height: H,
                pixel_per_cm: 5.0,
            })
            .unwrap_err();
        assert_eq!(
            err,
            HeightError::MissingLandmark {
                person: 1,
                part: BodyPart::LeftHip
            }
        );
    }

    #[test]
    fn test_missing_landmark_skip_policy() {
        let truncated = Pose::new(canonical_pose(0.0).landmarks[..20].to_vec());
        let calc = HeightCalculator::new(GeometryMode::TwoD, MalformedPosePolicy::Skip);
        let report = calc
            .process(&HeightInput {
                poses: &[truncated, canonical_pose(0.0)],
                img_width: W,
                img_height: H,
                pixel_per_cm: 5.0,
            })
            .unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report.persons, vec![1]);
    }

    #[test]
    fn test_no_poses_gives_empty_report() {
        assert!(run(GeometryMode::ThreeD, &[], W, H, 5.0).is_empty());
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("2d".parse::<GeometryMode>().unwrap(), GeometryMode::TwoD);
        assert_eq!(" 3D ".parse::<GeometryMode>().unwrap(), GeometryMode::ThreeD);
        assert!("4D".parse::<GeometryMode>().is_err());
        assert_eq!("SKIP".parse::<MalformedPosePolicy>().unwrap(), MalformedPosePolicy::Skip);
    }
}
