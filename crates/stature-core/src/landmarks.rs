//! Pose landmark model and the named body-part table.
//!
//! Landmarks follow the 33-point BlazePose topology. Geometry code never
//! indexes a pose by number; it goes through [`BodyPart`] instead.

use serde::{Deserialize, Serialize};

/// Number of landmarks in a full pose.
pub const POSE_LANDMARK_COUNT: usize = 33;

/// A normalized landmark: `x`, `y` relative to image width/height, `z` relative depth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub z: f64,
}

impl Landmark {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Body parts of the 33-point pose topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum BodyPart {
    Nose = 0,
    LeftEyeInner = 1,
    LeftEye = 2,
    LeftEyeOuter = 3,
    RightEyeInner = 4,
    RightEye = 5,
    RightEyeOuter = 6,
    LeftEar = 7,
    RightEar = 8,
    MouthLeft = 9,
    MouthRight = 10,
    LeftShoulder = 11,
    RightShoulder = 12,
    LeftElbow = 13,
    RightElbow = 14,
    LeftWrist = 15,
    RightWrist = 16,
    LeftPinky = 17,
    RightPinky = 18,
    LeftIndex = 19,
    RightIndex = 20,
    LeftThumb = 21,
    RightThumb = 22,
    LeftHip = 23,
    RightHip = 24,
    LeftKnee = 25,
    RightKnee = 26,
    LeftAnkle = 27,
    RightAnkle = 28,
    LeftHeel = 29,
    RightHeel = 30,
    LeftFootIndex = 31,
    RightFootIndex = 32,
}

impl BodyPart {
    /// The eleven parts the height decomposition reads.
    pub const REQUIRED: [BodyPart; 11] = [
        BodyPart::Nose,
        BodyPart::MouthLeft,
        BodyPart::MouthRight,
        BodyPart::LeftShoulder,
        BodyPart::RightShoulder,
        BodyPart::LeftHip,
        BodyPart::RightHip,
        BodyPart::LeftKnee,
        BodyPart::LeftAnkle,
        BodyPart::LeftHeel,
        BodyPart::LeftFootIndex,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Nose => "nose",
            Self::LeftEyeInner => "left_eye_inner",
            Self::LeftEye => "left_eye",
            Self::LeftEyeOuter => "left_eye_outer",
            Self::RightEyeInner => "right_eye_inner",
            Self::RightEye => "right_eye",
            Self::RightEyeOuter => "right_eye_outer",
            Self::LeftEar => "left_ear",
            Self::RightEar => "right_ear",
            Self::MouthLeft => "mouth_left",
            Self::MouthRight => "mouth_right",
            Self::LeftShoulder => "left_shoulder",
            Self::RightShoulder => "right_shoulder",
            Self::LeftElbow => "left_elbow",
            Self::RightElbow => "right_elbow",
            Self::LeftWrist => "left_wrist",
            Self::RightWrist => "right_wrist",
            Self::LeftPinky => "left_pinky",
            Self::RightPinky => "right_pinky",
            Self::LeftIndex => "left_index",
            Self::RightIndex => "right_index",
            Self::LeftThumb => "left_thumb",
            Self::RightThumb => "right_thumb",
            Self::LeftHip => "left_hip",
            Self::RightHip => "right_hip",
            Self::LeftKnee => "left_knee",
            Self::RightKnee => "right_knee",
            Self::LeftAnkle => "left_ankle",
            Self::RightAnkle => "right_ankle",
            Self::LeftHeel => "left_heel",
            Self::RightHeel => "right_heel",
            Self::LeftFootIndex => "left_foot_index",
            Self::RightFootIndex => "right_foot_index",
        }
    }
}

impl std::fmt::Display for BodyPart {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.index())
    }
}

/// The seven anthropometric segments, in summation order (feet up).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BodySegment {
    AnkleHeelFoot,
    KneeAnkle,
    HipKnee,
    ShoulderHip,
    MouthShoulder,
    NoseMouth,
    HeadTop,
}

impl BodySegment {
    pub const ALL: [BodySegment; 7] = [
        BodySegment::AnkleHeelFoot,
        BodySegment::KneeAnkle,
        BodySegment::HipKnee,
        BodySegment::ShoulderHip,
        BodySegment::MouthShoulder,
        BodySegment::NoseMouth,
        BodySegment::HeadTop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::AnkleHeelFoot => "ankle_heel_foot",
            Self::KneeAnkle => "knee_ankle",
            Self::HipKnee => "hip_knee",
            Self::ShoulderHip => "shoulder_hip",
            Self::MouthShoulder => "mouth_shoulder",
            Self::NoseMouth => "nose_mouth",
            Self::HeadTop => "head_top",
        }
    }
}

/// One person's landmarks, ordered by [`BodyPart`] index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pose {
    pub landmarks: Vec<Landmark>,
}

impl Pose {
    pub fn new(landmarks: Vec<Landmark>) -> Self {
        Self { landmarks }
    }

    pub fn get(&self, part: BodyPart) -> Option<&Landmark> {
        self.landmarks.get(part.index())
    }

    pub fn len(&self) -> usize {
        self.landmarks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.landmarks.is_empty()
    }
}

/// The eleven points the segment formulas consume, in any coordinate space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Skeleton<P> {
    pub nose: P,
    pub mouth_left: P,
    pub mouth_right: P,
    pub shoulder_left: P,
    pub shoulder_right: P,
    pub hip_left: P,
    pub hip_right: P,
    pub knee: P,
    pub ankle: P,
    pub heel: P,
    pub foot_index: P,
}

impl Skeleton<Landmark> {
    /// Pull the required landmarks out of a pose.
    ///
    /// Returns the first missing or non-finite part on failure.
    pub fn from_pose(pose: &Pose) -> Result<Self, BodyPart> {
        let get = |part: BodyPart| match pose.get(part) {
            Some(lm) if lm.is_finite() => Ok(*lm),
            _ => Err(part),
        };

        Ok(Self {
            nose: get(BodyPart::Nose)?,
            mouth_left: get(BodyPart::MouthLeft)?,
            mouth_right: get(BodyPart::MouthRight)?,
            shoulder_left: get(BodyPart::LeftShoulder)?,
            shoulder_right: get(BodyPart::RightShoulder)?,
            hip_left: get(BodyPart::LeftHip)?,
            hip_right: get(BodyPart::RightHip)?,
            knee: get(BodyPart::LeftKnee)?,
            ankle: get(BodyPart::LeftAnkle)?,
            heel: get(BodyPart::LeftHeel)?,
            foot_index: get(BodyPart::LeftFootIndex)?,
        })
    }
}

impl<P: Copy> Skeleton<P> {
    pub fn map<Q>(&self, f: impl Fn(P) -> Q) -> Skeleton<Q> {
        Skeleton {
            nose: f(self.nose),
            mouth_left: f(self.mouth_left),
            mouth_right: f(self.mouth_right),
            shoulder_left: f(self.shoulder_left),
            shoulder_right: f(self.shoulder_right),
            hip_left: f(self.hip_left),
            hip_right: f(self.hip_right),
            knee: f(self.knee),
            ankle: f(self.ankle),
            heel: f(self.heel),
            foot_index: f(self.foot_index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn indexed_pose(n: usize) -> Pose {
        Pose::new((0..n).map(|i| Landmark::new(i as f64, 0.0, 0.0)).collect())
    }

    #[test]
    fn test_required_indices_match_topology() {
        let indices: Vec<usize> = BodyPart::REQUIRED.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![0, 9, 10, 11, 12, 23, 24, 25, 27, 29, 31]);
        assert_eq!(BodyPart::RightFootIndex.index(), POSE_LANDMARK_COUNT - 1);
    }

    #[test]
    fn test_skeleton_from_full_pose() {
        let pose = indexed_pose(POSE_LANDMARK_COUNT);
        let s = Skeleton::from_pose(&pose).unwrap();
        assert_eq!(s.nose.x, 0.0);
        assert_eq!(s.mouth_right.x, 10.0);
        assert_eq!(s.hip_right.x, 24.0);
        assert_eq!(s.foot_index.x, 31.0);
    }

    #[test]
    fn test_skeleton_reports_missing_part() {
        // 30 landmarks: index 30 onward missing, so the left foot index is absent.
        let pose = indexed_pose(30);
        assert_eq!(Skeleton::from_pose(&pose), Err(BodyPart::LeftFootIndex));
    }

    #[test]
    fn test_skeleton_rejects_non_finite() {
        let mut pose = indexed_pose(POSE_LANDMARK_COUNT);
        pose.landmarks[BodyPart::LeftKnee.index()].y = f64::NAN;
        assert_eq!(Skeleton::from_pose(&pose), Err(BodyPart::LeftKnee));
    }

    #[test]
    fn test_pose_deserializes_without_z() {
        let pose: Pose = serde_json::from_str(r#"[{"x": 0.5, "y": 0.25}]"#).unwrap();
        assert_eq!(pose.landmarks, vec![Landmark::new(0.5, 0.25, 0.0)]);
    }

    #[test]
    fn test_segment_order() {
        let names: Vec<&str> = BodySegment::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(names.first(), Some(&"ankle_heel_foot"));
        assert_eq!(names.last(), Some(&"head_top"));
    }
}
