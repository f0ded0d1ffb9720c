use crate::mask::MaskData;
use serde::{Deserialize, Serialize};

/// One click in normalized image coordinates.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct PointPayload {
    pub id: String,
    pub x: f64,
    pub y: f64,
    pub label: i32,
}

impl PointPayload {
    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.x) || !(0.0..=1.0).contains(&self.y) {
            return Err(format!(
                "point ({}, {}) is outside the normalized [0, 1] range",
                self.x, self.y
            ));
        }
        if self.label < 0 {
            return Err(format!("point label {} must be non-negative", self.label));
        }
        Ok(())
    }

    pub fn to_pixel(&self, width: u32, height: u32) -> (f32, f32) {
        (
            (self.x * width as f64) as f32,
            (self.y * height as f64) as f32,
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub last_timestamp: Option<f64>,
    pub last_source: Option<String>,
    pub frame_index: Option<u32>,
    pub object_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectPayload {
    pub object_id: Option<i64>,
    #[serde(default)]
    pub points: Vec<PointPayload>,
    pub meta: Option<ObjectMeta>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameMeta {
    pub point_count: u32,
    pub object_count: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictPayload {
    pub session_id: Option<String>,
    pub frame_index: Option<u32>,
    pub video_path: Option<String>,
    #[serde(default)]
    pub objects: Vec<ObjectPayload>,
    pub meta: Option<FrameMeta>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EncodedMask {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub data: MaskData,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectResult {
    pub object_id: i64,
    pub score: f32,
    pub mask: EncodedMask,
    pub meta: Option<ObjectMeta>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FrameResult {
    pub session_id: String,
    pub frame_index: u32,
    pub results: Vec<ObjectResult>,
    pub meta: Option<FrameMeta>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartSessionRequest {
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseSessionRequest {
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseSessionResponse {
    pub success: bool,
}
