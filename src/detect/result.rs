use serde::{Deserialize, Serialize};

/// One bounding box returned by the detection service.
///
/// Coordinates are in source-pixel space of the submitted image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    /// 0..1
    pub confidence: f32,
    pub class_id: i32,
    pub class_name: String,
}

/// Body of a detect response.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DetectResponse {
    #[serde(default)]
    pub detections: Vec<Detection>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_service_response() -> anyhow::Result<()> {
        let body = r#"{"detections":[{"x1":10.0,"y1":20.0,"x2":110.0,"y2":70.0,
            "confidence":0.91,"class_id":0,"class_name":"person"}]}"#;
        let parsed: DetectResponse = serde_json::from_str(body)?;
        assert_eq!(parsed.detections.len(), 1);
        let det = &parsed.detections[0];
        assert_eq!(det.class_name, "person");
        assert_eq!((det.x1, det.y1, det.x2, det.y2), (10.0, 20.0, 110.0, 70.0));
        assert!((det.confidence - 0.91).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn missing_detections_is_empty() -> anyhow::Result<()> {
        let parsed: DetectResponse = serde_json::from_str("{}")?;
        assert!(parsed.detections.is_empty());
        Ok(())
    }
}
