use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::MessageError;

/// One independent data lane of the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Sensor,
    Pose,
    Image,
}

impl Category {
    /// Every category, in the order streams are started.
    pub const ALL: [Category; 3] = [Category::Sensor, Category::Pose, Category::Image];

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Sensor => "sensor",
            Category::Pose => "pose",
            Category::Image => "image",
        }
    }

    /// Name of the streaming operation serving this category.
    pub fn operation(self) -> &'static str {
        match self {
            Category::Sensor => "StreamSensorData",
            Category::Pose => "StreamRobotPose",
            Category::Image => "StreamImageData",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sensor" | "streamsensordata" => Ok(Category::Sensor),
            "pose" | "streamrobotpose" => Ok(Category::Pose),
            "image" | "streamimagedata" => Ok(Category::Image),
            _ => Err(MessageError::UnknownCategory(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_and_operations() {
        assert_eq!("sensor".parse::<Category>().unwrap(), Category::Sensor);
        assert_eq!(" Pose ".parse::<Category>().unwrap(), Category::Pose);
        assert_eq!(
            "StreamImageData".parse::<Category>().unwrap(),
            Category::Image
        );
        assert!(matches!(
            "lidar".parse::<Category>(),
            Err(MessageError::UnknownCategory(_))
        ));
    }

    #[test]
    fn serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Category::Image).unwrap(),
            "\"image\""
        );
        let all: Vec<&str> = Category::ALL.iter().map(|c| c.operation()).collect();
        assert_eq!(
            all,
            vec!["StreamSensorData", "StreamRobotPose", "StreamImageData"]
        );
    }
}
