use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::category::Category;
use crate::error::{MessageError, Result};

/// One reading from a named sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor_id: String,
    #[serde(with = "json_f64")]
    pub value: f64,
    pub unit: String,
    /// Milliseconds since epoch, producer-assigned.
    pub timestamp: i64,
}

/// Robot position and heading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseUpdate {
    #[serde(with = "json_f64")]
    pub x: f64,
    #[serde(with = "json_f64")]
    pub y: f64,
    #[serde(with = "json_f64")]
    pub z: f64,
    /// Heading in degrees.
    #[serde(with = "json_f64")]
    pub orientation: f64,
    /// Milliseconds since epoch, producer-assigned.
    pub timestamp: i64,
}

/// One encoded image frame.
///
/// `data` travels as base64, so the encoded payload is about 4/3 of the raw
/// size plus the other fields. With the default 16 MiB frame cap the raw
/// image must stay under roughly 12 MiB; larger images are refused by
/// `send` with a payload-too-large error before anything is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageChunk {
    pub width: i32,
    pub height: i32,
    pub encoding: String,
    /// Raw image bytes; base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub data: Bytes,
    /// Milliseconds since epoch, producer-assigned.
    pub timestamp: i64,
}

/// A payload carried on a category stream.
///
/// Serializes with a `category` tag when it has to stand on its own (logs,
/// CLI output). On a stream the category is implied by the stream, so
/// [`PayloadFrame::encode`] writes only the inner message object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "category", rename_all = "lowercase")]
pub enum PayloadFrame {
    Sensor(SensorReading),
    Pose(PoseUpdate),
    Image(ImageChunk),
}

impl PayloadFrame {
    /// Category this payload belongs to.
    pub fn category(&self) -> Category {
        match self {
            PayloadFrame::Sensor(_) => Category::Sensor,
            PayloadFrame::Pose(_) => Category::Pose,
            PayloadFrame::Image(_) => Category::Image,
        }
    }

    /// Producer-assigned timestamp in milliseconds.
    pub fn timestamp(&self) -> i64 {
        match self {
            PayloadFrame::Sensor(reading) => reading.timestamp,
            PayloadFrame::Pose(pose) => pose.timestamp,
            PayloadFrame::Image(image) => image.timestamp,
        }
    }

    /// Human-readable confirmation sent back in the acknowledgement.
    pub fn confirmation(&self) -> String {
        match self {
            PayloadFrame::Sensor(reading) => {
                format!("Processed sensor data from {}", reading.sensor_id)
            }
            PayloadFrame::Pose(_) => "Processed robot pose data".to_string(),
            PayloadFrame::Image(_) => "Processed image data".to_string(),
        }
    }

    /// One-line description of what was received.
    pub fn summary(&self) -> String {
        match self {
            PayloadFrame::Sensor(reading) => format!(
                "sensor data from {}: {} {}",
                reading.sensor_id, reading.value, reading.unit
            ),
            PayloadFrame::Pose(pose) => format!(
                "robot pose: x={}, y={}, z={}, orientation={}",
                pose.x, pose.y, pose.z, pose.orientation
            ),
            PayloadFrame::Image(image) => format!(
                "image: {}x{}, encoding={}, {} bytes",
                image.width,
                image.height,
                image.encoding,
                image.data.len()
            ),
        }
    }

    /// Encode the inner message object as JSON.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            PayloadFrame::Sensor(reading) => serde_json::to_vec(reading)?,
            PayloadFrame::Pose(pose) => serde_json::to_vec(pose)?,
            PayloadFrame::Image(image) => serde_json::to_vec(image)?,
        };
        Ok(bytes)
    }

    /// Decode an inner message object for a stream of the given category.
    pub fn decode(category: Category, bytes: &[u8]) -> Result<Self> {
        let frame = match category {
            Category::Sensor => PayloadFrame::Sensor(serde_json::from_slice(bytes)?),
            Category::Pose => PayloadFrame::Pose(serde_json::from_slice(bytes)?),
            Category::Image => PayloadFrame::Image(serde_json::from_slice(bytes)?),
        };
        Ok(frame)
    }

    /// Fail unless this payload belongs on a stream of `expected` category.
    pub fn ensure_category(&self, expected: Category) -> Result<()> {
        let found = self.category();
        if found != expected {
            return Err(MessageError::CategoryMismatch { expected, found });
        }
        Ok(())
    }

    /// Sample payload for a category, used by generators and smoke tests.
    pub fn sample(category: Category, timestamp: i64) -> Self {
        match category {
            Category::Sensor => PayloadFrame::Sensor(SensorReading {
                sensor_id: "temp_sensor_1".to_string(),
                value: 25.5,
                unit: "celsius".to_string(),
                timestamp,
            }),
            Category::Pose => PayloadFrame::Pose(PoseUpdate {
                x: 1.0,
                y: 2.0,
                z: 0.0,
                orientation: 90.0,
                timestamp,
            }),
            Category::Image => PayloadFrame::Image(ImageChunk {
                width: 640,
                height: 480,
                encoding: "rgb8".to_string(),
                data: Bytes::from_static(b"sample_image_data"),
                timestamp,
            }),
        }
    }
}

impl From<SensorReading> for PayloadFrame {
    fn from(value: SensorReading) -> Self {
        PayloadFrame::Sensor(value)
    }
}

impl From<PoseUpdate> for PayloadFrame {
    fn from(value: PoseUpdate) -> Self {
        PayloadFrame::Pose(value)
    }
}

impl From<ImageChunk> for PayloadFrame {
    fn from(value: ImageChunk) -> Self {
        PayloadFrame::Image(value)
    }
}

/// `f64` fields that survive JSON for every value. Plain JSON numbers have
/// no NaN or infinities, so those travel as the strings `"NaN"`,
/// `"Infinity"` and `"-Infinity"`.
mod json_f64 {
    use std::fmt;

    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if *value == f64::INFINITY {
            serializer.serialize_str("Infinity")
        } else if *value == f64::NEG_INFINITY {
            serializer.serialize_str("-Infinity")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        deserializer.deserialize_any(F64Visitor)
    }

    struct F64Visitor;

    impl Visitor<'_> for F64Visitor {
        type Value = f64;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a number, \"NaN\", \"Infinity\" or \"-Infinity\"")
        }

        fn visit_f64<E: de::Error>(self, value: f64) -> Result<f64, E> {
            Ok(value)
        }

        fn visit_i64<E: de::Error>(self, value: i64) -> Result<f64, E> {
            Ok(value as f64)
        }

        fn visit_u64<E: de::Error>(self, value: u64) -> Result<f64, E> {
            Ok(value as f64)
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<f64, E> {
            match value {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(E::invalid_value(de::Unexpected::Str(other), &self)),
            }
        }
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
