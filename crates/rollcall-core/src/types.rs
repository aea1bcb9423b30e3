use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Storage format for attendance dates.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Storage format for attendance times.
pub const TIME_FORMAT: &str = "%H:%M:%S";

/// Face location in pixel coordinates, ordered like the encoder reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
    pub left: u32,
}

impl BoundingBox {
    /// Scale every edge by an integer factor (used to map a downscaled
    /// detection back onto the full-resolution frame).
    pub fn scale(&self, factor: u32) -> Self {
        Self {
            top: self.top.saturating_mul(factor),
            right: self.right.saturating_mul(factor),
            bottom: self.bottom.saturating_mul(factor),
            left: self.left.saturating_mul(factor),
        }
    }

    pub fn width(&self) -> u32 {
        self.right.saturating_sub(self.left)
    }

    pub fn height(&self) -> u32 {
        self.bottom.saturating_sub(self.top)
    }
}

/// Biometric template (typically a 128-dimensional face encoding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub values: Vec<f32>,
}

impl Template {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Euclidean distance between two templates.
    ///
    /// Templates of different length are compared over their common prefix.
    pub fn euclidean_distance(&self, other: &Template) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Serialize as a little-endian f32 sequence for the `face_encoding` column.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a blob written by [`to_bytes`](Self::to_bytes).
    ///
    /// Returns `None` for an empty blob or one whose length is not a
    /// multiple of four.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// An enrolled student row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub student_id: String,
    pub name: String,
    pub age: u32,
    /// Opaque template blob; never validated by the store.
    #[serde(skip)]
    pub face_encoding: Vec<u8>,
}

/// A stored attendance event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceEvent {
    pub id: i64,
    pub student_id: String,
    pub date: NaiveDate,
    pub time: NaiveTime,
}

/// One line of the per-day attendance report. `time` is `None` when absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportRow {
    pub student_id: String,
    pub name: String,
    pub time: Option<NaiveTime>,
}

/// A face found in a frame together with its template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub location: BoundingBox,
    pub template: Template,
}
