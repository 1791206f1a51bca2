//! The point-value data model.
//!
//! A [`ValuePoint`] is one timestamped value belonging to one series. Values are
//! immutable once constructed; the only way to change what is stored at a
//! timestamp is to write a new point there (last write wins).

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::WriteError;

/// Maximum stored annotation length in bytes.
pub const MAX_ANNOTATION_LEN: usize = 255;

/// Stable identifier of a logical series.
///
/// Callers may remap their own entity ids onto series ids, so a `SeriesId` is
/// not necessarily equal to any id outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SeriesId(pub u32);

impl SeriesId {
    /// Returns the raw id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SeriesId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for SeriesId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Encoding of an image referenced by a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    /// JPEG image.
    Jpeg,
    /// PNG image.
    Png,
    /// GIF image.
    Gif,
    /// Format not recognised.
    Unknown,
}

/// Reference to an image stored outside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageRef {
    /// External image id.
    pub id: i64,
    /// Image encoding.
    pub format: ImageFormat,
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum DataValue {
    /// A floating point measurement.
    Numeric(f64),
    /// An on/off state.
    Binary(bool),
    /// One of a fixed set of integer states.
    Multistate(i32),
    /// Free text.
    Alphanumeric(String),
    /// A reference to an image.
    Image(ImageRef),
}

impl DataValue {
    /// Returns the value as `f64` where a numeric reading makes sense.
    ///
    /// Binary values map to `0.0`/`1.0`, multistate values to their state.
    /// Text and images have no numeric reading.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Numeric(v) => Some(*v),
            Self::Binary(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Multistate(s) => Some(f64::from(*s)),
            Self::Alphanumeric(_) | Self::Image(_) => None,
        }
    }

    /// Short name of the value kind, used in exports and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Numeric(_) => "numeric",
            Self::Binary(_) => "binary",
            Self::Multistate(_) => "multistate",
            Self::Alphanumeric(_) => "alphanumeric",
            Self::Image(_) => "image",
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(v) => write!(f, "{v}"),
            Self::Binary(b) => write!(f, "{b}"),
            Self::Multistate(s) => write!(f, "{s}"),
            Self::Alphanumeric(s) => write!(f, "{s}"),
            Self::Image(img) => write!(f, "image:{}", img.id),
        }
    }
}

/// One timestamped value of one series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValuePoint {
    series_id: SeriesId,
    timestamp: i64,
    value: DataValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    annotation: Option<String>,
}

impl ValuePoint {
    /// Creates a point without an annotation.
    ///
    /// `timestamp` is milliseconds since the Unix epoch.
    pub fn new(series_id: SeriesId, timestamp: i64, value: DataValue) -> Self {
        Self {
            series_id,
            timestamp,
            value,
            annotation: None,
        }
    }

    /// Shorthand for a numeric point.
    pub fn numeric(series_id: SeriesId, timestamp: i64, value: f64) -> Self {
        Self::new(series_id, timestamp, DataValue::Numeric(value))
    }

    /// Returns the point with the given annotation attached.
    #[must_use]
    pub fn with_annotation(mut self, annotation: impl Into<String>) -> Self {
        self.annotation = Some(annotation.into());
        self
    }

    /// Returns a copy of this point stamped at `timestamp`.
    ///
    /// Used to synthesize boundary values.
    #[must_use]
    pub fn restamped(&self, timestamp: i64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// The owning series.
    pub fn series_id(&self) -> SeriesId {
        self.series_id
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// The stored value.
    pub fn value(&self) -> &DataValue {
        &self.value
    }

    /// The annotation, if any.
    pub fn annotation(&self) -> Option<&str> {
        self.annotation.as_deref()
    }

    /// Checks that the point can be stored.
    ///
    /// # Errors
    ///
    /// Returns [`WriteError::AnnotationTooLong`] for annotations over
    /// [`MAX_ANNOTATION_LEN`] bytes and [`WriteError::InvalidValue`] for
    /// infinite numeric values.
    pub fn validate(&self) -> Result<(), WriteError> {
        if let Some(annotation) = &self.annotation
            && annotation.len() > MAX_ANNOTATION_LEN
        {
            return Err(WriteError::AnnotationTooLong {
                len: annotation.len(),
                max: MAX_ANNOTATION_LEN,
            });
        }
        if let DataValue::Numeric(v) = self.value
            && v.is_infinite()
        {
            return Err(WriteError::InvalidValue {
                series_id: self.series_id,
                reason: format!("numeric value {v} is infinite"),
            });
        }
        Ok(())
    }
}
