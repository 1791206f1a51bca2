//! Binary layout of series log files.
//!
//! ```text
//! file   := header record*
//! header := "PVLG" u16:version u16:reserved            (8 bytes)
//! record := u32:body_len body
//! body   := i64:timestamp u8:tag payload u16:ann_len ann_bytes
//! ```
//!
//! All integers are little endian. `ann_len == u16::MAX` means no annotation;
//! stored annotations never exceed [`MAX_ANNOTATION_LEN`] bytes.

use crate::error::WriteError;
use crate::value::{DataValue, ImageFormat, ImageRef, MAX_ANNOTATION_LEN, SeriesId, ValuePoint};

/// Magic bytes at the start of every series log.
pub(crate) const LOG_MAGIC: [u8; 4] = *b"PVLG";

/// Current log format version.
pub(crate) const LOG_VERSION: u16 = 1;

/// Size of the file header in bytes.
pub(crate) const HEADER_SIZE: usize = 8;

const LEN_PREFIX: usize = 4;
const NO_ANNOTATION: u16 = u16::MAX;

const TAG_NUMERIC: u8 = 0;
const TAG_BINARY: u8 = 1;
const TAG_MULTISTATE: u8 = 2;
const TAG_ALPHANUMERIC: u8 = 3;
const TAG_IMAGE: u8 = 4;

/// Result of decoding at an offset.
#[derive(Debug)]
pub(crate) enum Decoded {
    /// A complete record of `len` bytes including the length prefix.
    Record { point: ValuePoint, len: usize },
    /// The buffer ends inside the record.
    Torn,
}

/// Encodes the file header.
pub(crate) fn encode_header() -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[..4].copy_from_slice(&LOG_MAGIC);
    header[4..6].copy_from_slice(&LOG_VERSION.to_le_bytes());
    header
}

/// Checks a file header. Returns a description of the problem on failure.
pub(crate) fn check_header(buf: &[u8]) -> Result<(), String> {
    if buf.len() < HEADER_SIZE {
        return Err(format!("file is {} bytes, shorter than header", buf.len()));
    }
    if buf[..4] != LOG_MAGIC {
        return Err(format!(
            "invalid magic bytes: expected {:?}, found {:?}",
            LOG_MAGIC,
            &buf[..4]
        ));
    }
    let version = u16::from_le_bytes([buf[4], buf[5]]);
    if version != LOG_VERSION {
        return Err(format!(
            "unsupported version: expected {LOG_VERSION}, found {version}"
        ));
    }
    Ok(())
}

/// Appends the encoding of `point` to `out`.
///
/// Nothing is appended when the point cannot be encoded.
///
/// # Errors
///
/// - [`WriteError::AnnotationTooLong`] if the annotation exceeds
///   [`MAX_ANNOTATION_LEN`] bytes
/// - [`WriteError::InvalidValue`] if the record body would not fit its
///   length prefix
pub(crate) fn encode_record(point: &ValuePoint, out: &mut Vec<u8>) -> Result<(), WriteError> {
    if let Some(text) = point.annotation()
        && text.len() > MAX_ANNOTATION_LEN
    {
        return Err(WriteError::AnnotationTooLong {
            len: text.len(),
            max: MAX_ANNOTATION_LEN,
        });
    }
    let too_large = || WriteError::InvalidValue {
        series_id: point.series_id(),
        reason: "record exceeds the log's u32 length prefix".to_string(),
    };

    let start = out.len();
    out.extend_from_slice(&[0u8; LEN_PREFIX]);
    out.extend_from_slice(&point.timestamp().to_le_bytes());
    match point.value() {
        DataValue::Numeric(v) => {
            out.push(TAG_NUMERIC);
            out.extend_from_slice(&v.to_le_bytes());
        }
        DataValue::Binary(b) => {
            out.push(TAG_BINARY);
            out.push(u8::from(*b));
        }
        DataValue::Multistate(s) => {
            out.push(TAG_MULTISTATE);
            out.extend_from_slice(&s.to_le_bytes());
        }
        DataValue::Alphanumeric(text) => {
            let Ok(len) = u32::try_from(text.len()) else {
                out.truncate(start);
                return Err(too_large());
            };
            out.push(TAG_ALPHANUMERIC);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        DataValue::Image(img) => {
            out.push(TAG_IMAGE);
            out.extend_from_slice(&img.id.to_le_bytes());
            out.push(format_to_byte(img.format));
        }
    }
    match point.annotation() {
        Some(text) => {
            // Bounded by MAX_ANNOTATION_LEN above.
            let len = u16::try_from(text.len()).unwrap_or(NO_ANNOTATION);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        None => out.extend_from_slice(&NO_ANNOTATION.to_le_bytes()),
    }
    let Ok(body_len) = u32::try_from(out.len() - start - LEN_PREFIX) else {
        out.truncate(start);
        return Err(too_large());
    };
    out[start..start + LEN_PREFIX].copy_from_slice(&body_len.to_le_bytes());
    Ok(())
}

/// Total length of the record at `offset`, length prefix included.
///
/// Returns `None` if the buffer ends before the record does.
pub(crate) fn record_len(buf: &[u8], offset: usize) -> Option<usize> {
    let prefix = buf.get(offset..offset + LEN_PREFIX)?;
    let body_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let len = LEN_PREFIX + body_len;
    (offset + len <= buf.len()).then_some(len)
}

/// Decodes the record starting at `offset`.
///
/// Returns [`Decoded::Torn`] when `buf` ends before the record does, and an
/// error description when the record is complete but malformed.
pub(crate) fn decode_record(
    buf: &[u8],
    offset: usize,
    series: SeriesId,
) -> Result<Decoded, String> {
    let Some(prefix) = buf.get(offset..offset + LEN_PREFIX) else {
        return Ok(Decoded::Torn);
    };
    let body_len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
    let body_start = offset + LEN_PREFIX;
    let Some(body) = buf.get(body_start..body_start + body_len) else {
        return Ok(Decoded::Torn);
    };

    let mut reader = Reader { buf: body, pos: 0 };
    let timestamp = reader.i64()?;
    let tag = reader.u8()?;
    let value = match tag {
        TAG_NUMERIC => DataValue::Numeric(f64::from_bits(reader.u64()?)),
        TAG_BINARY => DataValue::Binary(reader.u8()? != 0),
        TAG_MULTISTATE => DataValue::Multistate(reader.i32()?),
        TAG_ALPHANUMERIC => {
            let len = reader.u32()? as usize;
            DataValue::Alphanumeric(reader.utf8(len)?)
        }
        TAG_IMAGE => {
            let id = reader.i64()?;
            let format = byte_to_format(reader.u8()?);
            DataValue::Image(ImageRef { id, format })
        }
        other => return Err(format!("unknown value tag {other}")),
    };
    let ann_len = reader.u16()?;
    let mut point = ValuePoint::new(series, timestamp, value);
    if ann_len != NO_ANNOTATION {
        point = point.with_annotation(reader.utf8(usize::from(ann_len))?);
    }
    if reader.pos != body.len() {
        return Err(format!(
            "record body is {} bytes but only {} were decoded",
            body.len(),
            reader.pos
        ));
    }
    Ok(Decoded::Record {
        point,
        len: LEN_PREFIX + body_len,
    })
}

fn format_to_byte(format: ImageFormat) -> u8 {
    match format {
        ImageFormat::Jpeg => 1,
        ImageFormat::Png => 2,
        ImageFormat::Gif => 3,
        ImageFormat::Unknown => 0,
    }
}

fn byte_to_format(byte: u8) -> ImageFormat {
    match byte {
        1 => ImageFormat::Jpeg,
        2 => ImageFormat::Png,
        3 => ImageFormat::Gif,
        _ => ImageFormat::Unknown,
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos + n;
        let slice = self
            .buf
            .get(self.pos..end)
            .ok_or_else(|| format!("record body truncated at byte {}", self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, String> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, String> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, String> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, String> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, String> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, String> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn utf8(&mut self, len: usize) -> Result<String, String> {
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("invalid utf-8 text: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(buf: &[u8]) -> ValuePoint {
        match decode_record(buf, 0, SeriesId(5)).unwrap() {
            Decoded::Record { point, len } => {
                assert_eq!(len, buf.len());
                point
            }
            Decoded::Torn => panic!("Expected a complete record"),
        }
    }

    #[test]
    fn test_header_validation() {
        let header = encode_header();
        assert!(check_header(&header).is_ok());

        let mut bad = header;
        bad[0] = b'X';
        assert!(check_header(&bad).unwrap_err().contains("magic"));

        let mut bad = header;
        bad[4] = 9;
        assert!(check_header(&bad).unwrap_err().contains("version"));

        assert!(check_header(&header[..3]).is_err());
    }

    #[test]
    fn test_every_value_kind_decodes() {
        let values = [
            DataValue::Numeric(-12.25),
            DataValue::Binary(true),
            DataValue::Multistate(-3),
            DataValue::Alphanumeric("pump øn".to_string()),
            DataValue::Image(ImageRef {
                id: 99,
                format: ImageFormat::Png,
            }),
        ];
        for value in values {
            let point = ValuePoint::new(SeriesId(5), -7, value).with_annotation("set by operator");
            let mut buf = Vec::new();
            encode_record(&point, &mut buf).unwrap();
            assert_eq!(decode_one(&buf), point);
        }
    }

    #[test]
    fn test_empty_annotation_differs_from_none() {
        let with_empty = ValuePoint::numeric(SeriesId(5), 1, 1.0).with_annotation("");
        let mut buf = Vec::new();
        encode_record(&with_empty, &mut buf).unwrap();
        assert_eq!(decode_one(&buf).annotation(), Some(""));

        let without = ValuePoint::numeric(SeriesId(5), 1, 1.0);
        let mut buf = Vec::new();
        encode_record(&without, &mut buf).unwrap();
        assert_eq!(decode_one(&buf).annotation(), None);
    }

    #[test]
    fn test_oversized_annotation_rejected_whole() {
        let mut buf = Vec::new();
        encode_record(&ValuePoint::numeric(SeriesId(5), 1, 1.0), &mut buf).unwrap();
        let before = buf.clone();

        // Multi-byte characters straddle every plausible cut point.
        let long = "é".repeat(MAX_ANNOTATION_LEN);
        let point = ValuePoint::numeric(SeriesId(5), 2, 2.0).with_annotation(long.as_str());
        match encode_record(&point, &mut buf).unwrap_err() {
            WriteError::AnnotationTooLong { len, max } => {
                assert_eq!(len, long.len());
                assert_eq!(max, MAX_ANNOTATION_LEN);
            }
            other => panic!("Expected AnnotationTooLong, got: {other:?}"),
        }
        assert_eq!(buf, before);

        let at_limit = "x".repeat(MAX_ANNOTATION_LEN);
        let point = ValuePoint::numeric(SeriesId(5), 3, 3.0).with_annotation(at_limit.as_str());
        let mut buf = Vec::new();
        encode_record(&point, &mut buf).unwrap();
        assert_eq!(decode_one(&buf).annotation(), Some(at_limit.as_str()));
    }

    #[test]
    fn test_torn_record_detected() {
        let point = ValuePoint::numeric(SeriesId(5), 100, 3.0);
        let mut buf = Vec::new();
        encode_record(&point, &mut buf).unwrap();
        for cut in 0..buf.len() {
            assert!(matches!(
                decode_record(&buf[..cut], 0, SeriesId(5)),
                Ok(Decoded::Torn)
            ));
        }
    }

    #[test]
    fn test_record_len_spans_whole_record() {
        let mut buf = Vec::new();
        encode_record(&ValuePoint::numeric(SeriesId(5), 1, 1.0), &mut buf).unwrap();
        let first = buf.len();
        encode_record(
            &ValuePoint::numeric(SeriesId(5), 2, 2.0).with_annotation("ok"),
            &mut buf,
        )
        .unwrap();
        assert_eq!(record_len(&buf, 0), Some(first));
        assert_eq!(record_len(&buf, first), Some(buf.len() - first));
        assert_eq!(record_len(&buf[..buf.len() - 1], first), None);
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        let point = ValuePoint::numeric(SeriesId(5), 100, 3.0);
        let mut buf = Vec::new();
        encode_record(&point, &mut buf).unwrap();
        // tag follows the length prefix and the timestamp
        buf[LEN_PREFIX + 8] = 42;
        let err = decode_record(&buf, 0, SeriesId(5)).unwrap_err();
        assert!(err.contains("tag 42"));
    }
}
