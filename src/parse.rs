//! Decoder for gyroscope notification payloads.
//!
//! The firmware formats each reading with `snprintf("%f,%f,%f")` and notifies
//! the raw bytes.  Decoding is pure and allocation-free apart from the UTF-8
//! check; malformed payloads yield `None` and must leave prior state untouched.

use crate::types::MotionSample;

/// Decode one `"gx,gy,gz"` payload into a sign-inverted [`MotionSample`].
///
/// Succeeds only when the bytes are valid UTF-8, split on `,` into exactly
/// three fields, and every field parses as a finite real number.  Surrounding
/// whitespace on each field is ignored, as is trailing NUL padding that some
/// stacks leave on fixed-size notification buffers.  The slice is taken as
/// the whole payload, so its length is the declared length.
///
/// ```
/// # use gyro_shaker::parse::decode_motion;
/// # use gyro_shaker::types::MotionSample;
/// assert_eq!(
///     decode_motion(b"1.0,-2.0,3.5"),
///     Some(MotionSample::new(-1.0, 2.0, -3.5))
/// );
/// assert_eq!(decode_motion(b"1.0,2.0"), None);
/// ```
pub fn decode_motion(payload: &[u8]) -> Option<MotionSample> {
    let text = std::str::from_utf8(payload).ok()?;
    let text = text.trim_end_matches('\0');

    let mut fields = text.split(',');
    let x = parse_component(fields.next()?)?;
    let y = parse_component(fields.next()?)?;
    let z = parse_component(fields.next()?)?;
    if fields.next().is_some() {
        return None;
    }

    Some(MotionSample::new(-x, -y, -z))
}

fn parse_component(field: &str) -> Option<f32> {
    let v: f32 = field.trim().parse().ok()?;
    v.is_finite().then_some(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_payload_is_negated() {
        assert_eq!(
            decode_motion(b"1.0,-2.0,3.5"),
            Some(MotionSample::new(-1.0, 2.0, -3.5))
        );
        assert_eq!(
            decode_motion(b"120000,0,-95000.25"),
            Some(MotionSample::new(-120000.0, -0.0, 95000.25))
        );
    }

    #[test]
    fn whitespace_and_nul_padding_are_tolerated() {
        assert_eq!(
            decode_motion(b" 1 , 2 ,3\r\n"),
            Some(MotionSample::new(-1.0, -2.0, -3.0))
        );
        assert_eq!(
            decode_motion(b"1,2,3\0\0\0"),
            Some(MotionSample::new(-1.0, -2.0, -3.0))
        );
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        for bad in [&b""[..], b"1", b"1,2", b"1,2,3,4", b"1,2,3,", b",,"] {
            assert_eq!(decode_motion(bad), None, "{:?}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn non_numeric_fields_are_rejected() {
        for bad in [&b"a,2,3"[..], b"1,b,3", b"1,2,c", b"1,,3", b"NaN,0,0", b"inf,0,0"] {
            assert_eq!(decode_motion(bad), None, "{:?}", String::from_utf8_lossy(bad));
        }
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert_eq!(decode_motion(&[0xff, b',', b'1', b',', b'2']), None);
    }
}
