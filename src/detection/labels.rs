//! Parser for the per-image label file written by the detection engine.
//!
//! One object per line, `<class_index> <cx> <cy> <width> <height>`, all
//! coordinates normalized to the image size and therefore within `[0, 1]`.

use crate::models::{ClassNames, DetectionRecord};

const TOKENS_PER_LINE: usize = 5;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("line {line_no}: expected 5 tokens, found {found}: {line:?}")]
    TokenCount {
        line_no: usize,
        found: usize,
        line: String,
    },
    #[error("line {line_no}: class index {index:?} is not in the class table ({classes} classes): {line:?}")]
    UnknownClass {
        line_no: usize,
        index: String,
        classes: usize,
        line: String,
    },
    #[error("line {line_no}: {field} is not a finite number ({value:?}): {line:?}")]
    InvalidNumber {
        line_no: usize,
        field: &'static str,
        value: String,
        line: String,
    },
    #[error("line {line_no}: {field} = {value} is outside [0, 1]: {line:?}")]
    OutOfRange {
        line_no: usize,
        field: &'static str,
        value: f32,
        line: String,
    },
}

impl ParseError {
    /// 1-based line number of the offending line
    pub fn line_no(&self) -> usize {
        match self {
            ParseError::TokenCount { line_no, .. }
            | ParseError::UnknownClass { line_no, .. }
            | ParseError::InvalidNumber { line_no, .. }
            | ParseError::OutOfRange { line_no, .. } => *line_no,
        }
    }
}

/// Parse raw label text into detections, keeping file order.
///
/// `None`, empty and whitespace-only input all mean "nothing detected".
pub fn parse_labels(
    raw: Option<&str>,
    classes: &ClassNames,
) -> Result<Vec<DetectionRecord>, ParseError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };

    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| parse_line(idx + 1, line, classes))
        .collect()
}

fn parse_line(
    line_no: usize,
    line: &str,
    classes: &ClassNames,
) -> Result<DetectionRecord, ParseError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() != TOKENS_PER_LINE {
        return Err(ParseError::TokenCount {
            line_no,
            found: tokens.len(),
            line: line.to_string(),
        });
    }

    let object_class = tokens[0]
        .parse::<usize>()
        .ok()
        .and_then(|index| classes.get(index))
        .ok_or_else(|| ParseError::UnknownClass {
            line_no,
            index: tokens[0].to_string(),
            classes: classes.len(),
            line: line.to_string(),
        })?
        .to_string();

    let number = |field: &'static str, token: &str| -> Result<f32, ParseError> {
        let value = token
            .parse::<f32>()
            .ok()
            .filter(|value| value.is_finite())
            .ok_or_else(|| ParseError::InvalidNumber {
                line_no,
                field,
                value: token.to_string(),
                line: line.to_string(),
            })?;
        if !(0.0..=1.0).contains(&value) {
            return Err(ParseError::OutOfRange {
                line_no,
                field,
                value,
                line: line.to_string(),
            });
        }
        Ok(value)
    };

    Ok(DetectionRecord {
        object_class,
        center_x: number("cx", tokens[1])?,
        center_y: number("cy", tokens[2])?,
        width: number("width", tokens[3])?,
        height: number("height", tokens[4])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classes() -> ClassNames {
        ClassNames::coco()
    }

    #[test]
    fn parses_lines_in_file_order() {
        let raw = "0 0.5 0.5 0.2 0.3\n16 0.1 0.1 0.05 0.05\n";
        let records = parse_labels(Some(raw), &classes()).unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].object_class, "person");
        assert_eq!(records[0].center(), (0.5, 0.5));
        assert_eq!(records[0].width, 0.2);
        assert_eq!(records[0].height, 0.3);
        assert_eq!(records[1].object_class, "dog");
    }

    #[test]
    fn empty_and_missing_input_mean_no_detections() {
        assert!(parse_labels(None, &classes()).unwrap().is_empty());
        assert!(parse_labels(Some(""), &classes()).unwrap().is_empty());
        assert!(parse_labels(Some("\n  \n\t\n"), &classes()).unwrap().is_empty());
    }

    #[test]
    fn blank_lines_are_skipped_but_counted() {
        let raw = "0 0.5 0.5 0.2 0.3\n\n2 0.5 0.5 0.2\n";
        let err = parse_labels(Some(raw), &classes()).unwrap_err();
        assert_eq!(err.line_no(), 3);
    }

    #[test]
    fn short_line_is_an_error_not_a_partial_record() {
        let err = parse_labels(Some("0 0.5 0.5 0.2"), &classes()).unwrap_err();
        assert!(matches!(err, ParseError::TokenCount { found: 4, .. }));
    }

    #[test]
    fn confidence_column_is_rejected() {
        let err = parse_labels(Some("0 0.5 0.5 0.2 0.3 0.91"), &classes()).unwrap_err();
        assert!(matches!(err, ParseError::TokenCount { found: 6, .. }));
    }

    #[test]
    fn out_of_range_class_is_rejected_for_any_coordinates() {
        let table = ClassNames::new(vec!["a".to_string(), "b".to_string()]);
        for suffix in ["0 0 0 0", "0.5 0.5 0.5 0.5", "1 1 1 1", "0.999 0.001 0.3 0.7"] {
            let line = format!("2 {suffix}");
            let err = parse_labels(Some(&line), &table).unwrap_err();
            assert!(
                matches!(err, ParseError::UnknownClass { classes: 2, .. }),
                "unexpected error for {line:?}: {err:?}"
            );
        }
    }

    #[test]
    fn negative_or_fractional_class_index_is_unknown() {
        assert!(matches!(
            parse_labels(Some("-1 0.5 0.5 0.2 0.3"), &classes()),
            Err(ParseError::UnknownClass { .. })
        ));
        assert!(matches!(
            parse_labels(Some("1.0 0.5 0.5 0.2 0.3"), &classes()),
            Err(ParseError::UnknownClass { .. })
        ));
    }

    #[test]
    fn non_finite_numbers_name_the_field() {
        let err = parse_labels(Some("0 0.5 NaN 0.2 0.3"), &classes()).unwrap_err();
        match err {
            ParseError::InvalidNumber { field, value, line_no, .. } => {
                assert_eq!(field, "cy");
                assert_eq!(value, "NaN");
                assert_eq!(line_no, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = parse_labels(Some("0 0.5 0.5 inf 0.3"), &classes()).unwrap_err();
        assert!(matches!(err, ParseError::InvalidNumber { field: "width", .. }));

        let err = parse_labels(Some("0 0.5 0.5 0.2 abc"), &classes()).unwrap_err();
        assert!(err.to_string().contains("0 0.5 0.5 0.2 abc"));
    }

    #[test]
    fn coordinates_outside_unit_range_are_rejected() {
        for (line, field) in [
            ("0 1.7 0.5 0.2 0.3", "cx"),
            ("0 0.5 -0.2 0.2 0.3", "cy"),
            ("0 0.5 0.5 3 0.3", "width"),
            ("0 0.5 0.5 0.2 1.0001", "height"),
            ("0 -0.0001 0.5 0.2 0.3", "cx"),
        ] {
            let err = parse_labels(Some(line), &classes()).unwrap_err();
            assert!(
                matches!(err, ParseError::OutOfRange { field: f, line_no: 1, .. } if f == field),
                "unexpected error for {line:?}: {err:?}"
            );
        }
    }

    #[test]
    fn unit_range_bounds_are_inclusive() {
        let records = parse_labels(Some("0 0 1 1 0"), &classes()).unwrap();
        assert_eq!(records[0].center(), (0.0, 1.0));
        assert_eq!(records[0].width, 1.0);
        assert_eq!(records[0].height, 0.0);
    }

    #[test]
    fn tolerates_crlf_and_extra_spacing() {
        let raw = "0  0.5\t0.5 0.2 0.3\r\n16 0.1 0.1 0.05 0.05\r\n";
        let records = parse_labels(Some(raw), &classes()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].object_class, "dog");
    }
}
