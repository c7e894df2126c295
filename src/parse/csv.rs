//! CSV rows serialized as short prose records.
//!
//! Each data row becomes one [`TextUnit`]:
//!
//! ```text
//! name,unit_price        This record describes a product. Name: widget. Unit Price: 9.99.
//! widget,9.99       →
//! ```
//!
//! Empty or missing cells are omitted rather than serialized as blanks.

use crate::error::ParseError;
use crate::models::{ChunkMetadata, TextUnit};

const DEFAULT_ENTITY: &str = "record";

/// Parse CSV bytes into one unit per data row.
///
/// Row indices are 1-based data-row positions (the header is not counted).
/// More than `max_rows` data rows fails with [`ParseError::TooManyRows`].
pub fn parse_csv(bytes: &[u8], entity_name: &str, max_rows: usize) -> Result<Vec<TextUnit>, ParseError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| ParseError::InvalidCsv(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record.map_err(|e| ParseError::InvalidCsv(e.to_string()))?);
    }

    if records.is_empty() {
        return Err(ParseError::EmptyCsv);
    }
    if headers.iter().all(|h| h.is_empty()) {
        return Err(ParseError::NoHeaders);
    }
    if records.len() > max_rows {
        return Err(ParseError::TooManyRows {
            found: records.len(),
            max: max_rows,
        });
    }

    let entity = normalize_entity(entity_name);
    let labels: Vec<String> = headers.iter().map(|h| normalize_header(h)).collect();

    let units = records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let row_index = (i + 1) as u32;
            let filled = record.iter().filter(|v| !v.is_empty()).count();
            if filled != headers.len() {
                tracing::warn!(
                    row = row_index,
                    expected = headers.len(),
                    found = filled,
                    "CSV row has missing or extra cells; continuing"
                );
            }

            let mut parts = vec![format!("This record describes a {}.", entity)];
            for (col, label) in labels.iter().enumerate() {
                if label.is_empty() {
                    continue;
                }
                match record.get(col) {
                    Some(value) if !value.is_empty() => {
                        parts.push(format!("{}: {}.", label, value));
                    }
                    _ => {}
                }
            }

            TextUnit {
                text: parts.join(" "),
                position: ChunkMetadata::Row { row_index },
            }
        })
        .collect();

    Ok(units)
}

/// Entity name for a CSV upload, taken from its filename stem.
pub fn entity_from_filename(filename: &str) -> String {
    let stem = match filename.rfind('.') {
        Some(dot) if filename[dot..].eq_ignore_ascii_case(".csv") => &filename[..dot],
        _ => filename,
    };
    let entity = normalize_entity(stem);
    if entity.is_empty() {
        DEFAULT_ENTITY.to_string()
    } else {
        entity
    }
}

/// `order_items` / `orderItems` → `order items`.
fn normalize_entity(entity: &str) -> String {
    let spaced = split_camel(&entity.trim().replace(['_', '-'], " "));
    spaced
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// `unit_price` / `unitPrice` → `Unit Price`.
fn normalize_header(header: &str) -> String {
    let lowered = split_camel(&header.replace('_', " ")).to_lowercase();

    let mut out = String::with_capacity(lowered.len());
    let mut prev_is_word = false;
    for c in lowered.chars() {
        let is_word = c.is_alphanumeric() || c == '_';
        if is_word && !prev_is_word {
            out.extend(c.to_uppercase());
        } else {
            out.push(c);
        }
        prev_is_word = is_word;
    }
    out
}

fn split_camel(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 4);
    let mut prev: Option<char> = None;
    for c in s.chars() {
        if let Some(p) = prev {
            if p.is_ascii_lowercase() && c.is_ascii_uppercase() {
                out.push(' ');
            }
        }
        out.push(c);
        prev = Some(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_row_serializes_as_prose() {
        let units = parse_csv(b"name,price\nwidget,9.99", "record", 2000).unwrap();
        assert_eq!(units.len(), 1);
        assert_eq!(
            units[0].text,
            "This record describes a record. Name: widget. Price: 9.99."
        );
        assert_eq!(units[0].position, ChunkMetadata::Row { row_index: 1 });
    }

    #[test]
    fn empty_cells_are_omitted() {
        let units = parse_csv(b"name,colour,price\nbolt,,0.10\nnut\n", "part", 2000).unwrap();
        assert_eq!(
            units[0].text,
            "This record describes a part. Name: bolt. Price: 0.10."
        );
        assert_eq!(units[1].text, "This record describes a part. Name: nut.");
        assert_eq!(units[1].position, ChunkMetadata::Row { row_index: 2 });
    }

    #[test]
    fn headers_become_title_case() {
        assert_eq!(normalize_header("unit_price"), "Unit Price");
        assert_eq!(normalize_header("unitPrice"), "Unit Price");
        assert_eq!(normalize_header("SKU"), "Sku");
        assert_eq!(normalize_header("price (usd)"), "Price (Usd)");
    }

    #[test]
    fn entity_comes_from_filename() {
        assert_eq!(entity_from_filename("orderItems.csv"), "order items");
        assert_eq!(entity_from_filename("sales_2024-q1.CSV"), "sales 2024 q1");
        assert_eq!(entity_from_filename("record.csv"), "record");
        assert_eq!(entity_from_filename(".csv"), "record");
    }

    #[test]
    fn empty_file_is_rejected() {
        assert!(matches!(parse_csv(b"", "x", 10), Err(ParseError::EmptyCsv)));
        assert!(matches!(
            parse_csv(b"name,price\n", "x", 10),
            Err(ParseError::EmptyCsv)
        ));
    }

    #[test]
    fn blank_header_row_is_rejected() {
        assert!(matches!(
            parse_csv(b",\nwidget,9.99\n", "x", 10),
            Err(ParseError::NoHeaders)
        ));
    }

    #[test]
    fn row_ceiling_is_inclusive() {
        let mut csv = String::from("id\n");
        for i in 0..5 {
            csv.push_str(&format!("{}\n", i));
        }
        assert_eq!(parse_csv(csv.as_bytes(), "x", 5).unwrap().len(), 5);

        csv.push_str("5\n");
        match parse_csv(csv.as_bytes(), "x", 5) {
            Err(ParseError::TooManyRows { found, max }) => {
                assert_eq!(found, 6);
                assert_eq!(max, 5);
            }
            other => panic!("expected TooManyRows, got {:?}", other),
        }
    }

    #[test]
    fn rows_keep_document_order() {
        let units = parse_csv(b"n\na\nb\nc\n", "letter", 10).unwrap();
        let indices: Vec<u32> = units
            .iter()
            .map(|u| u.position.row_index().unwrap())
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }
}
