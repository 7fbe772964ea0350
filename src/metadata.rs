//! Structural metadata for tabular attachments.
//!
//! Only headers and a row count are extracted: that is what gets folded into
//! the prompt, the data itself is read by the generated code inside the
//! sandbox. Spreadsheet workbooks are left to an external extractor.

use crate::errors::ParseError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabularMetadata {
    pub headers: Vec<String>,
    pub row_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet_names: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<String>,
}

impl TabularMetadata {
    /// Multi-line summary suitable for a prompt
    pub fn describe(&self) -> String {
        let mut out = format!(
            "Columns ({}): {}\nRows: {}",
            self.headers.len(),
            self.headers.join(", "),
            self.row_count
        );
        if let Some(sheets) = &self.sheet_names {
            out.push_str(&format!("\nSheets: {}", sheets.join(", ")));
        }
        if let Some(encoding) = &self.encoding {
            out.push_str(&format!("\nEncoding: {}", encoding));
        }
        out
    }
}

/// Pure function from file bytes to structure
pub trait MetadataExtractor: Send + Sync {
    fn parse_tabular(&self, bytes: &[u8], media_type: &str) -> Result<TabularMetadata, ParseError>;
}

/// Media type for a file name when the uploader did not declare one
pub fn guess_media_type(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".csv") {
        "text/csv"
    } else if lower.ends_with(".tsv") {
        "text/tab-separated-values"
    } else if lower.ends_with(".xlsx") {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    } else if lower.ends_with(".xls") {
        "application/vnd.ms-excel"
    } else {
        "application/octet-stream"
    }
}

pub fn is_tabular_media_type(media_type: &str) -> bool {
    is_delimited(media_type) || is_spreadsheet(media_type)
}

fn is_delimited(media_type: &str) -> bool {
    media_type.contains("csv")
        || media_type == "text/tab-separated-values"
        || media_type == "text/plain"
}

fn is_spreadsheet(media_type: &str) -> bool {
    media_type.contains("excel") || media_type.contains("spreadsheet")
}

const DELIMITERS: [char; 4] = [',', ';', '\t', '|'];

/// Header and row-count extractor for delimited text
#[derive(Debug, Default, Clone)]
pub struct CsvMetadataExtractor;

impl MetadataExtractor for CsvMetadataExtractor {
    fn parse_tabular(&self, bytes: &[u8], media_type: &str) -> Result<TabularMetadata, ParseError> {
        if !is_delimited(media_type) {
            return Err(ParseError::Unsupported(media_type.to_string()));
        }
        if bytes.is_empty() {
            return Err(ParseError::Empty);
        }

        let (content, encoding) = decode(bytes);
        if content.trim().is_empty() {
            return Err(ParseError::Empty);
        }

        let delimiter = detect_delimiter(&content);
        let records = split_records(&content, delimiter)?;

        let mut rows = records
            .into_iter()
            .filter(|(_, fields)| !(fields.len() == 1 && fields[0].trim().is_empty()));

        let (_, headers) = rows.next().ok_or(ParseError::MissingHeader)?;
        if headers.iter().all(|h| h.trim().is_empty()) {
            return Err(ParseError::MissingHeader);
        }

        let mut row_count = 0;
        for (line, fields) in rows {
            if fields.len() > headers.len() {
                return Err(ParseError::FieldMismatch {
                    row: line,
                    expected: headers.len(),
                    found: fields.len(),
                });
            }
            row_count += 1;
        }

        Ok(TabularMetadata {
            headers,
            row_count,
            sheet_names: None,
            encoding: Some(encoding.to_string()),
            delimiter: Some(delimiter.to_string()),
        })
    }
}

/// Decode bytes, honoring a BOM; non-UTF-8 input is read as Latin-1
fn decode(bytes: &[u8]) -> (String, &'static str) {
    if let Some(rest) = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return (String::from_utf8_lossy(rest).into_owned(), "UTF-8");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return (String::from_utf16_lossy(&units), "UTF-16LE");
    }
    if let Some(rest) = bytes.strip_prefix(&[0xFE, 0xFF]) {
        let units: Vec<u16> = rest
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return (String::from_utf16_lossy(&units), "UTF-16BE");
    }
    match std::str::from_utf8(bytes) {
        Ok(text) => (text.to_string(), "UTF-8"),
        Err(_) => (bytes.iter().map(|&b| b as char).collect(), "ISO-8859-1"),
    }
}

/// Pick the delimiter splitting the first line into the most fields
fn detect_delimiter(content: &str) -> char {
    let first_line = content.lines().next().unwrap_or_default();
    let mut best = ',';
    let mut best_count = 0;
    for delimiter in DELIMITERS {
        let count = first_line.split(delimiter).count();
        if count > best_count {
            best = delimiter;
            best_count = count;
        }
    }
    best
}

/// Quote-aware record splitter. Returns (1-based starting line, fields).
fn split_records(content: &str, delimiter: char) -> Result<Vec<(usize, Vec<String>)>, ParseError> {
    let mut records = Vec::new();
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut line = 1;
    let mut record_line = 1;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                '\n' => {
                    line += 1;
                    field.push(c);
                }
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => in_quotes = true,
            '\r' => {}
            '\n' => {
                fields.push(std::mem::take(&mut field));
                records.push((record_line, std::mem::take(&mut fields)));
                line += 1;
                record_line = line;
            }
            c if c == delimiter => fields.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if in_quotes {
        return Err(ParseError::UnterminatedQuote(record_line));
    }
    if !field.is_empty() || !fields.is_empty() {
        fields.push(field);
        records.push((record_line, fields));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(bytes: &[u8]) -> Result<TabularMetadata, ParseError> {
        CsvMetadataExtractor.parse_tabular(bytes, "text/csv")
    }

    #[test]
    fn test_headers_and_row_count() {
        let meta = parse(b"region,amount,date\nnorth,10,2024-01-01\n\nsouth,20,2024-01-02\n").unwrap();
        assert_eq!(meta.headers, vec!["region", "amount", "date"]);
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.encoding.as_deref(), Some("UTF-8"));
        assert_eq!(meta.delimiter.as_deref(), Some(","));

        let short_rows = parse(b"a,b\n1\n2,3\n").unwrap();
        assert_eq!(short_rows.row_count, 2);
    }

    #[test]
    fn test_semicolon_and_quotes() {
        let meta = parse(b"name;note\r\n\"Smith; J\";\"said \"\"hi\"\"\nthen left\"\r\nDoe;ok\r\n").unwrap();
        assert_eq!(meta.headers, vec!["name", "note"]);
        assert_eq!(meta.row_count, 2);
        assert_eq!(meta.delimiter.as_deref(), Some(";"));
    }

    #[test]
    fn test_bom_and_latin1() {
        let meta = parse(b"\xEF\xBB\xBFa,b\n1,2\n").unwrap();
        assert_eq!(meta.headers, vec!["a", "b"]);

        let meta = parse(b"caf\xE9,prix\nx,1\n").unwrap();
        assert_eq!(meta.headers[0], "café");
        assert_eq!(meta.encoding.as_deref(), Some("ISO-8859-1"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse(b""), Err(ParseError::Empty));
        assert_eq!(parse(b"\n\n"), Err(ParseError::Empty));
        assert_eq!(
            parse(b"a,b\n1,2,3\n"),
            Err(ParseError::FieldMismatch {
                row: 2,
                expected: 2,
                found: 3
            })
        );
        assert_eq!(parse(b"a,b\n\"open,1\n"), Err(ParseError::UnterminatedQuote(2)));
        assert!(matches!(
            CsvMetadataExtractor.parse_tabular(b"PK..", "application/vnd.ms-excel"),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn test_media_type_helpers() {
        assert_eq!(guess_media_type("Sales.CSV"), "text/csv");
        assert!(is_tabular_media_type(guess_media_type("book.xlsx")));
        assert!(!is_tabular_media_type("image/png"));
    }

    #[test]
    fn test_describe() {
        let meta = TabularMetadata {
            headers: vec!["a".into(), "b".into()],
            row_count: 3,
            encoding: Some("UTF-8".into()),
            ..Default::default()
        };
        assert_eq!(meta.describe(), "Columns (2): a, b\nRows: 3\nEncoding: UTF-8");
    }
}
