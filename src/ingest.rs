use crate::config::{DelimiterChoice, SNIFF_SAMPLE_BYTES};
use crate::models::Row;
use anyhow::{Context, Result};
use csv::ReaderBuilder;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use tracing::{debug, info};

const SNIFF_CANDIDATES: &[u8] = b",;\t|";

/// Picks the most frequent candidate delimiter on the header line of
/// `sample`. Defaults to comma when nothing matches.
pub fn sniff_delimiter(sample: &[u8]) -> u8 {
    let header = sample
        .split(|&b| b == b'\n')
        .next()
        .unwrap_or_default();

    let mut best = (b',', 0usize);
    for &candidate in SNIFF_CANDIDATES {
        let count = count_outside_quotes(header, candidate);
        if count > best.1 {
            best = (candidate, count);
        }
    }
    best.0
}

fn count_outside_quotes(line: &[u8], needle: u8) -> usize {
    let mut in_quotes = false;
    let mut count = 0;
    for &b in line {
        if b == b'"' {
            in_quotes = !in_quotes;
        } else if b == needle && !in_quotes {
            count += 1;
        }
    }
    count
}

pub fn detect_delimiter(path: &Path, choice: DelimiterChoice) -> Result<u8> {
    if let Some(fixed) = choice.fixed() {
        return Ok(fixed);
    }

    let file =
        File::open(path).with_context(|| format!("Failed to open CSV: {}", path.display()))?;
    let mut sample = Vec::with_capacity(SNIFF_SAMPLE_BYTES);
    file.take(SNIFF_SAMPLE_BYTES as u64)
        .read_to_end(&mut sample)
        .with_context(|| format!("Failed to read CSV: {}", path.display()))?;

    let delimiter = sniff_delimiter(&sample);
    debug!(delimiter = %(delimiter as char).escape_default(), "Sniffed CSV delimiter");
    Ok(delimiter)
}

/// Trims, strips a byte-order mark and collapses runs of spaces.
pub fn normalize_header(raw: &str) -> String {
    let trimmed = raw.trim_start_matches('\u{feff}').trim();
    let mut out = String::with_capacity(trimmed.len());
    let mut prev_space = false;
    for c in trimmed.chars() {
        if c == ' ' {
            if !prev_space {
                out.push(c);
            }
            prev_space = true;
        } else {
            out.push(c);
            prev_space = false;
        }
    }
    out
}

/// Reads every record as text. Short rows are padded with empty cells.
pub fn read_rows_from<R: Read>(reader: R, delimiter: u8) -> Result<Vec<Row>> {
    let mut csv_reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);

    let headers: Vec<String> = csv_reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(normalize_header)
        .collect();

    let mut rows = Vec::new();
    for (line, result) in csv_reader.records().enumerate() {
        let record = result.with_context(|| format!("Malformed CSV record {}", line + 1))?;
        let row: Row = headers
            .iter()
            .enumerate()
            .map(|(i, header)| (header.clone(), record.get(i).unwrap_or_default().to_string()))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

pub fn read_rows(path: &Path, choice: DelimiterChoice) -> Result<Vec<Row>> {
    let delimiter = detect_delimiter(path, choice)?;
    let file =
        File::open(path).with_context(|| format!("Failed to open CSV: {}", path.display()))?;
    let rows = read_rows_from(BufReader::new(file), delimiter)
        .with_context(|| format!("Failed to parse CSV: {}", path.display()))?;
    info!(rows = rows.len(), path = %path.display(), "CSV loaded");
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn sniffs_common_delimiters() {
        assert_eq!(sniff_delimiter(b"Title;Creator;Date\nA;B;C"), b';');
        assert_eq!(sniff_delimiter(b"Title\tCreator\nA\tB"), b'\t');
        assert_eq!(sniff_delimiter(b"Title,Creator\nA,B"), b',');
        assert_eq!(sniff_delimiter(b"Title"), b',');
        assert_eq!(sniff_delimiter(b""), b',');
    }

    #[test]
    fn sniff_ignores_quoted_separators() {
        assert_eq!(sniff_delimiter(b"\"Title, full\";\"Date, approx\";Id\n"), b';');
    }

    #[test]
    fn header_normalization() {
        assert_eq!(normalize_header("  Title (EN) "), "Title (EN)");
        assert_eq!(normalize_header("Files  (if   available)"), "Files (if available)");
        assert_eq!(normalize_header("\u{feff}Title"), "Title");
    }

    #[test]
    fn ragged_rows_are_padded() {
        let data = "Title,Creator,Date\nMask,Unknown\nDrum,,1900\n";
        let rows = read_rows_from(data.as_bytes(), b',').unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("Date"), Some(""));
        assert_eq!(rows[1].get("Creator"), Some(""));
        assert_eq!(rows[1].get("Date"), Some("1900"));
    }

    #[test]
    fn read_rows_with_auto_delimiter() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, " Title  (EN) ;Tags\nMask;a, b\n").unwrap();
        file.flush().unwrap();

        let rows = read_rows(file.path(), DelimiterChoice::Auto).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("Title (EN)"), Some("Mask"));
        assert_eq!(rows[0].get("Tags"), Some("a, b"));
    }

    #[test]
    fn fixed_delimiter_skips_sniffing() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "Title|Date\nMask|1890\n").unwrap();
        file.flush().unwrap();

        let rows = read_rows(file.path(), DelimiterChoice::Other(b'|')).unwrap();
        assert_eq!(rows[0].get("Date"), Some("1890"));
    }

    #[test]
    fn missing_file_is_an_error() {
        let result = read_rows(Path::new("/definitely/not/here.csv"), DelimiterChoice::Comma);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Failed to open CSV"));
    }
}
