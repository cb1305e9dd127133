use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::domain::RecipientName;

/// How much of the input is inspected when the delimiter has to be guessed.
pub const SNIFF_SAMPLE_BYTES: usize = 10_000;

/// Share of sampled lines that must agree on a delimiter count.
const MIN_CONSISTENCY: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delimiter {
    Comma,
    Semicolon,
    Tab,
    Pipe,
}

impl Delimiter {
    /// Tie-break order when several candidates are equally consistent
    const PREFERENCE: [Delimiter; 4] = [
        Delimiter::Comma,
        Delimiter::Tab,
        Delimiter::Semicolon,
        Delimiter::Pipe,
    ];

    pub fn as_byte(self) -> u8 {
        match self {
            Delimiter::Comma => b',',
            Delimiter::Semicolon => b';',
            Delimiter::Tab => b'\t',
            Delimiter::Pipe => b'|',
        }
    }

    fn as_char(self) -> char {
        self.as_byte() as char
    }
}

impl Display for Delimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Delimiter::Tab => f.write_str("\\t"),
            other => write!(f, "{}", other.as_char()),
        }
    }
}

impl FromStr for Delimiter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "," | "comma" => Ok(Delimiter::Comma),
            ";" | "semicolon" => Ok(Delimiter::Semicolon),
            "\t" | "\\t" | "tab" => Ok(Delimiter::Tab),
            "|" | "pipe" => Ok(Delimiter::Pipe),
            other => Err(format!(
                "{} is not a supported delimiter. Use one of: , ; tab |",
                other
            )),
        }
    }
}

/// `"auto"` (or a blank value) asks for the delimiter to be sniffed.
pub fn parse_delimiter_hint(s: &str) -> Result<Option<Delimiter>, String> {
    match s.trim_matches(' ') {
        "" | "auto" => Ok(None),
        other => other.parse().map(Some),
    }
}

pub fn deserialize_delimiter_hint<'de, D>(deserializer: D) -> Result<Option<Delimiter>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hint: Option<String> = serde::Deserialize::deserialize(deserializer)?;
    match hint {
        Some(hint) => parse_delimiter_hint(&hint).map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    pub name: RecipientName,
    pub raw_email: String,
}

#[derive(Debug, Clone)]
pub struct Roster {
    pub rows: Vec<Row>,
    /// The delimiter the input was actually parsed with
    pub delimiter: Delimiter,
    pub columns: Vec<String>,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn preview(&self, n: usize) -> &[Row] {
        &self.rows[..n.min(self.rows.len())]
    }
}

#[derive(thiserror::Error, Debug)]
pub enum RosterError {
    #[error(
        "Column(s) not found: {}. Available columns: {}",
        .missing.join(", "),
        .found.join(", ")
    )]
    MissingColumns {
        missing: Vec<String>,
        found: Vec<String>,
    },
    #[error("Failed to read the roster")]
    Malformed(#[from] csv::Error),
}

/// Guesses the delimiter from a text sample.
///
/// Every candidate is counted per line, ignoring occurrences inside double
/// quotes. A candidate qualifies when the most common per-line count is
/// non-zero and shared by at least 90% of the lines. Returns `None` when no
/// candidate qualifies.
pub fn sniff_delimiter(sample: &str) -> Option<Delimiter> {
    let lines: Vec<&str> = sample.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return None;
    }

    let mut best: Option<(Delimiter, f64)> = None;
    for candidate in Delimiter::PREFERENCE {
        let mut frequencies: HashMap<usize, usize> = HashMap::new();
        for line in &lines {
            *frequencies
                .entry(count_outside_quotes(line, candidate.as_char()))
                .or_default() += 1;
        }

        let (modal_count, hits) = match frequencies
            .into_iter()
            .max_by_key(|&(count, hits)| (hits, count))
        {
            Some(mode) => mode,
            None => continue,
        };
        if modal_count == 0 {
            continue;
        }

        let consistency = hits as f64 / lines.len() as f64;
        if consistency < MIN_CONSISTENCY {
            continue;
        }
        // Strictly greater keeps the earlier, preferred candidate on ties
        if best.map_or(true, |(_, current)| consistency > current) {
            best = Some((candidate, consistency));
        }
    }

    best.map(|(delimiter, _)| delimiter)
}

fn count_outside_quotes(line: &str, delimiter: char) -> usize {
    let mut quoted = false;
    let mut count = 0;
    for c in line.chars() {
        if c == '"' {
            quoted = !quoted;
        } else if c == delimiter && !quoted {
            count += 1;
        }
    }
    count
}

/// The leading slice of the input used for sniffing, cut back to the last
/// complete line when the input is longer than the sample.
fn sniff_sample(input: &[u8]) -> String {
    let mut sample = &input[..input.len().min(SNIFF_SAMPLE_BYTES)];
    if input.len() > SNIFF_SAMPLE_BYTES {
        if let Some(end) = sample.iter().rposition(|&b| b == b'\n') {
            sample = &sample[..end];
        }
    }
    String::from_utf8_lossy(sample).into_owned()
}

/// Parses the roster, sniffing the delimiter when none is given (comma when
/// sniffing fails). Rows where either required field is blank are dropped.
#[tracing::instrument(
    name = "Read roster",
    skip(input),
    fields(bytes = input.len(), delimiter = tracing::field::Empty)
)]
pub fn read_roster(
    input: &[u8],
    delimiter: Option<Delimiter>,
    name_column: &str,
    email_column: &str,
) -> Result<Roster, RosterError> {
    let delimiter = match delimiter {
        Some(delimiter) => delimiter,
        None => sniff_delimiter(&sniff_sample(input)).unwrap_or_else(|| {
            tracing::debug!("Could not detect the delimiter, falling back to comma");
            Delimiter::Comma
        }),
    };
    tracing::Span::current().record("delimiter", &tracing::field::display(&delimiter));

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter.as_byte())
        .has_headers(true)
        .flexible(true)
        .from_reader(input);

    let columns: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, header)| match i {
            0 => header.trim_start_matches('\u{feff}').to_owned(),
            _ => header.to_owned(),
        })
        .collect();

    let position = |column: &str| columns.iter().position(|c| c == column);
    let (name_index, email_index) = match (position(name_column), position(email_column)) {
        (Some(name_index), Some(email_index)) => (name_index, email_index),
        (name_index, email_index) => {
            let mut missing = Vec::new();
            if name_index.is_none() {
                missing.push(name_column.to_owned());
            }
            if email_index.is_none() {
                missing.push(email_column.to_owned());
            }
            return Err(RosterError::MissingColumns {
                missing,
                found: columns,
            });
        }
    };

    let mut rows = Vec::new();
    let mut dropped = 0usize;
    for record in reader.records() {
        let record = record?;
        let name = RecipientName::parse(record.get(name_index).unwrap_or_default());
        let raw_email = record.get(email_index).unwrap_or_default().trim();
        match name {
            Some(name) if !raw_email.is_empty() => rows.push(Row {
                name,
                raw_email: raw_email.to_owned(),
            }),
            _ => dropped += 1,
        }
    }

    tracing::info!(rows = rows.len(), dropped, "Roster loaded");
    Ok(Roster {
        rows,
        delimiter,
        columns,
    })
}
