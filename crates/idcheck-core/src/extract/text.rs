//! Text helpers shared by the rule-based and MRZ parsers.

use chrono::{Datelike, NaiveDate};

use crate::types::DocumentType;

/// Control letters for Spanish DNI/NIE numbers, indexed by `number % 23`.
const DNI_LETTERS: &[u8; 23] = b"TRWAGMYFPDXBNJZSQVHLCKE";

/// Title-case a name, keeping diacritics: `MARTÍNEZ GARCÍA` → `Martínez García`.
pub fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            word.split('-')
                .map(|part| {
                    let mut chars = part.chars();
                    match chars.next() {
                        Some(first) => first
                            .to_uppercase()
                            .chain(chars.flat_map(char::to_lowercase))
                            .collect::<String>(),
                        None => String::new(),
                    }
                })
                .collect::<Vec<_>>()
                .join("-")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a line into alphanumeric tokens.
pub fn alnum_tokens(line: &str) -> impl Iterator<Item = &str> {
    line.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
}

/// Classify a token by the exact document-number shapes we accept.
///
/// `12345678Z` is a national ID; `X1234567L` is a residence permit.
pub fn document_number_shape(token: &str) -> Option<DocumentType> {
    let bytes = token.as_bytes();
    if bytes.len() != 9 || !bytes[8].is_ascii_uppercase() {
        return None;
    }
    if bytes[..8].iter().all(u8::is_ascii_digit) {
        return Some(DocumentType::NationalId);
    }
    if bytes[0].is_ascii_uppercase() && bytes[1..8].iter().all(u8::is_ascii_digit) {
        return Some(DocumentType::ResidencePermit);
    }
    None
}

/// Whether the trailing control letter matches the mod-23 checksum.
///
/// NIE prefixes X/Y/Z stand for 0/1/2. Other prefixes never validate.
pub fn control_letter_ok(number: &str) -> bool {
    let bytes = number.as_bytes();
    if bytes.len() != 9 {
        return false;
    }
    let prefix = match bytes[0] {
        b'X' => b'0',
        b'Y' => b'1',
        b'Z' => b'2',
        d if d.is_ascii_digit() => d,
        _ => return false,
    };
    let mut digits = String::with_capacity(8);
    digits.push(prefix as char);
    digits.push_str(&number[1..8]);
    match digits.parse::<u32>() {
        Ok(n) => DNI_LETTERS[(n % 23) as usize] == bytes[8],
        Err(_) => false,
    }
}

/// A `DD?MM?YYYY` date found in a line, with the byte offset it starts at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateMatch {
    pub date: NaiveDate,
    pub offset: usize,
}

fn is_date_separator(c: u8) -> bool {
    matches!(c, b' ' | b'/' | b'-' | b'.')
}

/// Find all `DD·MM·YYYY` dates in a line, separators in {space, / , -, .}.
pub fn find_dates(line: &str) -> Vec<DateMatch> {
    let bytes = line.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i + 10 <= bytes.len() {
        let w = &bytes[i..i + 10];
        let preceded_by_digit = i > 0 && bytes[i - 1].is_ascii_digit();
        let followed_by_digit = bytes.get(i + 10).is_some_and(u8::is_ascii_digit);
        let shape_ok = w[0].is_ascii_digit()
            && w[1].is_ascii_digit()
            && is_date_separator(w[2])
            && w[3].is_ascii_digit()
            && w[4].is_ascii_digit()
            && is_date_separator(w[5])
            && w[6..].iter().all(u8::is_ascii_digit);
        if shape_ok && !preceded_by_digit && !followed_by_digit {
            let num = |s: &[u8]| -> u32 {
                s.iter().fold(0, |acc, d| acc * 10 + u32::from(d - b'0'))
            };
            if let Some(date) =
                NaiveDate::from_ymd_opt(num(&w[6..10]) as i32, num(&w[3..5]), num(&w[0..2]))
            {
                out.push(DateMatch { date, offset: i });
                i += 10;
                continue;
            }
        }
        i += 1;
    }
    out
}

/// Parse a free-form date as returned by the remote service.
pub fn parse_loose_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    find_dates(raw).first().map(|m| m.date)
}

/// Expand a two-digit MRZ year: `yy > 50` → 19yy, else 20yy.
pub fn expand_mrz_year(yy: u32) -> i32 {
    if yy > 50 {
        1900 + yy as i32
    } else {
        2000 + yy as i32
    }
}

/// Parse a `YYMMDD` string using [`expand_mrz_year`].
pub fn parse_yymmdd(digits: &str) -> Option<NaiveDate> {
    if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let yy: u32 = digits[0..2].parse().ok()?;
    let mm: u32 = digits[2..4].parse().ok()?;
    let dd: u32 = digits[4..6].parse().ok()?;
    NaiveDate::from_ymd_opt(expand_mrz_year(yy), mm, dd)
}

/// Birth dates on documents we read predate this year.
pub const BIRTH_YEAR_CUTOFF: i32 = 2010;

/// Date arithmetic fallback when no label says what a date is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateRole {
    Birth,
    Expiry,
    Other,
}

pub fn classify_by_arithmetic(date: NaiveDate, today: NaiveDate) -> DateRole {
    if date > today {
        DateRole::Expiry
    } else if date.year() < BIRTH_YEAR_CUTOFF {
        DateRole::Birth
    } else {
        DateRole::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_case_keeps_diacritics() {
        assert_eq!(title_case("MARTÍNEZ GARCÍA"), "Martínez García");
        assert_eq!(title_case("ANA-MARÍA"), "Ana-María");
        assert_eq!(title_case("  núñez "), "Núñez");
    }

    #[test]
    fn document_number_shapes() {
        assert_eq!(
            document_number_shape("12345678Z"),
            Some(DocumentType::NationalId)
        );
        assert_eq!(
            document_number_shape("X1234567L"),
            Some(DocumentType::ResidencePermit)
        );
        assert_eq!(document_number_shape("1234567Z"), None);
        assert_eq!(document_number_shape("123456789"), None);
        assert_eq!(document_number_shape("BAA000589"), None);
        assert_eq!(document_number_shape("12345678z"), None);
    }

    #[test]
    fn control_letters() {
        assert!(control_letter_ok("12345678Z"));
        assert!(!control_letter_ok("12345678A"));
        assert!(control_letter_ok("X1234567L"));
        assert!(!control_letter_ok("A1234567L"));
    }

    #[test]
    fn finds_dates_with_any_separator() {
        let found = find_dates("NAC 01 01 1980 VAL 31/12-2031 x 05.06.2019");
        let dates: Vec<_> = found.iter().map(|m| m.date.to_string()).collect();
        assert_eq!(dates, vec!["1980-01-01", "2031-12-31", "2019-06-05"]);
    }

    #[test]
    fn rejects_impossible_dates_and_longer_runs() {
        assert!(find_dates("31 02 1990").is_empty());
        assert!(find_dates("101 01 19801").is_empty());
    }

    #[test]
    fn mrz_century_heuristic() {
        assert_eq!(expand_mrz_year(80), 1980);
        assert_eq!(expand_mrz_year(50), 2050);
        assert_eq!(expand_mrz_year(51), 1951);
        assert_eq!(
            parse_yymmdd("310101"),
            NaiveDate::from_ymd_opt(2031, 1, 1)
        );
        assert_eq!(parse_yymmdd("801301"), None);
    }

    #[test]
    fn loose_dates() {
        assert_eq!(
            parse_loose_date("1990-04-12"),
            NaiveDate::from_ymd_opt(1990, 4, 12)
        );
        assert_eq!(
            parse_loose_date("12/04/1990"),
            NaiveDate::from_ymd_opt(1990, 4, 12)
        );
        assert_eq!(parse_loose_date("unknown"), None);
    }

    #[test]
    fn arithmetic_classification() {
        let today = NaiveDate::from_ymd_opt(2026, 6, 1).unwrap();
        let d = |y, m, dd| NaiveDate::from_ymd_opt(y, m, dd).unwrap();
        assert_eq!(classify_by_arithmetic(d(1985, 3, 2), today), DateRole::Birth);
        assert_eq!(classify_by_arithmetic(d(2031, 3, 2), today), DateRole::Expiry);
        assert_eq!(classify_by_arithmetic(d(2021, 3, 2), today), DateRole::Other);
    }
}
