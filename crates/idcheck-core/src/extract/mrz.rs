//! Machine-readable zone parsing.
//!
//! Works on whatever text a strategy produced: lines that look like MRZ
//! (long, only `A-Z0-9<`, dense `<` filler) are picked out and mined for
//! fields. Results only ever fill gaps left by the other parsers.

use chrono::NaiveDate;

use super::text::{document_number_shape, parse_yymmdd, title_case};
use super::PartialIdData;
use crate::types::{DocumentType, Sex};

const MRZ_MIN_LEN: usize = 30;
const FILLER: u8 = b'<';

/// ICAO 9303 check digit (weights 7, 3, 1).
pub fn check_digit(field: &str) -> Option<u8> {
    const WEIGHTS: [u32; 3] = [7, 3, 1];
    let mut sum = 0u32;
    for (i, b) in field.bytes().enumerate() {
        let value = match b {
            b'0'..=b'9' => u32::from(b - b'0'),
            b'A'..=b'Z' => u32::from(b - b'A') + 10,
            FILLER => 0,
            _ => return None,
        };
        sum += value * WEIGHTS[i % 3];
    }
    Some((sum % 10) as u8 + b'0')
}

/// Normalize a candidate line: uppercase, spaces removed.
fn clean(line: &str) -> String {
    line.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}

fn is_mrz_line(line: &str) -> bool {
    line.len() >= MRZ_MIN_LEN
        && line
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == FILLER)
        && line.contains("<<")
}

/// Extract MRZ-shaped lines from free text.
pub fn mrz_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(clean)
        .filter(|l| is_mrz_line(l))
        .collect()
}

/// Digit runs as (start, end) byte ranges.
fn digit_runs(line: &str) -> Vec<(usize, usize)> {
    let bytes = line.as_bytes();
    let mut runs = Vec::new();
    let mut start = None;
    for (i, b) in bytes.iter().enumerate() {
        match (b.is_ascii_digit(), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, bytes.len()));
    }
    runs
}

/// A `YYMMDD` date and the byte range of its run (check digit included).
#[derive(Debug, Clone, Copy)]
struct MrzDate {
    date: NaiveDate,
    start: usize,
    end: usize,
}

fn find_dates(line: &str) -> Vec<MrzDate> {
    digit_runs(line)
        .into_iter()
        .filter_map(|(start, end)| {
            let run = &line[start..end];
            let date = match run.len() {
                6 => parse_yymmdd(run),
                7 if check_digit(&run[..6]) == Some(run.as_bytes()[6]) => {
                    parse_yymmdd(&run[..6])
                }
                _ => None,
            }?;
            Some(MrzDate { date, start, end })
        })
        .collect()
}

fn find_document_number(line: &str) -> Option<(String, DocumentType)> {
    let bytes = line.as_bytes();
    (0..bytes.len().saturating_sub(8)).find_map(|i| {
        let window = &line[i..i + 9];
        let boundary_ok = bytes.get(i + 9).map_or(true, |b| !b.is_ascii_alphabetic());
        match document_number_shape(window) {
            Some(DocumentType::NationalId) if boundary_ok => {
                Some((window.to_string(), DocumentType::NationalId))
            }
            _ => None,
        }
    })
}

fn find_sex(line: &str) -> Option<Sex> {
    let bytes = line.as_bytes();
    let flank = |b: u8| b == FILLER || b.is_ascii_digit();
    (1..bytes.len().saturating_sub(1)).find_map(|i| {
        if !(flank(bytes[i - 1]) && flank(bytes[i + 1])) {
            return None;
        }
        match bytes[i] {
            b'M' => Some(Sex::M),
            b'F' => Some(Sex::F),
            _ => None,
        }
    })
}

/// `SURNAME<<GIVEN<NAMES`, optionally behind a `P<UTO` style header.
fn find_names(line: &str) -> Option<(String, String)> {
    if line.bytes().any(|b| b.is_ascii_digit()) {
        return None;
    }
    let body = if line.starts_with('P') && line.len() >= 44 {
        &line[5..]
    } else {
        line
    };
    let (surname, given) = body.split_once("<<")?;
    let words = |s: &str| {
        s.split(FILLER as char)
            .filter(|w| !w.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    };
    let surname = words(surname);
    let given = words(given);
    if surname.len() < 2 {
        return None;
    }
    Some((title_case(&surname), title_case(&given)))
}

fn country_code(line: &str, start: usize) -> Option<String> {
    let code = line.get(start..start + 3)?;
    if code.bytes().all(|b| b.is_ascii_uppercase()) {
        Some(code.to_string())
    } else {
        None
    }
}

/// TD3 passport number: first nine characters of line two, then its check digit.
fn find_passport_number(line: &str) -> Option<String> {
    if line.len() < 44 {
        return None;
    }
    let field = line.get(0..9)?;
    let check = *line.as_bytes().get(9)?;
    if check_digit(field) != Some(check) {
        return None;
    }
    let number = field.trim_end_matches(FILLER as char);
    if number.len() < 6 || number.contains(FILLER as char) {
        return None;
    }
    Some(number.to_string())
}

/// Parse every MRZ line in `text`.
pub fn parse(text: &str, today: NaiveDate) -> PartialIdData {
    let lines = mrz_lines(text);
    let mut out = PartialIdData::default();
    if lines.is_empty() {
        return out;
    }

    if let Some(first) = lines.first() {
        out.document_type = if first.starts_with("ID") {
            Some(DocumentType::NationalId)
        } else if first.starts_with('P') {
            Some(DocumentType::Passport)
        } else {
            None
        };
    }

    for line in &lines {
        if out.document_number.is_none() {
            if let Some((number, doc_type)) = find_document_number(line) {
                out.document_number = Some(number);
                out.document_type.get_or_insert(doc_type);
            } else if out.document_type == Some(DocumentType::Passport) {
                out.document_number = find_passport_number(line);
            }
        }

        let dates = find_dates(line);
        if !dates.is_empty() {
            classify_dates(&dates, line, today, &mut out);
            if out.sex.is_none() {
                out.sex = find_sex(line);
            }
        }

        if out.last_name.is_none() {
            if let Some((surname, given)) = find_names(line) {
                out.last_name = Some(surname);
                if !given.is_empty() {
                    out.first_name = Some(given);
                }
            }
        }
    }

    out
}

fn classify_dates(dates: &[MrzDate], line: &str, today: NaiveDate, out: &mut PartialIdData) {
    let (past, future): (Vec<&MrzDate>, Vec<&MrzDate>) =
        dates.iter().partition(|d| d.date <= today);

    // Dates in the future can only be an expiry. Two past dates on one line
    // is an expired document: birth first, expiry second.
    let expiry = future.first().copied().or_else(|| {
        if past.len() >= 2 {
            past.last().copied()
        } else {
            None
        }
    });
    let birth = past.first().copied();

    if let Some(birth) = birth {
        out.date_of_birth.get_or_insert(birth.date);
        // TD3 puts the nationality right before the birth date.
        if out.nationality.is_none() && birth.start >= 3 {
            out.nationality = country_code(line, birth.start - 3);
        }
    }
    if let Some(expiry) = expiry {
        out.expiration_date.get_or_insert(expiry.date);
        // TD1 puts it right after the expiry check digit.
        if out.nationality.is_none() {
            out.nationality = country_code(line, expiry.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn pad(line: &str, len: usize) -> String {
        format!("{line:<<len$}")
    }

    fn td1() -> String {
        [
            pad("IDESPBAA000589599999999D", 30),
            "8001014F3101012ESP<<<<<<<<<<<6".to_string(),
            pad("MARTINEZ<GARCIA<<ANA<MARIA", 30),
        ]
        .join("\n")
    }

    fn td3() -> String {
        [
            pad("P<UTOERIKSSON<<ANNA<MARIA", 44),
            "L898902C36UTO7408122F3204153ZE184226B<<<<<10".to_string(),
        ]
        .join("\n")
    }

    #[test]
    fn icao_check_digits() {
        assert_eq!(check_digit("740812"), Some(b'2'));
        assert_eq!(check_digit("L898902C3"), Some(b'6'));
        assert_eq!(check_digit("a"), None);
    }

    #[test]
    fn detects_mrz_lines_only() {
        let text = "DOCUMENTO NACIONAL DE IDENTIDAD\nI D E S P BAA000589599999999D<<<<<<\nshort<<\n";
        let lines = mrz_lines(text);
        assert_eq!(lines, vec!["IDESPBAA000589599999999D<<<<<<".to_string()]);
    }

    #[test]
    fn parses_td1() {
        let out = parse(&td1(), today());
        assert_eq!(out.document_type, Some(DocumentType::NationalId));
        assert_eq!(out.document_number.as_deref(), Some("99999999D"));
        assert_eq!(out.date_of_birth, NaiveDate::from_ymd_opt(1980, 1, 1));
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2031, 1, 1));
        assert_eq!(out.sex, Some(Sex::F));
        assert_eq!(out.nationality.as_deref(), Some("ESP"));
        assert_eq!(out.last_name.as_deref(), Some("Martinez Garcia"));
        assert_eq!(out.first_name.as_deref(), Some("Ana Maria"));
    }

    #[test]
    fn parses_td3() {
        let out = parse(&td3(), today());
        assert_eq!(out.document_type, Some(DocumentType::Passport));
        assert_eq!(out.document_number.as_deref(), Some("L898902C3"));
        assert_eq!(out.last_name.as_deref(), Some("Eriksson"));
        assert_eq!(out.first_name.as_deref(), Some("Anna Maria"));
        assert_eq!(out.date_of_birth, NaiveDate::from_ymd_opt(1974, 8, 12));
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2032, 4, 15));
        assert_eq!(out.sex, Some(Sex::F));
        assert_eq!(out.nationality.as_deref(), Some("UTO"));
    }

    #[test]
    fn expired_document_keeps_birth_first() {
        let text = format!("8001014F2001012ESP<<<<<<<<<<<6\n{}", pad("X", 30));
        let out = parse(&text, today());
        assert_eq!(out.date_of_birth, NaiveDate::from_ymd_opt(1980, 1, 1));
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2020, 1, 1));
        assert_eq!(out.last_name, None);
    }

    #[test]
    fn bad_check_digit_rejects_date() {
        let out = parse("8001019F3101012ESP<<<<<<<<<<<6\n", today());
        assert_eq!(out.date_of_birth, None);
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2031, 1, 1));
    }

    #[test]
    fn no_mrz_yields_nothing() {
        let out = parse("APELLIDOS\nMARTINEZ\n", today());
        assert_eq!(out, PartialIdData::default());
    }
}
