//! Rule-based field parsing of raw OCR text for national ID layouts.

use chrono::NaiveDate;

use super::text::{
    alnum_tokens, classify_by_arithmetic, control_letter_ok, document_number_shape, find_dates,
    title_case, DateRole,
};
use super::PartialIdData;
use crate::types::Sex;

const SURNAME_LABELS: &[&str] = &["APELLIDOS", "APELLIDO", "SURNAME", "SURNAMES", "COGNOMS"];
const GIVEN_NAME_LABELS: &[&str] = &["NOMBRE", "NOMBRES", "NAME", "NAMES", "GIVEN", "FORENAMES"];
const SEX_LABELS: &[&str] = &["SEXO", "SEX", "SEXE"];

const BIRTH_LABELS: &[&str] = &["NACIMIENTO", "BIRTH", "NAC", "NAIXEMENT"];
const EXPIRY_LABELS: &[&str] = &[
    "VALIDEZ",
    "CADUCIDAD",
    "EXPIRY",
    "EXPIRATION",
    "EXPIRES",
    "HASTA",
    "VALID",
];
const ISSUE_LABELS: &[&str] = &["EXPEDICIÓN", "EXPEDICION", "EMISIÓN", "EMISION", "ISSUE"];

/// Printed words that look like names to a naive all-caps scan.
const BOILERPLATE: &[&str] = &[
    "APELLIDOS", "APELLIDO", "SURNAME", "SURNAMES", "COGNOMS", "NOMBRE", "NOMBRES", "NAME",
    "NAMES", "GIVEN", "FORENAMES", "DOCUMENTO", "NACIONAL", "IDENTIDAD", "ESPAÑA", "ESPANA",
    "REINO", "KINGDOM", "SPAIN", "IDENTITY", "CARD", "PASSPORT", "PASAPORTE", "PERMISO",
    "RESIDENCIA", "RESIDENCE", "PERMIT", "SEXO", "SEX", "NACIONALIDAD", "NATIONALITY", "FECHA",
    "DATE", "NACIMIENTO", "BIRTH", "VALIDEZ", "EXPIRY", "DNI", "NUM", "SOPORTE", "EQUIPO",
    "EXPEDICIÓN", "EXPEDICION", "DE", "DEL", "ESP", "TIPO", "CLASE",
];

fn is_boilerplate(token: &str) -> bool {
    BOILERPLATE.contains(&token)
}

/// Tokens made of letters and hyphens, for name scanning.
fn name_tokens(line: &str) -> Vec<&str> {
    line.split(|c: char| !(c.is_alphabetic() || c == '-'))
        .map(|t| t.trim_matches('-'))
        .filter(|t| !t.is_empty())
        .collect()
}

fn is_name_token(token: &str) -> bool {
    let letters = token.chars().filter(|c| c.is_alphabetic()).count();
    letters >= 2
        && token
            .chars()
            .all(|c| c == '-' || (c.is_alphabetic() && !c.is_lowercase()))
        && !is_boilerplate(token)
}

/// Leading labels are skipped, then consecutive all-caps tokens are taken.
fn collect_name(tokens: &[&str]) -> Option<String> {
    let name: Vec<&str> = tokens
        .iter()
        .skip_while(|t| is_boilerplate(t))
        .take_while(|t| is_name_token(t))
        .take(4)
        .copied()
        .collect();
    if name.is_empty() {
        None
    } else {
        Some(title_case(&name.join(" ")))
    }
}

fn find_labelled_name(lines: &[&str], labels: &[&str]) -> Option<String> {
    for (i, line) in lines.iter().enumerate() {
        let tokens = name_tokens(line);
        let Some(pos) = tokens.iter().position(|t| labels.contains(t)) else {
            continue;
        };
        if let Some(name) = collect_name(&tokens[pos + 1..]) {
            return Some(name);
        }
        if let Some(next) = lines.get(i + 1) {
            if let Some(name) = collect_name(&name_tokens(next)) {
                return Some(name);
            }
        }
    }
    None
}

fn find_document_number(lines: &[&str], out: &mut PartialIdData) {
    let mut first = None;
    for token in lines.iter().flat_map(|l| alnum_tokens(l)) {
        let Some(doc_type) = document_number_shape(token) else {
            continue;
        };
        if control_letter_ok(token) {
            out.document_number = Some(token.to_string());
            out.document_type = Some(doc_type);
            return;
        }
        if first.is_none() {
            first = Some((token.to_string(), doc_type));
        }
    }
    if let Some((number, doc_type)) = first {
        out.document_number = Some(number);
        out.document_type = Some(doc_type);
    }
}

fn is_country_code(token: &str) -> bool {
    token.len() == 3 && token.bytes().all(|b| b.is_ascii_uppercase()) && token != "SEX"
}

fn sex_token(token: &str) -> Option<Sex> {
    match token {
        "M" => Some(Sex::M),
        "F" => Some(Sex::F),
        _ => None,
    }
}

fn find_sex_and_nationality(lines: &[&str], out: &mut PartialIdData) {
    // A lone M/F next to a three-letter country code, e.g. "F ESP".
    for line in lines {
        let tokens: Vec<&str> = alnum_tokens(line).collect();
        for (i, token) in tokens.iter().enumerate() {
            let Some(sex) = sex_token(token) else {
                continue;
            };
            let neighbour = [i.checked_sub(1), Some(i + 1)]
                .into_iter()
                .flatten()
                .filter_map(|j| tokens.get(j))
                .find(|t| is_country_code(t));
            if let Some(code) = neighbour {
                out.sex = Some(sex);
                out.nationality = Some((*code).to_string());
                return;
            }
        }
    }

    // Explicit label, value on the same line or the next.
    for (i, line) in lines.iter().enumerate() {
        let tokens: Vec<String> = alnum_tokens(line).map(str::to_uppercase).collect();
        let Some(pos) = tokens.iter().position(|t| SEX_LABELS.contains(&t.as_str())) else {
            continue;
        };
        let same_line = tokens[pos + 1..].iter().find_map(|t| sex_token(t));
        let next_line = || {
            lines
                .get(i + 1)
                .and_then(|next| alnum_tokens(next).find_map(sex_token))
        };
        if let Some(sex) = same_line.or_else(next_line) {
            out.sex = Some(sex);
            return;
        }
    }
}

fn label_role(context: &str) -> Option<DateRole> {
    let last_pos = |labels: &[&str]| labels.iter().filter_map(|l| context.rfind(l)).max();
    let candidates = [
        (last_pos(BIRTH_LABELS), DateRole::Birth),
        (last_pos(EXPIRY_LABELS), DateRole::Expiry),
        (last_pos(ISSUE_LABELS), DateRole::Other),
    ];
    candidates
        .into_iter()
        .filter_map(|(pos, role)| pos.map(|p| (p, role)))
        .max_by_key(|(p, _)| *p)
        .map(|(_, role)| role)
}

fn roles_in(context: &str) -> usize {
    [BIRTH_LABELS, EXPIRY_LABELS, ISSUE_LABELS]
        .iter()
        .filter(|labels| labels.iter().any(|l| context.contains(l)))
        .count()
}

fn find_dates_with_roles(lines: &[&str], today: NaiveDate, out: &mut PartialIdData) {
    for (i, line) in lines.iter().enumerate() {
        for m in find_dates(line) {
            let before = line[..m.offset].to_uppercase();
            let role = label_role(&before)
                .or_else(|| {
                    // A previous line mixing several labels is a two-column
                    // header; it says nothing about this particular date.
                    let prev = i.checked_sub(1).map(|p| lines[p].to_uppercase())?;
                    if roles_in(&prev) == 1 {
                        label_role(&prev)
                    } else {
                        None
                    }
                })
                .unwrap_or_else(|| classify_by_arithmetic(m.date, today));

            match role {
                DateRole::Birth if out.date_of_birth.is_none() => {
                    out.date_of_birth = Some(m.date);
                }
                DateRole::Expiry => {
                    if out.expiration_date.map_or(true, |d| m.date > d) {
                        out.expiration_date = Some(m.date);
                    }
                }
                _ => {}
            }
        }
    }
}

/// Parse national-ID fields out of OCR text.
pub fn parse(text: &str, today: NaiveDate) -> PartialIdData {
    let lines: Vec<&str> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();

    let mut out = PartialIdData::default();
    find_document_number(&lines, &mut out);
    out.last_name = find_labelled_name(&lines, SURNAME_LABELS);
    out.first_name = find_labelled_name(&lines, GIVEN_NAME_LABELS);
    find_sex_and_nationality(&lines, &mut out);
    find_dates_with_roles(&lines, today, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocumentType;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    const DNI_FRONT: &str = "\
REINO DE ESPAÑA
DOCUMENTO NACIONAL DE IDENTIDAD
APELLIDOS / SURNAME
MARTÍNEZ GARCÍA
NOMBRE / NAME
ANA MARÍA
SEXO NACIONALIDAD
F ESP
FECHA DE NACIMIENTO
01 01 1980
VALIDEZ
01 01 2031
DNI 12345678Z
";

    #[test]
    fn parses_spanish_front() {
        let out = parse(DNI_FRONT, today());
        assert_eq!(out.document_number.as_deref(), Some("12345678Z"));
        assert_eq!(out.document_type, Some(DocumentType::NationalId));
        assert_eq!(out.last_name.as_deref(), Some("Martínez García"));
        assert_eq!(out.first_name.as_deref(), Some("Ana María"));
        assert_eq!(out.sex, Some(Sex::F));
        assert_eq!(out.nationality.as_deref(), Some("ESP"));
        assert_eq!(out.date_of_birth, NaiveDate::from_ymd_opt(1980, 1, 1));
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2031, 1, 1));
    }

    #[test]
    fn names_on_label_line() {
        let out = parse("SURNAME MARTINEZ\nGIVEN NAMES ANA\n", today());
        assert_eq!(out.last_name.as_deref(), Some("Martinez"));
        assert_eq!(out.first_name.as_deref(), Some("Ana"));
    }

    #[test]
    fn boilerplate_is_not_a_name() {
        let out = parse("NOMBRE\nDOCUMENTO NACIONAL\n", today());
        assert_eq!(out.first_name, None);
    }

    #[test]
    fn lowercase_words_are_not_names() {
        let out = parse("NOMBRE\nana maria\n", today());
        assert_eq!(out.first_name, None);
    }

    #[test]
    fn residence_permit_number() {
        let out = parse("NIE X1234567L\n", today());
        assert_eq!(out.document_number.as_deref(), Some("X1234567L"));
        assert_eq!(out.document_type, Some(DocumentType::ResidencePermit));
    }

    #[test]
    fn prefers_valid_control_letter() {
        let out = parse("SOPORTE 11111111A\nDNI 12345678Z\n", today());
        assert_eq!(out.document_number.as_deref(), Some("12345678Z"));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let out = parse("1234567Z 123456789 DNI12345678Z\n", today());
        assert_eq!(out.document_number, None);
    }

    #[test]
    fn unlabelled_dates_use_arithmetic() {
        let out = parse("x 14.03.1975 y 20/09/2019 z 02-02-2033\n", today());
        assert_eq!(out.date_of_birth, NaiveDate::from_ymd_opt(1975, 3, 14));
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2033, 2, 2));
    }

    #[test]
    fn issue_date_label_is_ignored() {
        let out = parse("EXPEDICIÓN 01 01 2031\n", today());
        assert_eq!(out.expiration_date, None);
        assert_eq!(out.date_of_birth, None);
    }

    #[test]
    fn two_column_header_falls_back_to_arithmetic() {
        let out = parse("FECHA DE NACIMIENTO   VALIDEZ\n03 04 1990   05 06 2030\n", today());
        assert_eq!(out.date_of_birth, NaiveDate::from_ymd_opt(1990, 4, 3));
        assert_eq!(out.expiration_date, NaiveDate::from_ymd_opt(2030, 6, 5));
    }

    #[test]
    fn sex_from_label() {
        let out = parse("SEXO\nM\n", today());
        assert_eq!(out.sex, Some(Sex::M));
        assert_eq!(out.nationality, None);
    }
}
