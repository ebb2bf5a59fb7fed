//! Address canonicalization and dedupe-key derivation.
//!
//! The dedupe key is the cross-source identity of a property. Two raw
//! addresses that differ only in case, whitespace, punctuation, USPS
//! abbreviations, or township/borough suffixes must produce the same key.

use serde::{Deserialize, Serialize};
use strsim::levenshtein;

const SUFFIXES: &[(&str, &str)] = &[
    ("st", "street"),
    ("ave", "avenue"),
    ("av", "avenue"),
    ("rd", "road"),
    ("blvd", "boulevard"),
    ("dr", "drive"),
    ("ln", "lane"),
    ("ct", "court"),
    ("pl", "place"),
    ("hwy", "highway"),
    ("pkwy", "parkway"),
    ("rt", "route"),
    ("rte", "route"),
    ("cir", "circle"),
    ("ter", "terrace"),
];

const DIRECTIONS: &[(&str, &str)] = &[
    ("n", "north"),
    ("s", "south"),
    ("e", "east"),
    ("w", "west"),
    ("ne", "northeast"),
    ("nw", "northwest"),
    ("se", "southeast"),
    ("sw", "southwest"),
];

const UNIT_MARKERS: &[&str] = &["apt", "ste", "suite", "no", "unit"];

const ORDINAL_WORDS: &[(&str, &str)] = &[
    ("first", "1"),
    ("second", "2"),
    ("third", "3"),
    ("fourth", "4"),
    ("fifth", "5"),
    ("sixth", "6"),
    ("seventh", "7"),
    ("eighth", "8"),
    ("ninth", "9"),
    ("tenth", "10"),
    ("eleventh", "11"),
    ("twelfth", "12"),
];

const CITY_NOISE: &[&str] = &["twp", "township", "boro", "borough"];

/// Fully canonicalized address parts, ready for key derivation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalAddress {
    pub street_number: Option<String>,
    pub street_tokens: Vec<String>,
    pub unit: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl CanonicalAddress {
    /// `{state}-{zip}-{num}-{street}-{unit|nounit}`, lowercase alphanumeric
    /// segments joined by single dashes.
    pub fn dedupe_key(&self) -> String {
        let num = self.street_number.as_deref().unwrap_or("nonum");
        let street = if self.street_tokens.is_empty() {
            "nostreet".to_string()
        } else {
            self.street_tokens.join("-")
        };
        let unit = self.unit.as_deref().unwrap_or("nounit");
        let raw = format!("{}-{}-{}-{}-{}", self.state, self.zip, num, street, unit);
        key_clean(&raw)
    }

    pub fn street_line(&self) -> String {
        let mut parts = Vec::new();
        if let Some(num) = &self.street_number {
            parts.push(num.clone());
        }
        parts.extend(self.street_tokens.iter().cloned());
        parts.join(" ")
    }
}

/// Collapse a candidate key to `[a-z0-9]` segments joined by single dashes.
fn key_clean(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = true;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn transliterate(c: char) -> Option<char> {
    if c.is_ascii() {
        return Some(c);
    }
    match c {
        'á' | 'à' | 'â' | 'ä' | 'ã' | 'å' => Some('a'),
        'é' | 'è' | 'ê' | 'ë' => Some('e'),
        'í' | 'ì' | 'î' | 'ï' => Some('i'),
        'ó' | 'ò' | 'ô' | 'ö' | 'õ' => Some('o'),
        'ú' | 'ù' | 'û' | 'ü' => Some('u'),
        'ñ' => Some('n'),
        'ç' => Some('c'),
        _ => None,
    }
}

/// Stage 1: lowercase, transliterate, strip punctuation. `-` and `/` survive
/// only when adjacent to a digit; `#` survives for unit detection.
fn sanitize(text: &str) -> String {
    let lowered: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter_map(transliterate)
        .collect();
    let mut out = String::with_capacity(lowered.len());
    for (i, &c) in lowered.iter().enumerate() {
        match c {
            ',' | '.' | '\'' | '"' | ';' => out.push(' '),
            '-' | '/' => {
                let prev_digit = i > 0 && lowered[i - 1].is_ascii_digit();
                let next_digit = lowered.get(i + 1).is_some_and(|n| n.is_ascii_digit());
                if prev_digit || next_digit {
                    out.push(c);
                } else {
                    out.push(' ');
                }
            }
            _ => out.push(c),
        }
    }
    out
}

fn lookup(table: &[(&str, &str)], token: &str) -> Option<String> {
    table
        .iter()
        .find(|(abbr, _)| *abbr == token)
        .map(|(_, full)| full.to_string())
}

/// Stage 2: expand USPS suffix and directional abbreviations.
fn expand_token(token: &str) -> String {
    lookup(SUFFIXES, token)
        .or_else(|| lookup(DIRECTIONS, token))
        .unwrap_or_else(|| token.to_string())
}

/// Stage 3: ordinals to digits, number ranges to the first number.
fn normalize_numeric(token: &str) -> String {
    if let Some(word) = lookup(ORDINAL_WORDS, token) {
        return word;
    }
    // 1st / 2nd / 3rd / 4th -> bare digits
    if token.len() > 2 {
        let (digits, tail) = token.split_at(token.len() - 2);
        if matches!(tail, "st" | "nd" | "rd" | "th")
            && !digits.is_empty()
            && digits.chars().all(|c| c.is_ascii_digit())
        {
            return digits.to_string();
        }
    }
    // 123-125 -> 123
    if let Some((first, rest)) = token.split_once('-') {
        if !first.is_empty()
            && first.chars().all(|c| c.is_ascii_digit())
            && rest.chars().all(|c| c.is_ascii_digit() || c == '-')
        {
            return first.to_string();
        }
    }
    token.to_string()
}

fn is_zip(token: &str) -> Option<String> {
    let head = token.split('-').next().unwrap_or(token);
    if head.len() == 5 && head.chars().all(|c| c.is_ascii_digit()) {
        Some(head.to_string())
    } else {
        None
    }
}

fn is_state(token: &str) -> bool {
    token.len() == 2 && token.chars().all(|c| c.is_ascii_alphabetic())
}

struct StreetLine {
    number: Option<String>,
    tokens: Vec<String>,
    unit: Option<String>,
}

fn parse_street_line(line: &str) -> StreetLine {
    let sanitized = sanitize(line);
    let raw_tokens: Vec<&str> = sanitized.split_whitespace().collect();

    let mut number = None;
    let mut tokens = Vec::new();
    let mut unit = None;
    let mut pending_unit = false;

    for (i, tok) in raw_tokens.iter().enumerate() {
        let tok = tok.trim_matches('/');
        if tok.is_empty() {
            continue;
        }
        if pending_unit {
            unit = Some(key_clean(tok));
            pending_unit = false;
            continue;
        }
        if let Some(rest) = tok.strip_prefix('#') {
            if rest.is_empty() {
                pending_unit = true;
            } else {
                unit = Some(key_clean(rest));
            }
            continue;
        }
        if UNIT_MARKERS.contains(&tok) {
            pending_unit = true;
            continue;
        }
        if tok == "fl" || tok == "floor" {
            pending_unit = true;
            continue;
        }
        let tok = normalize_numeric(tok);
        if i == 0 && number.is_none() && tok.chars().all(|c| c.is_ascii_digit()) {
            number = Some(tok);
            continue;
        }
        tokens.push(expand_token(&tok));
    }

    StreetLine {
        number,
        tokens,
        unit,
    }
}

/// Stage 4: strip township/borough noise from the city.
fn canonical_city(segment: &str) -> String {
    sanitize(segment)
        .split_whitespace()
        .filter(|tok| !CITY_NOISE.contains(tok))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Canonicalize a raw single-line address.
///
/// Returns `None` when the line cannot be parsed beyond a zip code (no
/// street portion could be identified); the caller counts that as a
/// normalization skip.
pub fn canonicalize_address(raw: &str) -> Option<CanonicalAddress> {
    let segments: Vec<&str> = raw.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    if segments.is_empty() {
        return None;
    }

    // Locate state + zip, scanning tokens from the tail.
    let mut zip = None;
    let mut state = None;
    let mut tail_segment = segments.len();
    for (si, segment) in segments.iter().enumerate().rev() {
        for tok in segment.split_whitespace().rev() {
            if zip.is_none() {
                if let Some(z) = is_zip(tok) {
                    zip = Some(z);
                    tail_segment = si;
                    continue;
                }
            }
            if state.is_none() && is_state(tok) && zip.is_some() {
                state = Some(tok.to_lowercase());
                tail_segment = si.min(tail_segment);
            }
        }
        if zip.is_some() && state.is_some() {
            break;
        }
    }
    let zip = zip?;
    let state = state.unwrap_or_else(|| "nj".to_string());

    // First segment is the street line; everything between it and the
    // state/zip segment names the city.
    let street_source = if tail_segment == 0 {
        // Single-segment address: drop the zip and state tokens, keep the rest.
        segments[0]
            .split_whitespace()
            .filter(|tok| is_zip(tok).is_none() && !tok.eq_ignore_ascii_case(&state))
            .collect::<Vec<_>>()
            .join(" ")
    } else {
        segments[0].to_string()
    };

    let line = parse_street_line(&street_source);
    if line.number.is_none() && line.tokens.is_empty() {
        return None;
    }

    let city = if tail_segment > 1 {
        canonical_city(&segments[1..tail_segment].join(" "))
    } else {
        String::new()
    };

    Some(CanonicalAddress {
        street_number: line.number,
        street_tokens: line.tokens,
        unit: line.unit,
        city,
        state,
        zip,
    })
}

/// Key equality with a Levenshtein ≤ 1 street fallback, permitted only when
/// state, zip, house number, and unit are exact matches.
pub fn dedupe_keys_match(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    let (Some(pa), Some(pb)) = (split_key(a), split_key(b)) else {
        return false;
    };
    if pa.fixed != pb.fixed || pa.number == "nonum" || pb.number == "nonum" {
        return false;
    }
    levenshtein(pa.street, pb.street) <= 1
}

struct KeyParts<'a> {
    /// (state, zip, number, unit)
    fixed: (&'a str, &'a str, &'a str, &'a str),
    number: &'a str,
    street: &'a str,
}

fn split_key(key: &str) -> Option<KeyParts<'_>> {
    let mut head = key.splitn(4, '-');
    let state = head.next()?;
    let zip = head.next()?;
    let number = head.next()?;
    let rest = head.next()?;
    let (street, unit) = rest.rsplit_once('-')?;
    Some(KeyParts {
        fixed: (state, zip, number, unit),
        number,
        street,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> String {
        canonicalize_address(raw).expect("parseable address").dedupe_key()
    }

    #[test]
    fn messy_and_abbreviated_addresses_share_a_key() {
        let a = key("777  Messy   Road ,   Clifton  , NJ 07013 ");
        let b = key("777 Messy Rd, Clifton Twp, NJ 07013");
        assert_eq!(a, b);
        assert_eq!(a, "nj-07013-777-messy-road-nounit");
    }

    #[test]
    fn case_punctuation_and_suffix_variants_are_equivalent() {
        let variants = [
            "100 Garden State Pkwy, Woodbridge, NJ 07095",
            "100 GARDEN STATE PARKWAY, Woodbridge, NJ 07095",
            "100 Garden State Pkwy., Woodbridge Township, NJ 07095",
        ];
        let keys: Vec<String> = variants.iter().map(|v| key(v)).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]), "{keys:?}");
    }

    #[test]
    fn keys_are_lowercase_dash_separated_alphanumerics() {
        for raw in [
            "123 N 2nd St Apt 4B, Newark, NJ 07102",
            "45-47 Mt. Prospect Ave, Newark, NJ 07104",
            "9 Third Ave Fl 2, Passaic, NJ 07055",
        ] {
            let k = key(raw);
            assert!(!k.is_empty());
            assert!(!k.starts_with('-') && !k.ends_with('-'));
            assert!(!k.contains("--"));
            assert!(
                k.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
                "{k}"
            );
        }
    }

    #[test]
    fn directionals_and_ordinals_normalize() {
        assert_eq!(
            key("123 N 2nd St, Newark, NJ 07102"),
            key("123 North Second Street, Newark, NJ 07102")
        );
    }

    #[test]
    fn unit_markers_collapse_to_one_form() {
        assert_eq!(
            key("1 Main St Apt 4B, Camden, NJ 08101"),
            key("1 Main Street Unit 4B, Camden, NJ 08101")
        );
        assert_eq!(
            key("1 Main St # 4, Camden, NJ 08101"),
            key("1 Main St #4, Camden, NJ 08101")
        );
    }

    #[test]
    fn number_ranges_reduce_to_first_number() {
        assert_eq!(
            key("45-47 Prospect Ave, Newark, NJ 07104"),
            key("45 Prospect Ave, Newark, NJ 07104")
        );
    }

    #[test]
    fn unparseable_street_is_rejected() {
        assert!(canonicalize_address("07013").is_none());
        assert!(canonicalize_address("Clifton, NJ").is_none());
        assert!(canonicalize_address("").is_none());
    }

    #[test]
    fn fuzzy_match_requires_exact_zip_and_number() {
        let a = key("777 Messy Rd, Clifton, NJ 07013");
        let typo = key("777 Mesy Rd, Clifton, NJ 07013");
        assert!(dedupe_keys_match(&a, &typo));

        let other_number = key("778 Messy Rd, Clifton, NJ 07013");
        assert!(!dedupe_keys_match(&a, &other_number));

        let other_zip = key("777 Messy Rd, Clifton, NJ 07014");
        assert!(!dedupe_keys_match(&a, &other_zip));
    }

    #[test]
    fn zip_plus_four_collapses_to_five_digits() {
        assert_eq!(
            key("10 High St, Orange, NJ 07050-1234"),
            key("10 High St, Orange, NJ 07050")
        );
    }
}
