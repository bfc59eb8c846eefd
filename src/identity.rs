//! Match identity resolver.
//!
//! Canonicalizes scraped team / league names into a stable fingerprint that joins
//! snapshot tables and alarm records. The composition order, normalization rules,
//! and digest are persisted identity and must stay bit-stable.

use sha2::{Digest, Sha256};

/// Club-suffix tokens stripped only when trailing.
const CLUB_SUFFIXES: &[&str] = &[
    "fc", "sc", "afc", "cf", "fk", "sk", "ac", "bk", "if", "ssc", "cd", "ud", "sv", "jk",
];

/// Bytes of the SHA-256 digest kept in the fingerprint (32 hex chars).
const FINGERPRINT_BYTES: usize = 16;

/// `digest(normalize(league) | normalize(home) | normalize(away))`.
///
/// Returns an empty string when any component normalizes to nothing; callers treat
/// that fixture as unidentifiable and skip it.
pub fn fingerprint(home: &str, away: &str, league: &str) -> String {
    let league = normalize_name(league);
    let home = normalize_name(home);
    let away = normalize_name(away);
    if league.is_empty() || home.is_empty() || away.is_empty() {
        return String::new();
    }

    let composed = format!("{league}|{home}|{away}");
    let digest = Sha256::digest(composed.as_bytes());
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

/// Same as [`fingerprint`], with the kickoff string accepted for older callers.
/// Kickoff is intentionally not part of the digest.
pub fn fingerprint_with_kickoff(home: &str, away: &str, league: &str, _kickoff: &str) -> String {
    fingerprint(home, away, league)
}

/// Trim, transliterate, lowercase, strip non-alphanumerics, collapse whitespace,
/// drop trailing club suffixes.
pub fn normalize_name(raw: &str) -> String {
    let mut ascii = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        match transliterate(c) {
            Some(s) => ascii.push_str(s),
            None => ascii.push(c),
        }
    }

    // Whitespace separates tokens; every other non-alphanumeric is dropped.
    let cleaned: String = ascii
        .to_lowercase()
        .chars()
        .filter_map(|c| {
            if c.is_ascii_alphanumeric() {
                Some(c)
            } else if c.is_whitespace() {
                Some(' ')
            } else {
                None
            }
        })
        .collect();

    let mut tokens: Vec<&str> = cleaned.split_whitespace().collect();
    while tokens.len() > 1 {
        match tokens.last() {
            Some(last) if CLUB_SUFFIXES.contains(last) => {
                tokens.pop();
            }
            _ => break,
        }
    }
    tokens.join(" ")
}

fn transliterate(c: char) -> Option<&'static str> {
    let out = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' => "a",
        'À' | 'Á' | 'Â' | 'Ã' | 'Ä' | 'Å' | 'Ā' | 'Ă' | 'Ą' => "A",
        'æ' => "ae",
        'Æ' => "AE",
        'ç' | 'ć' | 'č' | 'ĉ' | 'ċ' => "c",
        'Ç' | 'Ć' | 'Č' | 'Ĉ' | 'Ċ' => "C",
        'ď' | 'đ' => "d",
        'Ď' | 'Đ' => "D",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ė' | 'ę' | 'ě' => "e",
        'È' | 'É' | 'Ê' | 'Ë' | 'Ē' | 'Ė' | 'Ę' | 'Ě' => "E",
        'ğ' | 'ĝ' | 'ġ' | 'ģ' => "g",
        'Ğ' | 'Ĝ' | 'Ġ' | 'Ģ' => "G",
        'ì' | 'í' | 'î' | 'ï' | 'ī' | 'į' | 'ı' => "i",
        'Ì' | 'Í' | 'Î' | 'Ï' | 'Ī' | 'Į' | 'İ' => "I",
        'ķ' => "k",
        'Ķ' => "K",
        'ł' | 'ľ' | 'ĺ' | 'ļ' => "l",
        'Ł' | 'Ľ' | 'Ĺ' | 'Ļ' => "L",
        'ñ' | 'ń' | 'ň' | 'ņ' => "n",
        'Ñ' | 'Ń' | 'Ň' | 'Ņ' => "N",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'Ò' | 'Ó' | 'Ô' | 'Õ' | 'Ö' | 'Ø' | 'Ō' | 'Ő' => "O",
        'œ' => "oe",
        'Œ' => "OE",
        'ř' | 'ŕ' => "r",
        'Ř' | 'Ŕ' => "R",
        'ş' | 'ś' | 'š' | 'ș' => "s",
        'Ş' | 'Ś' | 'Š' | 'Ș' => "S",
        'ß' => "ss",
        'ţ' | 'ť' | 'ț' => "t",
        'Ţ' | 'Ť' | 'Ț' => "T",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' | 'ų' => "u",
        'Ù' | 'Ú' | 'Û' | 'Ü' | 'Ū' | 'Ů' | 'Ű' | 'Ų' => "U",
        'ý' | 'ÿ' => "y",
        'Ý' | 'Ÿ' => "Y",
        'ž' | 'ź' | 'ż' => "z",
        'Ž' | 'Ź' | 'Ż' => "Z",
        _ => return None,
    };
    Some(out)
}
