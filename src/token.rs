/// What a scanned (or hand-typed) attendance token turned out to be.
///
/// ID cards carry either the student's UUID or the printed `SS####` code,
/// and some QR labels encode a full verification URL. Classification is a
/// pure string decision; resolving against the store happens elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedToken {
    StudentUuid(String),
    StudentCode(String),
    Unrecognized,
}

const URL_MARKER: &str = "/verify/";
const CODE_PREFIX: &str = "SS";

pub fn parse_token(raw: &str) -> ParsedToken {
    let mut t = raw.trim();

    // URL payloads reduce to the trailing path segment after the marker.
    if let Some((_, tail)) = t.rsplit_once(URL_MARKER) {
        t = tail;
    }
    let t = t.trim_matches('/').trim();
    if t.is_empty() {
        return ParsedToken::Unrecognized;
    }

    // A hyphen means a UUID; the printed codes never contain one.
    if t.contains('-') {
        return ParsedToken::StudentUuid(t.to_string());
    }

    let upper = t.to_ascii_uppercase();
    if let Some(digits) = upper.strip_prefix(CODE_PREFIX) {
        if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return ParsedToken::StudentCode(upper);
        }
    }

    ParsedToken::Unrecognized
}
