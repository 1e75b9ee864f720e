/// `SS####` code arithmetic for the human-readable student ids printed on
/// ID cards. Codes are assigned at registration, monotonically increasing,
/// and never reused; the caller reads the most recent code and computes the
/// next one (there is no server-side sequence, so concurrent registrations
/// share the same race the hosted original had).
pub const FIRST_CODE: &str = "SS1001";

const PREFIX: &str = "SS";

pub fn next_code(last: Option<&str>) -> String {
    let Some(last) = last else {
        return FIRST_CODE.to_string();
    };
    let num = last
        .trim()
        .trim_start_matches(PREFIX)
        .parse::<u64>()
        // A malformed stored code restarts the sequence at the seed.
        .unwrap_or(1000);
    format!("{}{:04}", PREFIX, num + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_store_seeds_first_code() {
        assert_eq!(next_code(None), "SS1001");
    }

    #[test]
    fn increments_numeric_suffix() {
        assert_eq!(next_code(Some("SS1042")), "SS1043");
        assert_eq!(next_code(Some("SS1001")), "SS1002");
    }

    #[test]
    fn grows_past_four_digits_without_wrapping() {
        assert_eq!(next_code(Some("SS9999")), "SS10000");
        assert_eq!(next_code(Some("SS10000")), "SS10001");
    }

    #[test]
    fn malformed_last_code_restarts_at_seed() {
        assert_eq!(next_code(Some("bogus")), "SS1001");
    }
}
