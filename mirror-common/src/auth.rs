use subtle::ConstantTimeEq;

/// Compares a presented secret against the configured one in constant time.
/// An empty configured secret never matches.
pub fn secret_matches(expected: &str, presented: Option<&str>) -> bool {
    match presented {
        Some(presented) if !expected.is_empty() => {
            expected.as_bytes().ct_eq(presented.as_bytes()).into()
        }
        _ => false,
    }
}
