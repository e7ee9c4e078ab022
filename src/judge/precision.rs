//! Token-wise output comparison under numeric tolerance.

/// Compares program output to the expected output for a precision-judged
/// problem.
///
/// Both sides are tokenised on whitespace and must have the same token
/// count. A pair matches when both tokens parse as finite numbers within
/// the configured tolerance (absolute and/or relative, either one
/// sufficing), or when the tokens are byte-equal.
pub fn outputs_match(
    actual: &[u8],
    expected: &[u8],
    absolute: Option<f64>,
    relative: Option<f64>,
) -> bool {
    let (Ok(actual), Ok(expected)) = (
        std::str::from_utf8(actual),
        std::str::from_utf8(expected),
    ) else {
        return actual == expected;
    };

    let actual_tokens: Vec<&str> = actual.split_whitespace().collect();
    let expected_tokens: Vec<&str> = expected.split_whitespace().collect();
    if actual_tokens.len() != expected_tokens.len() {
        return false;
    }

    actual_tokens
        .iter()
        .zip(&expected_tokens)
        .all(|(a, e)| tokens_match(a, e, absolute, relative))
}

fn tokens_match(actual: &str, expected: &str, absolute: Option<f64>, relative: Option<f64>) -> bool {
    if let (Ok(a), Ok(e)) = (actual.parse::<f64>(), expected.parse::<f64>()) {
        if a.is_finite() && e.is_finite() && within_tolerance(a, e, absolute, relative) {
            return true;
        }
    }
    actual == expected
}

fn within_tolerance(actual: f64, expected: f64, absolute: Option<f64>, relative: Option<f64>) -> bool {
    let diff = (actual - expected).abs();
    absolute.is_some_and(|tol| diff <= tol)
        || relative.is_some_and(|tol| diff <= tol * expected.abs())
}
