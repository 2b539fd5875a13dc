//! Assertion helpers for client integration tests.

use oxlustre_client::{ClientError, ClientResult};

/// Assert that an operation failed with `errno`.
#[track_caller]
pub fn assert_errno<T: std::fmt::Debug>(result: ClientResult<T>, errno: i32) {
    match result {
        Ok(value) => panic!("expected errno {errno}, got Ok({value:?})"),
        Err(e) => assert_eq!(e.to_errno(), errno, "unexpected error: {e}"),
    }
}

/// Assert that an operation failed with a protocol violation.
#[track_caller]
pub fn assert_protocol_error<T: std::fmt::Debug>(result: ClientResult<T>) {
    match result {
        Ok(value) => panic!("expected a protocol error, got Ok({value:?})"),
        Err(e) => assert!(e.is_protocol(), "expected a protocol error, got: {e}"),
    }
}

/// Deterministic, non-repeating-looking content.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

#[track_caller]
pub fn assert_partial(error: &ClientError, completed: &[usize], failed: &[usize]) {
    let ClientError::PartialFailure(p) = error else {
        panic!("expected a partial failure, got: {error}");
    };
    assert_eq!(p.completed, completed);
    let failed_stripes: Vec<usize> = p.failed.iter().map(|f| f.stripe).collect();
    assert_eq!(failed_stripes, failed);
}
