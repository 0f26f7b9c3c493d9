/// Overflow-safe rounding of the three-component transaction size.
///
/// Returns 0 (the sentinel the caller treats as `EINVAL`) if any
/// intermediate sum overflows `usize`. A request that validates to 0 is
/// bumped up to one pointer width, so a zero-length buffer still occupies
/// a unique address.
pub(crate) fn sanitized_size(data_size: usize, offsets_size: usize, secctx_size: usize) -> usize {
    let w = std::mem::size_of::<usize>();
    let round_up = |v: usize| v.checked_add(w - 1).map(|v| v & !(w - 1));

    let data = match round_up(data_size) {
        Some(v) => v,
        None => return 0,
    };
    let offsets = match round_up(offsets_size) {
        Some(v) => v,
        None => return 0,
    };
    let secctx = match round_up(secctx_size) {
        Some(v) => v,
        None => return 0,
    };

    let total = match data.checked_add(offsets).and_then(|t| t.checked_add(secctx)) {
        Some(v) => v,
        None => return 0,
    };

    total.max(w)
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: usize = std::mem::size_of::<usize>();

    #[test]
    fn rounds_each_component_independently() {
        assert_eq!(sanitized_size(1, 1, 1), 3 * W);
        assert_eq!(sanitized_size(W, W, W), 3 * W);
    }

    #[test]
    fn zero_length_request_still_gets_a_unique_address() {
        assert_eq!(sanitized_size(0, 0, 0), W);
    }

    #[test]
    fn overflow_in_any_component_is_invalid() {
        assert_eq!(sanitized_size(usize::MAX - 4, 8, 0), 0);
        assert_eq!(sanitized_size(0, usize::MAX, 0), 0);
        assert_eq!(sanitized_size(0, 0, usize::MAX - 1), 0);
    }

    #[test]
    fn overflow_in_the_final_sum_is_invalid() {
        let half = usize::MAX / 2 + W;
        assert_eq!(sanitized_size(half, half, half), 0);
    }
}
