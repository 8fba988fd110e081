//! Lane simulation for one execution group.
//!
//! A group of `lanes` cooperating lanes streams a slice with stride `lanes`,
//! each lane folding the elements it owns into a private partial. The
//! partials are then combined pairwise, halving the lane count each round.
//! Both the traversal order and the reduction tree depend only on the slice
//! length and lane count, so every run over the same slice rounds the same
//! way.

/// Fold `len` elements into one partial per lane, lane `l` owning elements
/// `l, l + lanes, l + 2 * lanes, ...`.
pub(crate) fn stream_lanes<S>(
    len: usize,
    lanes: usize,
    init: impl Fn() -> S,
    mut push: impl FnMut(&mut S, usize),
) -> Vec<S> {
    let lanes = lanes.min(len).max(1);
    (0..lanes)
        .map(|lane| {
            let mut partial = init();
            for i in (lane..len).step_by(lanes) {
                push(&mut partial, i);
            }
            partial
        })
        .collect()
}

/// Pairwise tree reduction: `(p0 ⊕ p1) ⊕ (p2 ⊕ p3) ...`.
pub(crate) fn tree_reduce<T>(partials: Vec<T>, combine: impl Fn(T, T) -> T) -> Option<T> {
    let mut level = partials;
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        let mut iter = level.into_iter();
        while let Some(a) = iter.next() {
            next.push(match iter.next() {
                Some(b) => combine(a, b),
                None => a,
            });
        }
        level = next;
    }
    level.pop()
}
