/// Decides whether two entries denote the same rule.
pub trait EqualityPolicy<T: ?Sized> {
    fn equivalent(&self, a: &T, b: &T) -> bool;
}

impl<T: ?Sized, F> EqualityPolicy<T> for F
where
    F: Fn(&T, &T) -> bool,
{
    #[inline]
    fn equivalent(&self, a: &T, b: &T) -> bool {
        (self)(a, b)
    }
}

/// Returns every element of `source` that has no equivalent in `target`.
///
/// Surviving elements keep their relative order from `source`. Entry sets are
/// bounded by provider quotas, so the quadratic scan is fine.
pub fn diff<T, P>(source: &[T], target: &[T], policy: &P) -> Vec<T>
where
    T: Clone,
    P: EqualityPolicy<T> + ?Sized,
{
    source
        .iter()
        .filter(|s| !target.iter().any(|t| policy.equivalent(s, t)))
        .cloned()
        .collect()
}
