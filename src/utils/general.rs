use rand::prelude::*;
use std::ops::Range;

//////////////////
// VECTOR STUFF //
//////////////////

/// Flatten a nested vector
///
/// ### Params
///
/// * `vec` - The vector to flatten
///
/// ### Returns
///
/// The flattened vector
pub fn flatten_vector<I, T>(vec: I) -> Vec<T>
where
    I: IntoIterator,
    I::Item: IntoIterator<Item = T>,
{
    vec.into_iter().flatten().collect()
}

/// Index and value of the maximum of a slice
///
/// The first occurrence wins on ties. `NaN` values are never selected unless
/// every value is `NaN`, in which case index `0` is returned.
///
/// ### Params
///
/// * `arr` - The array of values. Must not be empty.
///
/// ### Returns
///
/// Tuple of `(index, value)`
pub fn array_argmax(arr: &[f64]) -> (usize, f64) {
    let mut best_idx = 0_usize;
    let mut best_val = arr[0];
    for (i, &v) in arr.iter().enumerate().skip(1) {
        if v > best_val || (best_val.is_nan() && !v.is_nan()) {
            best_idx = i;
            best_val = v;
        }
    }
    (best_idx, best_val)
}

/// Mean of the non-`NaN` values
///
/// ### Params
///
/// * `x` - Slice of `f64`
///
/// ### Returns
///
/// The mean, or `NaN` if no finite value is present
pub fn nan_mean(x: &[f64]) -> f64 {
    let (sum, n) = x
        .iter()
        .filter(|v| !v.is_nan())
        .fold((0.0, 0_usize), |(s, n), &v| (s + v, n + 1));
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

/// Median of the non-`NaN` values
///
/// ### Params
///
/// * `x` - Slice of `f64`
///
/// ### Returns
///
/// The median, or `NaN` if no finite value is present
pub fn nan_median(x: &[f64]) -> f64 {
    let mut vals: Vec<f64> = x.iter().copied().filter(|v| !v.is_nan()).collect();
    if vals.is_empty() {
        return f64::NAN;
    }
    vals.sort_by(|a, b| a.total_cmp(b));
    let n = vals.len();
    if n % 2 == 1 {
        vals[n / 2]
    } else {
        (vals[n / 2 - 1] + vals[n / 2]) / 2.0
    }
}

/// Quantile with linear interpolation between closest ranks
///
/// ### Params
///
/// * `x` - Slice of values. Must not be empty.
/// * `q` - Quantile in `[0, 1]`.
///
/// ### Returns
///
/// The interpolated quantile
pub fn quantile(x: &[f64], q: f64) -> f64 {
    let mut sorted = x.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let pos = q.clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    let frac = pos - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * frac
}

/// Split `0..n` into `n_slices` contiguous, near-even ranges
///
/// The first `n % n_slices` ranges get one extra element. Empty ranges are
/// not emitted.
///
/// ### Params
///
/// * `n` - Total number of elements.
/// * `n_slices` - Number of slices.
///
/// ### Returns
///
/// The ranges in order
pub fn gen_even_slices(n: usize, n_slices: usize) -> Vec<Range<usize>> {
    let n_slices = n_slices.max(1);
    let base = n / n_slices;
    let extra = n % n_slices;
    let mut start = 0_usize;
    let mut res = Vec::with_capacity(n_slices);
    for i in 0..n_slices {
        let len = base + usize::from(i < extra);
        if len > 0 {
            res.push(start..start + len);
        }
        start += len;
    }
    res
}

/// Split the indices `0..n` randomly into two sorted, disjoint sets
///
/// ### Params
///
/// * `n` - Number of indices.
/// * `x` - Size of the second set; the rest goes into the first.
/// * `rng` - Random source.
///
/// ### Returns
///
/// Tuple of `(first, second)`, both in ascending order
pub fn split_indices_randomly<R: Rng + ?Sized>(
    n: usize,
    x: usize,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut second = rand::seq::index::sample(rng, n, x.min(n)).into_vec();
    second.sort_unstable();

    let mut is_second = vec![false; n];
    for &i in &second {
        is_second[i] = true;
    }
    let first = (0..n).filter(|&i| !is_second[i]).collect();

    (first, second)
}

/// Format a float with four significant digits in exponent notation
///
/// Uses a signed exponent of at least two digits, e.g. `1.235e-02`.
///
/// ### Params
///
/// * `x` - Value to format
pub fn fmt_sig4(x: f64) -> String {
    if !x.is_finite() {
        return format!("{}", x);
    }
    let s = format!("{:.3e}", x);
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => s,
    }
}

///////////
// Tests //
///////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantile_linear() {
        let x = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(quantile(&x, 0.5), 3.0);
        assert!((quantile(&x, 0.95) - 4.8).abs() < 1e-12);
        assert_eq!(quantile(&[7.0], 0.95), 7.0);
    }

    #[test]
    fn test_even_slices_cover_range() {
        let slices = gen_even_slices(10, 3);
        assert_eq!(slices, vec![0..4, 4..7, 7..10]);

        let slices = gen_even_slices(2, 4);
        assert_eq!(slices, vec![0..1, 1..2]);
    }

    #[test]
    fn test_argmax_first_on_ties() {
        assert_eq!(array_argmax(&[0.1, 0.5, 0.5]), (1, 0.5));
        assert_eq!(array_argmax(&[f64::NAN, 0.2, 0.1]), (1, 0.2));
    }

    #[test]
    fn test_nan_aggregates() {
        let x = vec![1.0, f64::NAN, 3.0];
        assert_eq!(nan_mean(&x), 2.0);
        assert_eq!(nan_median(&x), 2.0);
        assert!(nan_mean(&[f64::NAN]).is_nan());
    }

    #[test]
    fn test_split_indices() {
        let mut rng = StdRng::seed_from_u64(42);
        let (first, second) = split_indices_randomly(10, 3, &mut rng);
        assert_eq!(first.len(), 7);
        assert_eq!(second.len(), 3);
        let mut all = flatten_vector(vec![first, second]);
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_fmt_sig4() {
        assert_eq!(fmt_sig4(0.012346), "1.235e-02");
        assert_eq!(fmt_sig4(1234.6), "1.235e+03");
        assert_eq!(fmt_sig4(0.0), "0.000e+00");
    }
}
