/// Index of the smallest value; the first occurrence wins ties. NaNs never win.
pub fn argmin(data: &[f64]) -> Option<usize> {
    data.iter().enumerate().fold(None, |acc, (index, &value)| {
        match acc {
            None if !value.is_nan() => Some((index, value)),
            Some((_, min_val)) if value < min_val => Some((index, value)),
            _ => acc
        }
    }).map(|(index, _)| index)
}

/// Position on a 1-D coordinate axis closest to `value` (argmin of |axis - value|).
pub fn nearest_index(axis: &[f64], value: f64) -> Option<usize> {
    let distances: Vec<f64> = axis.iter().map(|a| (a - value).abs()).collect();
    argmin(&distances)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argmin_basic() {
        let data = vec![4.0, 2.0, 5.0, 1.0, 3.0];
        assert_eq!(argmin(&data), Some(3));
    }

    #[test]
    fn test_argmin_empty() {
        let data: Vec<f64> = Vec::new();
        assert_eq!(argmin(&data), None);
    }

    #[test]
    fn test_argmin_all_same() {
        let data = vec![2.0, 2.0, 2.0, 2.0];
        assert_eq!(argmin(&data), Some(0)); // first occurrence
    }

    #[test]
    fn test_argmin_skips_nan() {
        let data = vec![f64::NAN, 3.0, f64::NAN, 1.0];
        assert_eq!(argmin(&data), Some(3));
    }

    #[test]
    fn test_nearest_index_descending_axis() {
        // projected y axes usually run north to south
        let axis = vec![300.0, 200.0, 100.0, 0.0];
        assert_eq!(nearest_index(&axis, 140.0), Some(2));
        assert_eq!(nearest_index(&axis, 999.0), Some(0));
        assert_eq!(nearest_index(&axis, -50.0), Some(3));
    }
}
