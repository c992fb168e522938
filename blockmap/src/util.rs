use std::collections::HashSet;
use std::hash::Hash;

/// Drops repeated elements, keeping the first occurrence of each in its original
/// position.
pub fn uniqify<T: Eq + Hash + Clone>(items: &[T]) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .iter()
        .filter(|item| seen.insert(*item))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_occurrence_in_order() {
        assert_eq!(uniqify(&[3, 1, 3, 2, 1]), vec![3, 1, 2]);
    }

    #[test]
    fn empty_input_stays_empty() {
        let empty: [u32; 0] = [];
        assert!(uniqify(&empty).is_empty());
    }

    #[test]
    fn works_for_owned_values() {
        let names = vec!["sda".to_string(), "sdb".to_string(), "sda".to_string()];
        assert_eq!(uniqify(&names), vec!["sda".to_string(), "sdb".to_string()]);
    }
}
