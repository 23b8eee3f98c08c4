//! Display-name normalisation and string similarity.

use once_cell::sync::Lazy;
use regex::Regex;

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("valid ws regex"));

/// Case-folds, trims and collapses inner whitespace.
pub fn normalize_name(name: &str) -> String {
    WHITESPACE_RE
        .replace_all(name.trim(), " ")
        .to_lowercase()
}

/// Ratcliff/Obershelp similarity of two normalised names, in `[0.0, 1.0]`.
///
/// `2 * M / T`, where `M` counts characters in recursively found longest
/// common blocks and `T` is the total character count.
pub fn similarity(left: &str, right: &str) -> f64 {
    let left: Vec<char> = normalize_name(left).chars().collect();
    let right: Vec<char> = normalize_name(right).chars().collect();
    let total = left.len() + right.len();
    if total == 0 {
        return 1.0;
    }
    let matched = matching_chars(&left, &right);
    (2 * matched) as f64 / total as f64
}

fn matching_chars(left: &[char], right: &[char]) -> usize {
    let (start_left, start_right, len) = longest_common_block(left, right);
    if len == 0 {
        return 0;
    }
    len + matching_chars(&left[..start_left], &right[..start_right])
        + matching_chars(&left[start_left + len..], &right[start_right + len..])
}

/// Longest common contiguous block; earliest in `left`, then in `right`.
fn longest_common_block(left: &[char], right: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    // lengths[j + 1] = length of the common suffix ending at left[i], right[j].
    let mut lengths = vec![0usize; right.len() + 1];
    for (i, left_char) in left.iter().enumerate() {
        let mut next = vec![0usize; right.len() + 1];
        for (j, right_char) in right.iter().enumerate() {
            if left_char == right_char {
                let len = lengths[j] + 1;
                next[j + 1] = len;
                if len > best.2 {
                    best = (i + 1 - len, j + 1 - len, len);
                }
            }
        }
        lengths = next;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::{normalize_name, similarity};

    #[test]
    fn normalize_folds_case_and_whitespace() {
        assert_eq!(normalize_name("  Whole   Milk \t"), "whole milk");
        assert_eq!(normalize_name("EGGS"), "eggs");
    }

    #[test]
    fn identical_after_normalisation_scores_one() {
        assert!((similarity("Milk", "  milk ") - 1.0).abs() < f64::EPSILON);
        assert!((similarity("", "") - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn close_spellings_clear_default_threshold() {
        // "tomatoes" vs "tomatos": 7 matched chars of 15 total.
        let score = similarity("Tomatoes", "tomatos");
        assert!((score - 14.0 / 15.0).abs() < 1e-9, "score was {score}");
        assert!(score >= 0.85);
    }

    #[test]
    fn unrelated_names_score_low() {
        assert!(similarity("Milk", "Bread") < 0.5);
        assert!(similarity("apples", "") < f64::EPSILON);
    }

    #[test]
    fn score_is_symmetric_for_simple_inputs() {
        let forward = similarity("peanut butter", "peanut buter");
        let backward = similarity("peanut buter", "peanut butter");
        assert!((forward - backward).abs() < 1e-9);
    }
}
