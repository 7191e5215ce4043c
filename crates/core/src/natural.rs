use std::cmp::Ordering;

use once_cell::sync::Lazy;
use regex::Regex;

static RUN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+|\D+").expect("valid regex"));

/// Compares strings so that digit runs are ordered by numeric value:
/// `sample2` < `sample10`. Ties fall back to plain byte order so the
/// ordering stays total (`s01` vs `s1`).
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = RUN_RE.find_iter(a).map(|m| m.as_str());
    let mut right = RUN_RE.find_iter(b).map(|m| m.as_str());
    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = compare_runs(l, r);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

fn compare_runs(l: &str, r: &str) -> Ordering {
    let l_digit = l.as_bytes()[0].is_ascii_digit();
    let r_digit = r.as_bytes()[0].is_ascii_digit();
    match (l_digit, r_digit) {
        (true, true) => compare_digits(l, r),
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => l.cmp(r),
    }
}

// Arbitrary length digit runs: strip leading zeros, then longer is larger.
fn compare_digits(l: &str, r: &str) -> Ordering {
    let l = l.trim_start_matches('0');
    let r = r.trim_start_matches('0');
    l.len().cmp(&r.len()).then_with(|| l.cmp(r))
}

pub fn natural_sort<S: AsRef<str>>(values: &mut [S]) {
    values.sort_by(|a, b| natural_cmp(a.as_ref(), b.as_ref()));
}
