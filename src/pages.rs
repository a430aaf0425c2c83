//! Page-range expressions and the canonical [`PageSelection`].
//!
//! An expression is a comma-separated list of tokens, each a single positive
//! page number (`7`) or an inclusive ascending interval (`5-10`). Tokens are
//! merged by set union, so `1-5,3-8,4` is the same selection as `1-8`.
//! Pages are 1-based everywhere in this crate.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Why a page-range expression was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PageRangeError {
    /// The expression contains no tokens.
    #[error("empty page range expression")]
    Empty,

    /// A token is neither `N` nor `A-B`.
    #[error("invalid token '{0}': expected a page number or a range like 5-10")]
    InvalidToken(String),

    /// Pages are 1-based.
    #[error("page numbers start at 1 (got {0})")]
    Zero(usize),

    /// A range whose start lies after its end.
    #[error("range {start}-{end} is descending")]
    Descending { start: usize, end: usize },

    /// A page beyond the end of the document.
    #[error("page {page} exceeds the document page count ({total})")]
    OutOfBounds { page: usize, total: usize },
}

static RE_SINGLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)$").unwrap());
static RE_RANGE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(\d+)-(\d+)$").unwrap());

/// Ordered set of distinct 1-based page indices.
///
/// Strictly increasing, no duplicates, every index ≥ 1. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageSelection {
    pages: Vec<usize>,
}

impl PageSelection {
    /// Parse an expression like `1,3,5-10,15`.
    pub fn parse(expr: &str) -> Result<Self, PageRangeError> {
        let mut set = BTreeSet::new();
        let mut tokens = 0usize;

        for raw in expr.split(',') {
            let token = raw.trim();
            if token.is_empty() {
                continue;
            }
            tokens += 1;

            if let Some(caps) = RE_RANGE.captures(token) {
                let start = parse_number(&caps[1], token)?;
                let end = parse_number(&caps[2], token)?;
                if start == 0 {
                    return Err(PageRangeError::Zero(start));
                }
                if start > end {
                    return Err(PageRangeError::Descending { start, end });
                }
                set.extend(start..=end);
            } else if let Some(caps) = RE_SINGLE.captures(token) {
                let page = parse_number(&caps[1], token)?;
                if page == 0 {
                    return Err(PageRangeError::Zero(page));
                }
                set.insert(page);
            } else {
                return Err(PageRangeError::InvalidToken(token.to_string()));
            }
        }

        if tokens == 0 {
            return Err(PageRangeError::Empty);
        }

        Ok(Self {
            pages: set.into_iter().collect(),
        })
    }

    /// Parse an expression and check every page against `total` pages.
    pub fn parse_bounded(expr: &str, total: usize) -> Result<Self, PageRangeError> {
        let selection = Self::parse(expr)?;
        selection.check_bounds(total)?;
        Ok(selection)
    }

    /// Every page of a `total`-page document.
    pub fn all(total: usize) -> Self {
        Self {
            pages: (1..=total).collect(),
        }
    }

    /// Build from arbitrary page numbers; sorts, deduplicates and drops zeros.
    pub fn from_pages(pages: impl IntoIterator<Item = usize>) -> Self {
        let set: BTreeSet<usize> = pages.into_iter().filter(|&p| p >= 1).collect();
        Self {
            pages: set.into_iter().collect(),
        }
    }

    /// Fail with [`PageRangeError::OutOfBounds`] on the first page beyond `total`.
    pub fn check_bounds(&self, total: usize) -> Result<(), PageRangeError> {
        match self.pages.last() {
            Some(&page) if page > total => Err(PageRangeError::OutOfBounds { page, total }),
            _ => Ok(()),
        }
    }

    /// Pages in `self` that are not in `other`.
    pub fn without(&self, other: &PageSelection) -> Self {
        Self {
            pages: self
                .pages
                .iter()
                .copied()
                .filter(|p| other.pages.binary_search(p).is_err())
                .collect(),
        }
    }

    pub fn contains(&self, page: usize) -> bool {
        self.pages.binary_search(&page).is_ok()
    }

    pub fn pages(&self) -> &[usize] {
        &self.pages
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.pages.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Compact range string: `[1,2,3,5,7,8]` → `"1-3,5,7-8"`.
    pub fn to_range_string(&self) -> String {
        let mut parts = Vec::new();
        let mut iter = self.pages.iter().copied();
        let Some(first) = iter.next() else {
            return String::new();
        };

        let (mut start, mut end) = (first, first);
        for page in iter {
            if page == end + 1 {
                end = page;
            } else {
                parts.push(format_run(start, end));
                start = page;
                end = page;
            }
        }
        parts.push(format_run(start, end));
        parts.join(",")
    }
}

fn parse_number(digits: &str, token: &str) -> Result<usize, PageRangeError> {
    digits
        .parse()
        .map_err(|_| PageRangeError::InvalidToken(token.to_string()))
}

fn format_run(start: usize, end: usize) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}

impl FromStr for PageSelection {
    type Err = PageRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for PageSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_range_string())
    }
}

impl<'a> IntoIterator for &'a PageSelection {
    type Item = &'a usize;
    type IntoIter = std::slice::Iter<'a, usize>;

    fn into_iter(self) -> Self::IntoIter {
        self.pages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_expression() {
        let sel = PageSelection::parse("1,3,5-10,15").unwrap();
        assert_eq!(sel.pages(), &[1, 3, 5, 6, 7, 8, 9, 10, 15]);
    }

    #[test]
    fn merges_overlapping_and_repeated_tokens() {
        let sel = PageSelection::parse("5-8, 1-6 ,3,3,8").unwrap();
        assert_eq!(sel.pages(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn single_page_range() {
        assert_eq!(PageSelection::parse("4-4").unwrap().pages(), &[4]);
    }

    #[test]
    fn rejects_descending_range() {
        assert_eq!(
            PageSelection::parse("5-3"),
            Err(PageRangeError::Descending { start: 5, end: 3 })
        );
    }

    #[test]
    fn rejects_zero() {
        assert_eq!(PageSelection::parse("0"), Err(PageRangeError::Zero(0)));
        assert_eq!(PageSelection::parse("0-4"), Err(PageRangeError::Zero(0)));
    }

    #[test]
    fn rejects_garbage_tokens() {
        for bad in ["a", "1-", "-3", "1-2-3", "2.5", "+4", "1 - 3", "-"] {
            assert!(
                matches!(PageSelection::parse(bad), Err(PageRangeError::InvalidToken(_))),
                "expected InvalidToken for {bad:?}"
            );
        }
    }

    #[test]
    fn rejects_empty_expression() {
        assert_eq!(PageSelection::parse(""), Err(PageRangeError::Empty));
        assert_eq!(PageSelection::parse(" , ,"), Err(PageRangeError::Empty));
    }

    #[test]
    fn empty_tokens_between_commas_are_ignored() {
        assert_eq!(PageSelection::parse("1,,3").unwrap().pages(), &[1, 3]);
    }

    #[test]
    fn huge_numbers_are_invalid_not_panics() {
        let bad = "99999999999999999999999999";
        assert!(matches!(
            PageSelection::parse(bad),
            Err(PageRangeError::InvalidToken(_))
        ));
    }

    #[test]
    fn bounded_parse_checks_page_count() {
        assert_eq!(
            PageSelection::parse_bounded("1-12", 10),
            Err(PageRangeError::OutOfBounds { page: 12, total: 10 })
        );
        assert!(PageSelection::parse_bounded("1-10", 10).is_ok());
    }

    #[test]
    fn skip_set_difference() {
        let sel = PageSelection::all(10);
        let skip = PageSelection::parse("2,5-7").unwrap();
        assert_eq!(sel.without(&skip).pages(), &[1, 3, 4, 8, 9, 10]);
    }

    #[test]
    fn formats_compact_ranges() {
        let sel = PageSelection::from_pages([8, 1, 2, 3, 5, 7, 2]);
        assert_eq!(sel.to_range_string(), "1-3,5,7-8");
        assert_eq!(sel.to_string(), "1-3,5,7-8");
        assert_eq!(PageSelection::default().to_range_string(), "");
    }

    #[test]
    fn format_then_parse_is_stable() {
        let sel = PageSelection::parse("1,3,5-10,15").unwrap();
        let again: PageSelection = sel.to_range_string().parse().unwrap();
        assert_eq!(again, sel);
    }

    #[test]
    fn output_is_strictly_increasing() {
        let sel = PageSelection::parse("9,2-4,1,4-6,20-22,3").unwrap();
        assert!(sel.pages().windows(2).all(|w| w[0] < w[1]));
        assert!(sel.contains(21));
        assert!(!sel.contains(7));
    }
}
