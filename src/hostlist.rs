//! Ranged host name lists: `node[1-4,7],login[01-02]`.
//!
//! A `Hostlist` is an ordered list of names. Parsing expands bracket ranges,
//! `ranged_string` folds adjacent names back into the compact form used in
//! client responses (`302 on: t[0-3]`).

use std::fmt;
use std::str::FromStr;

use crate::error::PowermanError;

/// Upper bound on the number of names a single expression may expand to.
pub const MAX_RANGE: usize = 100_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Hostlist {
    hosts: Vec<String>,
}

impl Hostlist {
    #[must_use]
    pub const fn new() -> Self {
        Self { hosts: Vec::new() }
    }

    /// Parse a comma/whitespace separated hostlist expression.
    pub fn parse(s: &str) -> Result<Self, PowermanError> {
        let mut hl = Self::new();
        hl.push_list(s)?;
        Ok(hl)
    }

    /// Append a single literal name (no range expansion).
    pub fn push(&mut self, host: impl Into<String>) {
        self.hosts.push(host.into());
    }

    /// Append every name of a hostlist expression.
    pub fn push_list(&mut self, s: &str) -> Result<(), PowermanError> {
        for token in split_top_level(s)? {
            let mut expanded = Vec::new();
            expand_token(token, &mut expanded)?;
            if self.hosts.len() + expanded.len() > MAX_RANGE {
                return Err(PowermanError::Hostlist(format!(
                    "too many hosts in '{s}'"
                )));
            }
            self.hosts.extend(expanded);
        }
        Ok(())
    }

    pub fn extend(&mut self, other: &Self) {
        self.hosts.extend(other.hosts.iter().cloned());
    }

    #[must_use]
    pub fn contains(&self, host: &str) -> bool {
        self.hosts.iter().any(|h| h == host)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.hosts.iter().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// Sort by prefix, then numeric suffix.
    pub fn sort(&mut self) {
        self.hosts.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    }

    /// Drop repeated names, keeping the first occurrence.
    pub fn dedup(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.hosts.retain(|h| seen.insert(h.clone()));
    }

    /// Compact representation, folding runs of names that share a prefix.
    /// List order is kept; call [`Hostlist::sort`] first for canonical output.
    #[must_use]
    pub fn ranged_string(&self) -> String {
        let mut groups: Vec<Group> = Vec::new();
        for host in &self.hosts {
            let (prefix, digits) = split_numeric_suffix(host);
            let joined = match (groups.last_mut(), digits) {
                (Some(g), Some(d)) => g.try_add(prefix, d),
                _ => false,
            };
            if !joined {
                groups.push(Group::start(host, prefix, digits));
            }
        }
        groups
            .iter()
            .map(Group::render)
            .collect::<Vec<_>>()
            .join(",")
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.hosts
    }
}

impl FromStr for Hostlist {
    type Err = PowermanError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Hostlist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.ranged_string())
    }
}

impl<S: Into<String>> FromIterator<S> for Hostlist {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            hosts: iter.into_iter().map(Into::into).collect(),
        }
    }
}

impl<'a> IntoIterator for &'a Hostlist {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;
    fn into_iter(self) -> Self::IntoIter {
        self.hosts.iter()
    }
}

fn split_top_level(s: &str) -> Result<Vec<&str>, PowermanError> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, ch) in s.char_indices() {
        match ch {
            '[' => depth += 1,
            ']' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| PowermanError::Hostlist(format!("unbalanced ']' in '{s}'")))?;
            }
            ',' | ' ' | '\t' if depth == 0 => {
                if i > start {
                    tokens.push(&s[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(PowermanError::Hostlist(format!("unbalanced '[' in '{s}'")));
    }
    if start < s.len() {
        tokens.push(&s[start..]);
    }
    Ok(tokens)
}

fn expand_token(token: &str, out: &mut Vec<String>) -> Result<(), PowermanError> {
    let Some(open) = token.find('[') else {
        out.push(token.to_string());
        return Ok(());
    };
    let close = token[open..]
        .find(']')
        .map(|c| open + c)
        .ok_or_else(|| PowermanError::Hostlist(format!("missing ']' in '{token}'")))?;
    let prefix = &token[..open];
    let suffix = &token[close + 1..];
    let mut tails = Vec::new();
    expand_token(suffix, &mut tails)?;
    for (lo, hi, width) in parse_ranges(&token[open + 1..close])? {
        for n in lo..=hi {
            for tail in &tails {
                if out.len() >= MAX_RANGE {
                    return Err(PowermanError::Hostlist(format!(
                        "range too large in '{token}'"
                    )));
                }
                out.push(format!("{prefix}{n:0width$}{tail}"));
            }
        }
    }
    Ok(())
}

fn parse_ranges(body: &str) -> Result<Vec<(u64, u64, usize)>, PowermanError> {
    let bad = || PowermanError::Hostlist(format!("invalid range '[{body}]'"));
    let mut ranges = Vec::new();
    for part in body.split(',') {
        let part = part.trim();
        let (lo_s, hi_s) = part.split_once('-').unwrap_or((part, part));
        if lo_s.is_empty()
            || hi_s.is_empty()
            || !lo_s.bytes().all(|b| b.is_ascii_digit())
            || !hi_s.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(bad());
        }
        let lo: u64 = lo_s.parse().map_err(|_| bad())?;
        let hi: u64 = hi_s.parse().map_err(|_| bad())?;
        if hi < lo || hi - lo >= MAX_RANGE as u64 {
            return Err(bad());
        }
        let width = if lo_s.len() > 1 && lo_s.starts_with('0') {
            lo_s.len()
        } else {
            0
        };
        ranges.push((lo, hi, width));
    }
    Ok(ranges)
}

/// Split "node012" into ("node", Some("012")).
fn split_numeric_suffix(host: &str) -> (&str, Option<&str>) {
    let idx = host
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    match idx {
        Some(i) if host.len() - i <= 18 => (&host[..i], Some(&host[i..])),
        _ => (host, None),
    }
}

fn sort_key(host: &str) -> (&str, Option<u64>, usize, &str) {
    let (prefix, digits) = split_numeric_suffix(host);
    let num = digits.and_then(|d| d.parse().ok());
    (prefix, num, digits.map_or(0, str::len), host)
}

struct Group {
    prefix: String,
    /// Zero-padded width shared by every member, when padded.
    width: Option<usize>,
    nums: Vec<u64>,
    literal: Option<String>,
}

impl Group {
    fn start(host: &str, prefix: &str, digits: Option<&str>) -> Self {
        match digits.and_then(|d| d.parse::<u64>().ok().map(|n| (d, n))) {
            Some((d, n)) => Self {
                prefix: prefix.to_string(),
                width: padded_width(d),
                nums: vec![n],
                literal: None,
            },
            None => Self {
                prefix: String::new(),
                width: None,
                nums: Vec::new(),
                literal: Some(host.to_string()),
            },
        }
    }

    fn try_add(&mut self, prefix: &str, digits: &str) -> bool {
        if self.literal.is_some() || self.prefix != prefix {
            return false;
        }
        let Ok(n) = digits.parse::<u64>() else {
            return false;
        };
        let compatible = match (self.width, padded_width(digits)) {
            (Some(w), _) => digits.len() == w,
            (None, None) => true,
            (None, Some(_)) => false,
        };
        if compatible {
            self.nums.push(n);
        }
        compatible
    }

    fn render(&self) -> String {
        if let Some(lit) = &self.literal {
            return lit.clone();
        }
        let w = self.width.unwrap_or(0);
        if self.nums.len() == 1 {
            return format!("{}{:0w$}", self.prefix, self.nums[0]);
        }
        let mut parts = Vec::new();
        let mut i = 0;
        while i < self.nums.len() {
            let lo = self.nums[i];
            let mut hi = lo;
            while i + 1 < self.nums.len() && self.nums[i + 1] == hi + 1 {
                hi += 1;
                i += 1;
            }
            if lo == hi {
                parts.push(format!("{lo:0w$}"));
            } else {
                parts.push(format!("{lo:0w$}-{hi:0w$}"));
            }
            i += 1;
        }
        format!("{}[{}]", self.prefix, parts.join(","))
    }
}

fn padded_width(digits: &str) -> Option<usize> {
    (digits.len() > 1 && digits.starts_with('0')).then_some(digits.len())
}
