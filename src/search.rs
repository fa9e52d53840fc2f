//! Finding where a new block can go inside existing container data
//!
//! A [`Needle`] is a block preprocessed for Boyer-Moore search. Besides plain substring search it
//! can find the longest suffix of a haystack which is also a prefix of the needle, which is how
//! a block is overlapped with the tail of a container.

use std::cmp;

/// A search pattern with precomputed Boyer-Moore tables
#[derive(Debug, Clone)]
pub struct Needle {
    data: Vec<u8>,
    /// Bad character shift, indexed by byte value
    occ: Box<[usize; 256]>,
    /// Good suffix shift, indexed by mismatch position
    skip: Vec<usize>,
}

impl Needle {
    pub fn new(data: Vec<u8>) -> Self {
        let occ = occurrence_table(&data);
        let skip = skip_table(&data);
        Self { data, occ, skip }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The first position at which the whole needle occurs in `haystack`
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        let m = self.data.len();
        let n = haystack.len();
        if m == 0 {
            return Some(0);
        }
        let mut j = 0;
        while j + m <= n {
            let mut i = m;
            while i > 0 && self.data[i - 1] == haystack[i - 1 + j] {
                i -= 1;
            }
            if i == 0 {
                return Some(j);
            }
            let mismatch = i - 1;
            let bad_char =
                self.occ[haystack[mismatch + j] as usize] as isize - (m - 1 - mismatch) as isize;
            j += cmp::max(self.skip[mismatch] as isize, bad_char).max(1) as usize;
        }
        None
    }

    /// The position of the longest suffix of `haystack` that is a prefix of the needle
    ///
    /// Only overlap lengths which are multiples of `granularity` and at least `min_overlap`
    /// (and at least 1) are considered.
    pub fn find_tail_overlap(
        &self,
        haystack: &[u8],
        min_overlap: usize,
        granularity: usize,
    ) -> Option<usize> {
        if self.is_empty() || granularity == 0 {
            return None;
        }
        let hlen = haystack.len();
        let longest = cmp::min(hlen, self.data.len());
        let longest = longest - longest % granularity;
        let shortest = cmp::max(min_overlap, 1);
        if longest < shortest {
            return None;
        }

        let first = self.data[0];
        let mut pos = hlen - longest;
        while hlen - pos >= shortest {
            if haystack[pos] == first && haystack[pos + 1..] == self.data[1..hlen - pos] {
                return Some(pos);
            }
            pos += granularity;
        }
        None
    }
}

fn occurrence_table(needle: &[u8]) -> Box<[usize; 256]> {
    let m = needle.len();
    let mut occ = Box::new([m.max(1); 256]);
    if m > 0 {
        for (i, &b) in needle[..m - 1].iter().enumerate() {
            occ[b as usize] = m - 1 - i;
        }
    }
    occ
}

fn suffixes(needle: &[u8]) -> Vec<isize> {
    let m = needle.len() as isize;
    let mut suff = vec![0isize; needle.len()];
    suff[(m - 1) as usize] = m;
    let mut g = m - 1;
    let mut f = m - 1;
    for i in (0..m - 1).rev() {
        if i > g && suff[(i + m - 1 - f) as usize] < i - g {
            suff[i as usize] = suff[(i + m - 1 - f) as usize];
        } else {
            if i < g {
                g = i;
            }
            f = i;
            while g >= 0 && needle[g as usize] == needle[(g + m - 1 - f) as usize] {
                g -= 1;
            }
            suff[i as usize] = f - g;
        }
    }
    suff
}

fn skip_table(needle: &[u8]) -> Vec<usize> {
    let m = needle.len();
    if m == 0 {
        return Vec::new();
    }
    let suff = suffixes(needle);
    let mut skip = vec![m; m];
    let mut j = 0;
    for i in (0..m).rev() {
        if suff[i] == i as isize + 1 {
            while j < m - 1 - i {
                if skip[j] == m {
                    skip[j] = m - 1 - i;
                }
                j += 1;
            }
        }
    }
    for i in 0..m.saturating_sub(1) {
        skip[m - 1 - suff[i] as usize] = m - 1 - i;
    }
    skip
}

/// The outcome of fitting a needle into a container
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct AppendInfo {
    /// Container size before the block is added
    pub old_size: usize,
    /// Where the block starts
    pub base_offset: usize,
    /// Container size after the block is added
    pub appended_size: usize,
}

impl AppendInfo {
    /// A plain append of `len` bytes
    pub fn append(old_size: usize, len: usize) -> Self {
        Self::at(old_size, old_size, len)
    }

    fn at(old_size: usize, base_offset: usize, len: usize) -> Self {
        Self {
            old_size,
            base_offset,
            appended_size: cmp::max(old_size, base_offset + len),
        }
    }

    /// Bytes which have to be written
    pub fn added(&self) -> usize {
        self.appended_size - self.old_size
    }

    /// Bytes of the block which are already in the container
    pub fn overlap(&self, len: usize) -> usize {
        len - self.added()
    }
}

/// Parameters for [`analyze_append`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OverlapLimits {
    pub min_overlap: usize,
    pub granularity: usize,
    /// The size the container may not grow beyond
    pub capacity: usize,
}

/// Find the cheapest way to add `needle` to a container currently holding `haystack`
///
/// A full occurrence of the needle costs nothing and is always preferred. Otherwise the longest
/// allowed tail overlap is used, and failing that a plain append. Returns None if the block
/// cannot be added without growing past `limits.capacity`.
pub fn analyze_append(
    needle: &Needle,
    haystack: &[u8],
    limits: OverlapLimits,
) -> Option<AppendInfo> {
    let old_size = haystack.len();
    let len = needle.len();
    if let Some(pos) = needle.find_in(haystack) {
        return Some(AppendInfo::at(old_size, pos, len));
    }

    let room = limits.capacity.saturating_sub(old_size);
    // Anything less than this much overlap would overflow the container
    let required = len.saturating_sub(room);
    if required > old_size {
        return None;
    }
    let min_overlap = cmp::max(limits.min_overlap, required);
    if let Some(pos) = needle.find_tail_overlap(haystack, min_overlap, limits.granularity) {
        return Some(AppendInfo::at(old_size, pos, len));
    }
    if required > 0 {
        return None;
    }
    Some(AppendInfo::append(old_size, len))
}
