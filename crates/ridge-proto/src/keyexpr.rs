//! Key expressions — hierarchical names with wildcards.
//!
//! A key expression is a `/`-separated path. Three wildcards exist:
//! `*` matches exactly one chunk, `**` matches zero or more chunks, and
//! `$*` inside a chunk matches any substring (possibly empty).
//!
//! A [`KeyExpr`] is always canonical: no empty chunks, no leading or
//! trailing `/`, no `$*$*` runs, no chunk that is exactly `$*` (that is
//! spelled `*`), and `*`/`**` only as standalone chunks.

use std::sync::Arc;

use crate::{ProtoError, Result};

/// A canonical key expression.
///
/// Cloning is cheap; the string is shared.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct KeyExpr(Arc<str>);

impl KeyExpr {
    /// Canonicalize `s` into a key expression, rejecting malformed input.
    pub fn new(s: impl AsRef<str>) -> Result<Self> {
        canonize(s.as_ref()).map(|c| KeyExpr(Arc::from(c)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Does this expression contain any wildcard?
    pub fn is_wild(&self) -> bool {
        self.0.contains('*')
    }

    /// Inclusion: every concrete key matched by `other` is matched by `self`.
    pub fn includes(&self, other: &KeyExpr) -> bool {
        if self.0 == other.0 {
            return true;
        }
        let a: Vec<&str> = self.0.split('/').collect();
        let b: Vec<&str> = other.0.split('/').collect();
        includes_chunks(&a, &b)
    }

    /// Intersection: some concrete key is matched by both expressions.
    pub fn intersects(&self, other: &KeyExpr) -> bool {
        if self.0 == other.0 {
            return true;
        }
        // When neither side is wild, intersection is plain equality.
        if !self.is_wild() && !other.is_wild() {
            return false;
        }
        let a: Vec<&str> = self.0.split('/').collect();
        let b: Vec<&str> = other.0.split('/').collect();
        intersects_chunks(&a, &b)
    }
}

impl std::fmt::Display for KeyExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for KeyExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ke`{}`", self.0)
    }
}

impl std::ops::Deref for KeyExpr {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for KeyExpr {
    type Error = ProtoError;
    fn try_from(s: &str) -> Result<Self> {
        KeyExpr::new(s)
    }
}

// ── Canonicalization ──────────────────────────────────────────────────────────

fn canonize(s: &str) -> Result<String> {
    if s.is_empty() || s.starts_with('/') || s.ends_with('/') {
        return Err(ProtoError::ParseKeyExpr);
    }
    let mut out = String::with_capacity(s.len());
    for chunk in s.split('/') {
        if !out.is_empty() {
            out.push('/');
        }
        canonize_chunk(chunk, &mut out)?;
    }
    Ok(out)
}

fn canonize_chunk(chunk: &str, out: &mut String) -> Result<()> {
    if chunk.is_empty() {
        return Err(ProtoError::ParseKeyExpr);
    }
    if chunk == "*" || chunk == "**" {
        out.push_str(chunk);
        return Ok(());
    }
    let bytes = chunk.as_bytes();
    let start = out.len();
    let mut lit_from = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            // A bare `*` inside a chunk ("***", "a*b") is malformed; the
            // sub-chunk wildcard is spelled `$*`.
            b'*' => return Err(ProtoError::ParseKeyExpr),
            b'$' => {
                if bytes.get(i + 1) != Some(&b'*') {
                    return Err(ProtoError::ParseKeyExpr);
                }
                out.push_str(&chunk[lit_from..i]);
                out.push_str("$*");
                // Collapse a run of `$*$*...` into a single `$*`.
                i += 2;
                while bytes[i..].starts_with(b"$*") {
                    i += 2;
                }
                lit_from = i;
            }
            _ => i += 1,
        }
    }
    out.push_str(&chunk[lit_from..]);
    // A chunk that collapses to exactly `$*` must be written `*`.
    if &out[start..] == "$*" {
        return Err(ProtoError::ParseKeyExpr);
    }
    Ok(())
}

// ── Inclusion ─────────────────────────────────────────────────────────────────

fn includes_chunks(a: &[&str], b: &[&str]) -> bool {
    let Some(&ac) = a.first() else {
        return b.is_empty();
    };
    if ac == "**" {
        if a.len() == 1 {
            return true;
        }
        // `**` absorbs zero or more of b's chunks.
        return includes_chunks(&a[1..], b) || (!b.is_empty() && includes_chunks(a, &b[1..]));
    }
    let Some(&bc) = b.first() else {
        return false;
    };
    if bc == "**" {
        // b reaches keys of arbitrary depth; a concrete head cannot cover them.
        return false;
    }
    let head_ok = if ac == "*" {
        true
    } else if bc == "*" {
        false
    } else {
        chunk_includes(ac.as_bytes(), bc.as_bytes())
    };
    head_ok && includes_chunks(&a[1..], &b[1..])
}

/// Does sub-chunk pattern `a` include every string matched by `b`?
fn chunk_includes(a: &[u8], b: &[u8]) -> bool {
    if a == b {
        return true;
    }
    if a.starts_with(b"$*") {
        if a.len() == 2 {
            return true;
        }
        return chunk_includes(&a[2..], b) || (!b.is_empty() && chunk_includes(a, skip_atom(b)));
    }
    match (a.first(), b.first()) {
        (Some(_), Some(&b'$')) => false, // b is wild here, a is not
        (Some(x), Some(y)) => x == y && chunk_includes(&a[1..], &b[1..]),
        (None, None) => true,
        _ => false,
    }
}

fn skip_atom(b: &[u8]) -> &[u8] {
    if b.starts_with(b"$*") {
        &b[2..]
    } else {
        &b[1..]
    }
}

// ── Intersection ──────────────────────────────────────────────────────────────

fn intersects_chunks(a: &[&str], b: &[&str]) -> bool {
    if a.is_empty() || b.is_empty() {
        return a.is_empty() && b.is_empty();
    }
    if a[0] == "**" {
        if a.len() == 1 {
            return true;
        }
        return intersects_chunks(&a[1..], b) || intersects_chunks(a, &b[1..]);
    }
    if b[0] == "**" {
        if b.len() == 1 {
            return true;
        }
        return intersects_chunks(a, &b[1..]) || intersects_chunks(&a[1..], b);
    }
    let head_ok =
        a[0] == "*" || b[0] == "*" || chunk_intersects(a[0].as_bytes(), b[0].as_bytes());
    head_ok
        && (a.len() == 1) == (b.len() == 1)
        && (a.len() == 1 || intersects_chunks(&a[1..], &b[1..]))
}

/// Do sub-chunk patterns `l` and `r` match a common string?
fn chunk_intersects(l: &[u8], r: &[u8]) -> bool {
    if l == r {
        return true;
    }
    if l.starts_with(b"$*") {
        if l.len() == 2 {
            return true;
        }
        return chunk_intersects(&l[2..], r) || (!r.is_empty() && chunk_intersects(l, &r[1..]));
    }
    if r.starts_with(b"$*") {
        if r.len() == 2 {
            return true;
        }
        return chunk_intersects(l, &r[2..]) || (!l.is_empty() && chunk_intersects(&l[1..], r));
    }
    match (l.first(), r.first()) {
        (Some(x), Some(y)) => x == y && chunk_intersects(&l[1..], &r[1..]),
        (None, None) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ke(s: &str) -> KeyExpr {
        KeyExpr::new(s).unwrap()
    }

    fn inter(a: &str, b: &str) -> bool {
        ke(a).intersects(&ke(b))
    }

    fn incl(a: &str, b: &str) -> bool {
        ke(a).includes(&ke(b))
    }

    #[test]
    fn rejects_malformed() {
        for bad in ["", "/", "/a", "a/", "a//b", "$*", "a/$*$*/b", "a*b", "***", "a$"] {
            assert!(KeyExpr::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn collapses_dollar_star_runs() {
        assert_eq!(ke("a$*$*b").as_str(), "a$*b");
        assert_eq!(ke("x/a$*$*$*b/y").as_str(), "x/a$*b/y");
    }

    #[test]
    fn accepts_plain_and_wild() {
        for good in ["a", "a/b/c", "*", "**", "a/*/c", "a/**", "a/b$*", "a/$*b/c"] {
            assert!(KeyExpr::new(good).is_ok(), "{good:?} should be accepted");
        }
    }

    #[test]
    fn intersection_table() {
        // The table the original implementation ships with, plus spec cases.
        assert!(inter("a", "a"));
        assert!(inter("a/b", "a/b"));
        assert!(inter("*", "a"));
        assert!(inter("a", "*"));
        assert!(inter("*", "aaaaa"));
        assert!(inter("**", "a"));
        assert!(inter("a", "**"));
        assert!(inter("a/a/a/a", "**"));
        assert!(inter("a/*", "a/b"));
        assert!(!inter("a/*/b", "a/b"));
        assert!(inter("a/**/b", "a/b"));
        assert!(inter("a/b$*", "a/b"));
        assert!(inter("a/$*b$*", "a/b"));
        assert!(inter("a/$*b", "a/b"));
        assert!(inter("a/b$*", "a/bc"));
        assert!(inter("a/$*b$*", "a/ebc"));
        assert!(inter("a/$*b", "a/cb"));
        assert!(!inter("a/b$*", "a/ebc"));
        assert!(!inter("a/$*b", "a/cbc"));
        assert!(inter("a/**/b$*", "a/b"));
        assert!(inter("a/**/$*b$*", "a/b"));
        assert!(inter("a/**/$*b", "a/b"));
        assert!(inter("a/**/b$*", "a/bc"));
        assert!(inter("a/**/$*b$*", "a/ebc"));
        assert!(inter("a/**/$*b", "a/cb"));
        assert!(!inter("a/**/b$*", "a/ebc"));
        assert!(!inter("a/**/$*b", "a/cbc"));
        assert!(inter("**", "**"));
        assert!(!inter("a/*", "a/b/c"));
        assert!(!inter("a/b", "a/c"));
    }

    #[test]
    fn inclusion_table() {
        assert!(incl("**", "a/b/c"));
        assert!(incl("**", "**"));
        assert!(incl("a/**", "a/b/c"));
        assert!(incl("a/**", "a/**/c"));
        assert!(incl("a/*", "a/b"));
        assert!(!incl("a/b", "a/*"));
        assert!(incl("*", "*"));
        assert!(!incl("*", "**"));
        assert!(incl("a/b$*", "a/bc"));
        assert!(incl("a/b$*", "a/b"));
        assert!(!incl("a/b$*", "a/cb"));
        assert!(!incl("a/b/c", "a/b"));
        assert!(!incl("a/b", "a/b/c"));
    }

    #[test]
    fn inclusion_implies_intersection() {
        let exprs = [
            "a", "a/b", "a/*", "a/**", "**", "a/b$*", "a/$*b/c", "*/b", "a/**/c",
        ];
        for x in exprs {
            for y in exprs {
                let (x, y) = (ke(x), ke(y));
                if x.includes(&y) {
                    assert!(x.intersects(&y), "{x} includes {y} but does not intersect");
                }
            }
        }
    }

    #[test]
    fn inclusion_is_transitive() {
        let exprs = [
            "a/b/c", "a/b/*", "a/*/c", "a/**", "**", "a/b$*/c", "a/*/*", "a/**/c",
        ];
        for x in exprs {
            for y in exprs {
                for z in exprs {
                    let (x, y, z) = (ke(x), ke(y), ke(z));
                    if x.includes(&y) && y.includes(&z) {
                        assert!(x.includes(&z), "{x} ⊇ {y} ⊇ {z} but not {x} ⊇ {z}");
                    }
                }
            }
        }
    }

    #[test]
    fn intersection_is_symmetric() {
        let exprs = ["a", "a/b", "a/*", "a/**", "**", "a/b$*", "*/b", "a/**/c"];
        for x in exprs {
            for y in exprs {
                assert_eq!(inter(x, y), inter(y, x), "symmetry broke on ({x}, {y})");
            }
        }
    }
}
