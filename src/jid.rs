//! JID helpers: match rules, node extraction and node validation.
//!
//! A full JID is `node@domain/resource`; the bare JID is the part before
//! the first `/`. The server supports at most one resource per bare JID,
//! which is why the conflict check at authentication compares bare JIDs.

/// Routing match: exact when the target carries a resource, otherwise a
/// case-sensitive compare against the client's bare JID.
pub fn jid_matches(to: &str, jid: &str) -> bool {
    if to.contains('/') {
        return to == jid;
    }
    to == bare(jid)
}

/// Conflict match used at authentication: case-insensitive equality of the
/// bare portions.
pub fn bare_jid_match(a: &str, b: &str) -> bool {
    eq_fold(bare(a), bare(b))
}

/// The bare JID: everything before the first `/`.
pub fn bare(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}

/// The node: everything before the first `@`.
pub fn node(jid: &str) -> &str {
    jid.split('@').next().unwrap_or(jid)
}

/// Validate a username as a JID node: non-empty, at most 256 bytes, and
/// free of the characters RFC 7622 forbids in a node.
pub fn node_valid(s: &str) -> bool {
    if s.is_empty() || s.len() > 256 {
        return false;
    }
    !s.chars().any(|c| {
        matches!(
            c,
            '"' | '&' | '\'' | '/' | ':' | '<' | '>' | '@' | '\u{7F}' | '\u{FFFE}' | '\u{FFFF}'
        )
    })
}

/// Unicode case-insensitive string equality (simple case folding). Room
/// lookup on join uses this over the full JID.
pub fn eq_fold(a: &str, b: &str) -> bool {
    a.chars()
        .flat_map(char::to_lowercase)
        .eq(b.chars().flat_map(char::to_lowercase))
}
