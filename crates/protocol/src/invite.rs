/// Invite token prefix — tokens look like `dbot-XXXX-XXXX-XXXX-XXXX`.
pub const INVITE_PREFIX: &str = "dbot-";

/// Alphabet for invite token groups. Skips 0/O and 1/I to survive
/// being read aloud.
const ALPHABET: &[u8] = b"23456789ABCDEFGHJKLMNPQRSTUVWXYZ";

/// Build a token from sixteen pre-picked alphabet indices.
/// The caller supplies randomness; this keeps the format testable.
pub fn format_invite(indices: &[u8; 16]) -> String {
    let mut out = String::with_capacity(24);
    out.push_str(INVITE_PREFIX);
    for (i, idx) in indices.iter().enumerate() {
        if i > 0 && i % 4 == 0 {
            out.push('-');
        }
        out.push(ALPHABET[(*idx as usize) % ALPHABET.len()] as char);
    }
    out
}

/// Structural check: `dbot-` prefix plus four dash-separated groups of
/// four alphabet characters.
pub fn is_invite_format(token: &str) -> bool {
    let Some(rest) = token.strip_prefix(INVITE_PREFIX) else {
        return false;
    };
    let groups: Vec<&str> = rest.split('-').collect();
    groups.len() == 4
        && groups.iter().all(|g| {
            g.len() == 4 && g.bytes().all(|b| ALPHABET.contains(&b))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formatted_tokens_validate() {
        let token = format_invite(&[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]);
        assert!(token.starts_with("dbot-"));
        assert_eq!(token.len(), "dbot-XXXX-XXXX-XXXX-XXXX".len());
        assert!(is_invite_format(&token));
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(!is_invite_format("dbot-AAAA-BBBB-CCCC"));
        assert!(!is_invite_format("xbot-AAAA-BBBB-CCCC-DDDD"));
        assert!(!is_invite_format("dbot-AAAA-BBBB-CCCC-DD"));
        assert!(!is_invite_format("dbot-AA0A-BBBB-CCCC-DDDD")); // 0 not in alphabet
        assert!(!is_invite_format(""));
    }
}
