use sg_auth::{hash_token, mask_token};

/// The storage form of a raw key is stable across processes and releases:
/// downstream spend rows key on it.
#[test]
fn scenario_hash_constancy() {
    assert_eq!(
        hash_token("sk-iq0apw_l6s9IJRu2PBVu-g"),
        "f3d29bbcc0d020bb5875a9097827edea6b6f0944e415a26ded616dcbcaca42f3"
    );
    assert_eq!(hash_token("non-sk"), "non-sk");
}

/// Hashing an already-hashed value is the identity: the digest carries no
/// `sk-` prefix, so a second pass sees a pass-through input.
#[test]
fn scenario_hash_idempotence() {
    for raw in ["sk-iq0apw_l6s9IJRu2PBVu-g", "sk-", "plain", ""] {
        let once = hash_token(raw);
        assert_eq!(hash_token(&once), once, "double hash changed {raw:?}");
    }
}

/// Masked tokens are safe for log lines: at most four leading characters
/// survive.
#[test]
fn scenario_mask_never_leaks_short_tokens() {
    assert_eq!(mask_token(""), "");
    assert_eq!(mask_token("ab"), "***");
    assert_eq!(mask_token("abcd"), "***");
    assert_eq!(
        mask_token("f3d29bbcc0d020bb5875a9097827edea"),
        "f3d2..."
    );
}
