use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::types::ClaimSet;

/// Claims that describe the token itself rather than the subject.
const PROTOCOL_CLAIMS: &[&str] = &[
    "iss", "aud", "exp", "nbf", "iat", "auth_time", "nonce", "at_hash", "c_hash", "azp",
    "acr", "amr", "sid", "s_hash",
];

/// Decodes the payload of a compact JWT identity token.
///
/// The signature is not checked here: the token arrives directly from the
/// token endpoint over TLS and only its claims are read.
///
/// # Errors
///
/// Returns [`Error::Protocol`] if the token is not a three-part JWT, the
/// payload is not base64url JSON, or the `sub` claim is missing.
pub fn decode_claims(id_token: &str) -> Result<ClaimSet, Error> {
    let parts: Vec<&str> = id_token.split('.').collect();
    if parts.len() != 3 {
        return Err(malformed("identity token is not a compact JWT"));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|_| malformed("identity token payload is not base64url"))?;

    let json: JsonValue = serde_json::from_slice(&payload)
        .map_err(|_| malformed("identity token payload is not JSON"))?;

    let JsonValue::Object(map) = json else {
        return Err(malformed("identity token payload is not an object"));
    };

    let claims = ClaimSet::from(map);
    if claims.subject().is_none() {
        return Err(malformed("missing claim: sub"));
    }
    Ok(claims)
}

/// Checks the `nonce` claim against the value sent with the authorization request.
pub(crate) fn check_nonce(claims: &ClaimSet, expected: Option<&str>) -> Result<(), Error> {
    let Some(expected) = expected else {
        return Ok(());
    };
    match claims.string("nonce") {
        Some(actual) if actual == expected => Ok(()),
        Some(_) => Err(malformed("nonce mismatch")),
        None => Err(malformed("missing claim: nonce")),
    }
}

/// Subject claims only, with token bookkeeping claims removed.
pub(crate) fn profile_claims(claims: ClaimSet) -> ClaimSet {
    claims
        .iter()
        .filter(|(name, _)| !PROTOCOL_CLAIMS.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect::<serde_json::Map<_, _>>()
        .into()
}

fn malformed(detail: &str) -> Error {
    Error::Protocol {
        operation: "identity token decoding",
        status: None,
        detail: detail.into(),
        code: None,
    }
}

#[cfg(test)]
pub(crate) fn encode_unsigned(claims: &JsonValue) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{header}.{payload}.sig")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn decodes_subject_and_claims() {
        let token = encode_unsigned(&json!({"sub": "42", "email": "a@b.com", "nonce": "n1"}));
        let claims = decode_claims(&token).unwrap();
        assert_eq!(claims.subject().unwrap().0, "42");
        assert_eq!(claims.string("email"), Some("a@b.com"));
        assert!(check_nonce(&claims, Some("n1")).is_ok());
        assert!(check_nonce(&claims, Some("other")).is_err());
        assert!(check_nonce(&claims, None).is_ok());
    }

    #[test]
    fn rejects_malformed_tokens() {
        assert!(decode_claims("not-a-jwt").is_err());
        assert!(decode_claims("a.!!!.c").is_err());
        let no_sub = encode_unsigned(&json!({"email": "a@b.com"}));
        assert!(decode_claims(&no_sub).is_err());
    }

    #[test]
    fn profile_drops_protocol_claims() {
        let token = encode_unsigned(&json!({
            "sub": "1", "iss": "https://idp", "aud": "abc", "exp": 1, "nonce": "x", "name": "Ada"
        }));
        let profile = profile_claims(decode_claims(&token).unwrap());
        assert!(profile.get("iss").is_none());
        assert!(profile.get("nonce").is_none());
        assert_eq!(profile.string("name"), Some("Ada"));
        assert_eq!(profile.string("sub"), Some("1"));
    }
}
