//! Bearer-token parsing and ES256K verification.
//!
//! The `Authorization` header carries `bearer v1:<jwt>`; the JWT payload
//! holds the claims in [`TokenPayload`]. Signatures are ECDSA over
//! secp256k1 (`ES256K`) on the `header.payload` signing input, and the
//! issuer's public key hashes down to the base58-check bucket address that
//! scopes every object key.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use k256::ecdsa::signature::Verifier;
use k256::ecdsa::{Signature, VerifyingKey};
use ripemd::Ripemd160;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::errors::{HubError, HubResult};
use crate::models::auth::{
    AssociationPayload, AuthScopes, TokenPayload, MAX_AUTH_SCOPES,
};

pub const LATEST_AUTH_VERSION: &str = "v1";

const BEARER_PREFIX: &str = "bearer ";
const SIGNING_ALGORITHM: &str = "ES256K";

/// Canonical challenge text clients must sign for this hub.
pub fn challenge_text(server_name: &str) -> String {
    serde_json::json!([
        "gaiahub",
        "0",
        server_name,
        "blockstack_storage_please_sign"
    ])
    .to_string()
}

/// Base58-check address (version byte 0) of a hex-encoded secp256k1 key.
///
/// The key is normalized to its compressed encoding before hashing, so the
/// same point always maps to the same address.
pub fn address_from_public_key(pubkey_hex: &str) -> HubResult<String> {
    let bytes = hex::decode(pubkey_hex)
        .map_err(|_| HubError::validation("issuer public key is not valid hex"))?;
    let key = VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|_| HubError::validation("issuer public key is not a valid secp256k1 point"))?;
    let compressed = key.to_encoded_point(true);
    let sha = Sha256::digest(compressed.as_bytes());
    let hash160 = Ripemd160::digest(sha);
    Ok(bs58::encode(hash160.as_slice())
        .with_check_version(0)
        .into_string())
}

#[derive(Debug, Deserialize)]
struct TokenHeader {
    #[serde(default)]
    alg: Option<String>,
}

/// A decoded (not yet verified) bearer token.
#[derive(Debug, Clone)]
pub struct AuthToken {
    signing_input: String,
    signature: Vec<u8>,
    pub payload: TokenPayload,
}

/// Verification options derived from hub configuration plus the bucket's
/// current revocation floor.
#[derive(Debug, Clone)]
pub struct VerifyOptions<'a> {
    pub require_correct_hub_url: bool,
    pub valid_hub_urls: &'a [String],
    /// Oldest acceptable `iat`, unix seconds; 0 disables the check.
    pub oldest_valid_token_timestamp: u64,
}

impl Default for VerifyOptions<'_> {
    fn default() -> Self {
        VerifyOptions {
            require_correct_hub_url: false,
            valid_hub_urls: &[],
            oldest_valid_token_timestamp: 0,
        }
    }
}

/// Parse the `Authorization` header into a decoded token.
pub fn parse_auth_header(header: Option<&str>) -> HubResult<AuthToken> {
    let header = header.ok_or_else(|| HubError::validation("missing authorization header"))?;
    let is_bearer = header
        .get(..BEARER_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(BEARER_PREFIX));
    if !is_bearer {
        return Err(HubError::validation(
            "failed to parse authentication header",
        ));
    }
    let token = header[BEARER_PREFIX.len()..].trim();
    let Some(jwt) = token.strip_prefix("v1:") else {
        return Err(HubError::validation(
            "only v1 authentication tokens are supported",
        ));
    };
    decode_jwt(jwt)
}

fn decode_jwt(jwt: &str) -> HubResult<AuthToken> {
    let (signing_input, header, payload_bytes, signature) = split_jwt(jwt)?;
    let header: TokenHeader = serde_json::from_slice(&header)
        .map_err(|e| HubError::validation(format!("failed to parse token header: {e}")))?;
    if header.alg.as_deref() != Some(SIGNING_ALGORITHM) {
        return Err(HubError::validation(
            "authentication token must be signed with ES256K",
        ));
    }
    let payload: TokenPayload = serde_json::from_slice(&payload_bytes)
        .map_err(|e| HubError::validation(format!("failed to parse token payload: {e}")))?;
    Ok(AuthToken {
        signing_input,
        signature,
        payload,
    })
}

/// Split a compact JWT into (signing input, header bytes, payload bytes,
/// signature bytes).
fn split_jwt(jwt: &str) -> HubResult<(String, Vec<u8>, Vec<u8>, Vec<u8>)> {
    let mut parts = jwt.split('.');
    let (Some(h), Some(p), Some(s), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HubError::validation(
            "authentication token is not a three-part JWT",
        ));
    };
    let header = URL_SAFE_NO_PAD
        .decode(h)
        .map_err(|_| HubError::validation("token header is not valid base64url"))?;
    let payload = URL_SAFE_NO_PAD
        .decode(p)
        .map_err(|_| HubError::validation("token payload is not valid base64url"))?;
    let signature = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| HubError::validation("token signature is not valid base64url"))?;
    Ok((format!("{h}.{p}"), header, payload, signature))
}

fn verify_signature(signing_input: &str, signature: &[u8], pubkey_hex: &str) -> HubResult<()> {
    let key_bytes = hex::decode(pubkey_hex)
        .map_err(|_| HubError::validation("failed to verify supplied authentication JWT"))?;
    let key = VerifyingKey::from_sec1_bytes(&key_bytes)
        .map_err(|_| HubError::validation("failed to verify supplied authentication JWT"))?;
    let signature = Signature::from_slice(signature)
        .map_err(|_| HubError::validation("failed to verify supplied authentication JWT"))?;
    key.verify(signing_input.as_bytes(), &signature)
        .map_err(|_| HubError::validation("failed to verify supplied authentication JWT"))
}

fn now_secs() -> f64 {
    Utc::now().timestamp() as f64
}

/// Verify a decoded token against the bucket address and hub policy.
///
/// Returns the association issuer address when a valid `associationToken`
/// claim delegates write rights; `None` when the bucket owner signed the
/// token directly.
pub fn verify_token(
    token: &AuthToken,
    bucket_address: &str,
    challenges: &[String],
    opts: &VerifyOptions<'_>,
) -> HubResult<Option<String>> {
    let payload = &token.payload;
    let iss = payload
        .iss
        .as_deref()
        .ok_or_else(|| HubError::validation("token is missing the iss claim"))?;
    let issuer_address = address_from_public_key(iss)?;
    if issuer_address != bucket_address {
        return Err(HubError::validation("not allowed to write on this path"));
    }

    if opts.require_correct_hub_url {
        let hub_url = payload
            .hub_url
            .as_deref()
            .or(payload.gaia_hub_url.as_deref())
            .ok_or_else(|| HubError::validation("authentication token has no hubUrl claim"))?;
        let normalized = hub_url.trim_end_matches('/');
        if !opts
            .valid_hub_urls
            .iter()
            .any(|u| u.trim_end_matches('/') == normalized)
        {
            return Err(HubError::validation(format!(
                "the hubUrl claim {hub_url} is not valid for this hub"
            )));
        }
    }

    if let Some(scopes) = &payload.scopes {
        if scopes.len() > MAX_AUTH_SCOPES {
            return Err(HubError::validation(format!(
                "too many authentication scopes, maximum is {MAX_AUTH_SCOPES}"
            )));
        }
    }

    verify_signature(&token.signing_input, &token.signature, iss)?;

    let challenge = payload
        .gaia_challenge
        .as_deref()
        .ok_or_else(|| HubError::validation("token is missing the gaiaChallenge claim"))?;
    if !challenges.iter().any(|c| c == challenge) {
        return Err(HubError::validation(format!(
            "invalid gaiaChallenge text: {challenge}"
        )));
    }

    if let Some(exp) = payload.exp {
        if exp < now_secs() {
            return Err(HubError::validation("expired authentication token"));
        }
    }

    check_issued_at(payload.iat, opts.oldest_valid_token_timestamp)?;

    if let Some(association_jwt) = &payload.association_token {
        let asso_address = verify_association_token(
            association_jwt,
            bucket_address,
            opts.oldest_valid_token_timestamp,
        )?;
        return Ok(Some(asso_address));
    }
    Ok(None)
}

fn check_issued_at(iat: Option<f64>, oldest_valid: u64) -> HubResult<()> {
    if oldest_valid > 0 {
        if let Some(iat) = iat {
            if iat < oldest_valid as f64 {
                return Err(HubError::AuthTokenTimestamp {
                    oldest_valid_timestamp: oldest_valid,
                });
            }
        }
    }
    Ok(())
}

/// Verify a nested association token, returning its issuer address.
fn verify_association_token(
    jwt: &str,
    bucket_address: &str,
    oldest_valid: u64,
) -> HubResult<String> {
    let (signing_input, _header, payload_bytes, signature) = split_jwt(jwt)?;
    let payload: AssociationPayload = serde_json::from_slice(&payload_bytes)
        .map_err(|e| HubError::validation(format!("failed to parse association token: {e}")))?;

    let iss = payload
        .iss
        .as_deref()
        .ok_or_else(|| HubError::validation("association token is missing the iss claim"))?;
    let child = payload.child_to_associate.as_deref().ok_or_else(|| {
        HubError::validation("association token is missing the childToAssociate claim")
    })?;
    let exp = payload
        .exp
        .ok_or_else(|| HubError::validation("association token is missing the exp claim"))?;

    verify_signature(&signing_input, &signature, iss)?;

    if exp < now_secs() {
        return Err(HubError::validation("expired association token"));
    }
    if address_from_public_key(child)? != bucket_address {
        return Err(HubError::validation(
            "association token child key does not match the bucket address",
        ));
    }
    check_issued_at(payload.iat, oldest_valid)?;

    address_from_public_key(iss)
}

/// Partition the token's scope entries into the six path/prefix sets.
pub fn parsed_scopes(token: &AuthToken) -> AuthScopes {
    AuthScopes::from_entries(token.payload.scopes.as_deref().unwrap_or(&[]))
}


#[cfg(test)]
mod tests {
    use super::test_tokens::{bearer, keypair, sign_jwt};
    use super::*;
    use serde_json::json;

    const SERVER: &str = "hub.example.com";

    fn challenges() -> Vec<String> {
        vec![challenge_text(SERVER)]
    }

    fn base_payload(pubkey_hex: &str) -> serde_json::Value {
        json!({
            "iss": pubkey_hex,
            "gaiaChallenge": challenge_text(SERVER),
            "salt": "abcdef",
        })
    }

    #[test]
    fn challenge_text_is_the_json_array() {
        assert_eq!(
            challenge_text("hub.example.com"),
            r#"["gaiahub","0","hub.example.com","blockstack_storage_please_sign"]"#
        );
    }

    #[test]
    fn rejects_malformed_headers() {
        assert!(parse_auth_header(None).is_err());
        assert!(parse_auth_header(Some("basic abc")).is_err());
        assert!(parse_auth_header(Some("bearer v0:abc")).is_err());
        assert!(parse_auth_header(Some("bearer v1:not-a-jwt")).is_err());
    }

    #[test]
    fn verifies_a_valid_token() {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        let token = parse_auth_header(Some(&bearer(&base_payload(&pubkey_hex), &key))).unwrap();
        let result = verify_token(&token, &address, &challenges(), &VerifyOptions::default());
        assert!(matches!(result, Ok(None)));
    }

    #[test]
    fn rejects_wrong_bucket_address() {
        let (key, pubkey_hex) = keypair();
        let (_other_key, other_pubkey) = keypair();
        let other_address = address_from_public_key(&other_pubkey).unwrap();
        let token = parse_auth_header(Some(&bearer(&base_payload(&pubkey_hex), &key))).unwrap();
        let err = verify_token(&token, &other_address, &challenges(), &VerifyOptions::default())
            .unwrap_err();
        assert!(matches!(err, HubError::Validation(_)));
    }

    #[test]
    fn rejects_tampered_signature() {
        let (key, pubkey_hex) = keypair();
        let (other_key, _) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        // signed by a different key than the iss claim
        let header = format!("bearer v1:{}", sign_jwt(&base_payload(&pubkey_hex), &other_key));
        let token = parse_auth_header(Some(&header)).unwrap();
        assert!(
            verify_token(&token, &address, &challenges(), &VerifyOptions::default()).is_err()
        );
    }

    #[test]
    fn rejects_bad_challenge() {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        let mut payload = base_payload(&pubkey_hex);
        payload["gaiaChallenge"] = json!("something else");
        let token = parse_auth_header(Some(&bearer(&payload, &key))).unwrap();
        assert!(
            verify_token(&token, &address, &challenges(), &VerifyOptions::default()).is_err()
        );
    }

    #[test]
    fn rejects_expired_token() {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        let mut payload = base_payload(&pubkey_hex);
        payload["exp"] = json!(1_000_000);
        let token = parse_auth_header(Some(&bearer(&payload, &key))).unwrap();
        assert!(
            verify_token(&token, &address, &challenges(), &VerifyOptions::default()).is_err()
        );
    }

    #[test]
    fn enforces_the_revocation_floor() {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        let mut payload = base_payload(&pubkey_hex);
        payload["iat"] = json!(500);
        let token = parse_auth_header(Some(&bearer(&payload, &key))).unwrap();
        let opts = VerifyOptions {
            oldest_valid_token_timestamp: 1000,
            ..VerifyOptions::default()
        };
        let err = verify_token(&token, &address, &challenges(), &opts).unwrap_err();
        assert!(matches!(
            err,
            HubError::AuthTokenTimestamp {
                oldest_valid_timestamp: 1000
            }
        ));

        // a token at or above the floor passes
        payload["iat"] = json!(1000);
        let token = parse_auth_header(Some(&bearer(&payload, &key))).unwrap();
        assert!(verify_token(&token, &address, &challenges(), &opts).is_ok());
    }

    #[test]
    fn requires_hub_url_membership_when_configured() {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        let valid = vec!["https://hub.example.com".to_string()];
        let opts = VerifyOptions {
            require_correct_hub_url: true,
            valid_hub_urls: &valid,
            ..VerifyOptions::default()
        };

        let token = parse_auth_header(Some(&bearer(&base_payload(&pubkey_hex), &key))).unwrap();
        assert!(verify_token(&token, &address, &challenges(), &opts).is_err());

        // trailing slash on the claim normalizes away
        let mut payload = base_payload(&pubkey_hex);
        payload["hubUrl"] = json!("https://hub.example.com/");
        let token = parse_auth_header(Some(&bearer(&payload, &key))).unwrap();
        assert!(verify_token(&token, &address, &challenges(), &opts).is_ok());
    }

    #[test]
    fn rejects_more_than_eight_scopes() {
        let (key, pubkey_hex) = keypair();
        let address = address_from_public_key(&pubkey_hex).unwrap();
        let entries: Vec<_> = (0..9)
            .map(|i| json!({"scope": "putFile", "domain": format!("f{i}.txt")}))
            .collect();
        let mut payload = base_payload(&pubkey_hex);
        payload["scopes"] = json!(entries);
        let token = parse_auth_header(Some(&bearer(&payload, &key))).unwrap();
        assert!(
            verify_token(&token, &address, &challenges(), &VerifyOptions::default()).is_err()
        );
    }

    #[test]
    fn association_token_delegates_to_its_issuer() {
        let (bucket_key, bucket_pubkey) = keypair();
        let (app_key, app_pubkey) = keypair();
        let bucket_address = address_from_public_key(&bucket_pubkey).unwrap();
        let app_address = address_from_public_key(&app_pubkey).unwrap();

        let association = sign_jwt(
            &json!({
                "iss": app_pubkey,
                "childToAssociate": bucket_pubkey,
                "exp": 4_000_000_000u64,
                "iat": 1_700_000_000u64,
                "salt": "0011",
            }),
            &app_key,
        );
        let mut payload = base_payload(&bucket_pubkey);
        payload["associationToken"] = json!(association);
        let token = parse_auth_header(Some(&bearer(&payload, &bucket_key))).unwrap();
        let signer = verify_token(&token, &bucket_address, &challenges(), &VerifyOptions::default())
            .unwrap();
        assert_eq!(signer, Some(app_address));
    }

    #[test]
    fn association_token_requires_exp_and_matching_child() {
        let (bucket_key, bucket_pubkey) = keypair();
        let (app_key, app_pubkey) = keypair();
        let bucket_address = address_from_public_key(&bucket_pubkey).unwrap();

        // missing exp
        let association = sign_jwt(
            &json!({"iss": app_pubkey, "childToAssociate": bucket_pubkey, "salt": "00"}),
            &app_key,
        );
        let mut payload = base_payload(&bucket_pubkey);
        payload["associationToken"] = json!(association);
        let token = parse_auth_header(Some(&bearer(&payload, &bucket_key))).unwrap();
        assert!(verify_token(&token, &bucket_address, &challenges(), &VerifyOptions::default())
            .is_err());

        // child key that is not the bucket key
        let association = sign_jwt(
            &json!({
                "iss": app_pubkey,
                "childToAssociate": app_pubkey,
                "exp": 4_000_000_000u64,
                "salt": "00",
            }),
            &app_key,
        );
        let mut payload = base_payload(&bucket_pubkey);
        payload["associationToken"] = json!(association);
        let token = parse_auth_header(Some(&bearer(&payload, &bucket_key))).unwrap();
        assert!(verify_token(&token, &bucket_address, &challenges(), &VerifyOptions::default())
            .is_err());
    }
}
