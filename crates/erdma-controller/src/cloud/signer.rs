//! ACS3-HMAC-SHA256 request signing for the ECS RPC API.

use hmac::digest::InvalidLength;
use hmac::Hmac;
use hmac::Mac;
use sha2::Digest;
use sha2::Sha256;

pub(crate) const ALGORITHM: &str = "ACS3-HMAC-SHA256";

/// Inputs to one signature. Time and nonce are supplied by the caller so
/// signing stays deterministic.
#[derive(Debug)]
pub(crate) struct SigningInput<'a> {
    pub method: &'a str,
    pub host: &'a str,
    pub action: &'a str,
    pub version: &'a str,
    pub params: &'a [(String, String)],
    pub access_key_id: &'a str,
    pub access_key_secret: &'a str,
    pub security_token: Option<&'a str>,
    pub date: &'a str,
    pub nonce: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignedRequest {
    pub query: String,
    pub headers: Vec<(String, String)>,
}

/// RFC 3986 encoding as the gateway expects it.
pub(crate) fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

pub(crate) fn canonical_query(params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();
    encoded
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn hmac_sha256_hex(key: &[u8], data: &[u8]) -> Result<String, InvalidLength> {
    let mut mac = Hmac::<Sha256>::new_from_slice(key)?;
    mac.update(data);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub(crate) fn sign(input: &SigningInput<'_>) -> Result<SignedRequest, InvalidLength> {
    let hashed_payload = sha256_hex(b"");
    let mut headers = vec![
        ("host".to_string(), input.host.to_string()),
        ("x-acs-action".to_string(), input.action.to_string()),
        ("x-acs-content-sha256".to_string(), hashed_payload.clone()),
        ("x-acs-date".to_string(), input.date.to_string()),
        ("x-acs-signature-nonce".to_string(), input.nonce.to_string()),
        ("x-acs-version".to_string(), input.version.to_string()),
    ];
    if let Some(token) = input.security_token.filter(|t| !t.is_empty()) {
        headers.push(("x-acs-security-token".to_string(), token.to_string()));
    }
    headers.sort();

    let query = canonical_query(input.params);
    let canonical_headers: String = headers
        .iter()
        .map(|(k, v)| format!("{k}:{}\n", v.trim()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical_request = format!(
        "{}\n/\n{query}\n{canonical_headers}\n{signed_headers}\n{hashed_payload}",
        input.method
    );
    let string_to_sign = format!(
        "{ALGORITHM}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let signature = hmac_sha256_hex(
        input.access_key_secret.as_bytes(),
        string_to_sign.as_bytes(),
    )?;

    headers.push((
        "Authorization".to_string(),
        format!(
            "{ALGORITHM} Credential={},SignedHeaders={signed_headers},Signature={signature}",
            input.access_key_id
        ),
    ));

    Ok(SignedRequest { query, headers })
}
