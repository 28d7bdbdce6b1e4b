use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use sha1::Sha1;

/// Percent-encode everything outside the RFC 3986 unreserved set.
///
/// CloudStack verifies against Java's `URLEncoder` output with `+`
/// rewritten to `%20`, which matches this.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Build the query string in the order CloudStack signs it: keys sorted
/// case-insensitively, values encoded.
pub fn canonical_query(params: &[(String, String)]) -> String {
    let mut sorted: Vec<&(String, String)> = params.iter().collect();
    sorted.sort_by_key(|(k, _)| k.to_lowercase());
    sorted
        .iter()
        .map(|(k, v)| format!("{k}={}", encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Base64 HMAC-SHA1 of the lowercased canonical query.
pub fn signature(canonical: &str, secret_key: &str) -> String {
    let mut mac =
        Hmac::<Sha1>::new_from_slice(secret_key.as_bytes()).expect("HMAC accepts any key size");
    mac.update(canonical.to_lowercase().as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn encode_escapes_reserved_characters() {
        assert_eq!(encode("web 01"), "web%2001");
        assert_eq!(encode("a+b/c=d"), "a%2Bb%2Fc%3Dd");
        assert_eq!(encode("safe-_.~"), "safe-_.~");
    }

    #[test]
    fn canonical_query_sorts_keys_case_insensitively() {
        let query = canonical_query(&pairs(&[
            ("response", "json"),
            ("command", "listZones"),
            ("apiKey", "KEY"),
            ("details[0].cpuNumber", "2"),
        ]));
        assert_eq!(
            query,
            "apiKey=KEY&command=listZones&details[0].cpuNumber=2&response=json"
        );
    }

    #[test]
    fn signature_ignores_query_case() {
        let a = signature("apikey=KEY&command=listZones", "secret");
        let b = signature("APIKEY=key&COMMAND=LISTZONES", "secret");
        assert_eq!(a, b);
        assert_ne!(a, signature("apikey=KEY&command=listZones", "other"));
    }
}
