//! AWS Signature V4. The canonical request is built from method, path,
//! query, headers and the payload SHA-256; `x-amz-content-sha256` is
//! always derived from the full payload.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use crate::config::ProviderSecrets;
use crate::{GatewayError, Result};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone)]
pub struct SigV4Timestamp {
    pub amz_date: String,
    pub date: String,
}

impl SigV4Timestamp {
    pub fn now() -> Result<Self> {
        Self::from_datetime(OffsetDateTime::now_utc())
    }

    pub fn from_datetime(datetime: OffsetDateTime) -> Result<Self> {
        const AMZ_FORMAT: &[FormatItem<'_>] =
            format_description!("[year][month][day]T[hour][minute][second]Z");
        const DATE_FORMAT: &[FormatItem<'_>] = format_description!("[year][month][day]");

        let amz_date = datetime
            .format(AMZ_FORMAT)
            .map_err(|err| GatewayError::Internal(format!("sigv4 amz date format: {err}")))?;
        let date = datetime
            .format(DATE_FORMAT)
            .map_err(|err| GatewayError::Internal(format!("sigv4 date format: {err}")))?;
        Ok(Self { amz_date, date })
    }

    pub fn from_amz_date(amz_date: &str) -> Result<Self> {
        let amz_date = amz_date.trim();
        if amz_date.len() < 8 {
            return Err(GatewayError::Internal(
                "sigv4 amz date must be at least 8 chars".to_string(),
            ));
        }
        Ok(Self {
            amz_date: amz_date.to_string(),
            date: amz_date[..8].to_string(),
        })
    }
}

#[derive(Clone)]
pub struct SigV4Signer {
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
    region: String,
    service: String,
}

impl std::fmt::Debug for SigV4Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigV4Signer")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("region", &self.region)
            .field("service", &self.service)
            .finish()
    }
}

/// Headers to set on the outgoing request after signing.
#[derive(Debug, Clone)]
pub struct SignedHeaders {
    pub authorization: String,
    pub amz_date: String,
    pub content_sha256: String,
    pub host: String,
    pub security_token: Option<String>,
}

impl SignedHeaders {
    pub fn insert_into(&self, headers: &mut BTreeMap<String, String>) {
        headers.insert("authorization".to_string(), self.authorization.clone());
        headers.insert("x-amz-date".to_string(), self.amz_date.clone());
        headers.insert(
            "x-amz-content-sha256".to_string(),
            self.content_sha256.clone(),
        );
        headers.insert("host".to_string(), self.host.clone());
        if let Some(token) = &self.security_token {
            headers.insert("x-amz-security-token".to_string(), token.clone());
        }
    }
}

impl SigV4Signer {
    pub fn new(
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
        session_token: Option<String>,
        region: impl Into<String>,
        service: impl Into<String>,
    ) -> Result<Self> {
        let signer = Self {
            access_key: access_key.into(),
            secret_key: secret_key.into(),
            session_token,
            region: region.into(),
            service: service.into(),
        };
        for (label, value) in [
            ("access_key", &signer.access_key),
            ("secret_key", &signer.secret_key),
            ("region", &signer.region),
            ("service", &signer.service),
        ] {
            if value.trim().is_empty() {
                return Err(GatewayError::Config(format!("sigv4 {label} is required")));
            }
        }
        Ok(signer)
    }

    /// Builds a Bedrock signer from the startup environment snapshot.
    pub fn from_secrets(secrets: &ProviderSecrets, region: &str, service: &str) -> Result<Self> {
        let access_key = secrets
            .aws_access_key_id
            .clone()
            .ok_or(GatewayError::ExpiredCredentials)?;
        let secret_key = secrets
            .aws_secret_access_key
            .clone()
            .ok_or(GatewayError::ExpiredCredentials)?;
        Self::new(
            access_key,
            secret_key,
            secrets.aws_session_token.clone(),
            region,
            service,
        )
    }

    pub fn sign(
        &self,
        method: &str,
        url: &str,
        headers: &BTreeMap<String, String>,
        payload: &[u8],
        timestamp: SigV4Timestamp,
    ) -> Result<SignedHeaders> {
        let url = Url::parse(url)
            .map_err(|err| GatewayError::Internal(format!("sigv4 invalid url {url:?}: {err}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| GatewayError::Internal("sigv4 url missing host".to_string()))?;
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let payload_hash = sha256_hex(payload);
        let all_headers = prepare_headers(
            headers,
            &host,
            &timestamp.amz_date,
            &payload_hash,
            self.session_token.as_deref(),
        );
        let (canonical_headers, signed_header_names) = canonical_headers(&all_headers);
        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method.trim(),
            canonical_uri(&url),
            canonical_query(&url),
            canonical_headers,
            signed_header_names,
            payload_hash
        );

        let scope = format!(
            "{}/{}/{}/aws4_request",
            timestamp.date, self.region, self.service
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            timestamp.amz_date,
            scope,
            sha256_hex(canonical_request.as_bytes())
        );
        let signature = self.derive_signature(&timestamp.date, &string_to_sign)?;
        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.access_key, scope, signed_header_names, signature
        );

        Ok(SignedHeaders {
            authorization,
            amz_date: timestamp.amz_date,
            content_sha256: payload_hash,
            host,
            security_token: self.session_token.clone(),
        })
    }

    fn derive_signature(&self, date: &str, string_to_sign: &str) -> Result<String> {
        let k_date = hmac_sha256(format!("AWS4{}", self.secret_key).as_bytes(), date)?;
        let k_region = hmac_sha256(&k_date, &self.region)?;
        let k_service = hmac_sha256(&k_region, &self.service)?;
        let k_signing = hmac_sha256(&k_service, "aws4_request")?;
        Ok(hex_encode(&hmac_sha256(&k_signing, string_to_sign)?))
    }
}

fn prepare_headers(
    headers: &BTreeMap<String, String>,
    host: &str,
    amz_date: &str,
    payload_hash: &str,
    session_token: Option<&str>,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::<String, String>::new();
    for (name, value) in headers {
        let name = name.trim();
        if name.is_empty() {
            continue;
        }
        let key = name.to_ascii_lowercase();
        let value = normalize_header_value(value);
        if let Some(existing) = out.get_mut(&key) {
            if !existing.is_empty() {
                existing.push(',');
            }
            existing.push_str(&value);
        } else {
            out.insert(key, value);
        }
    }

    out.entry("host".to_string())
        .or_insert_with(|| host.to_string());
    out.insert("x-amz-date".to_string(), amz_date.to_string());
    out.entry("x-amz-content-sha256".to_string())
        .or_insert_with(|| payload_hash.to_string());
    if let Some(token) = session_token {
        out.insert(
            "x-amz-security-token".to_string(),
            normalize_header_value(token),
        );
    }
    out
}

fn canonical_headers(headers: &BTreeMap<String, String>) -> (String, String) {
    let mut canonical = String::new();
    let mut names = Vec::<&str>::new();
    for (name, value) in headers {
        canonical.push_str(name);
        canonical.push(':');
        canonical.push_str(value);
        canonical.push('\n');
        names.push(name);
    }
    (canonical, names.join(";"))
}

fn canonical_uri(url: &Url) -> String {
    let path = url.path();
    if path.is_empty() {
        "/".to_string()
    } else {
        aws_percent_encode(path, false)
    }
}

fn canonical_query(url: &Url) -> String {
    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(name, value)| {
            (
                aws_percent_encode(&name, true),
                aws_percent_encode(&value, true),
            )
        })
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("&")
}

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn aws_percent_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::new();
    for &byte in value.as_bytes() {
        let unreserved =
            matches!(byte, b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~');
        if unreserved || (!encode_slash && byte == b'/') {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX_CHARS[(byte >> 4) as usize] as char);
            out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
        }
    }
    out
}

fn normalize_header_value(value: &str) -> String {
    let mut out = String::new();
    let mut last_space = false;
    for ch in value.chars() {
        if ch.is_whitespace() {
            if !last_space {
                out.push(' ');
                last_space = true;
            }
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out.trim().to_string()
}

fn hmac_sha256(key: &[u8], data: &str) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| GatewayError::Internal(format!("sigv4 hmac key: {err}")))?;
    mac.update(data.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signs_known_answer_vector() -> Result<()> {
        let signer = SigV4Signer::new(
            "AKIDEXAMPLE",
            "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY",
            None,
            "us-east-1",
            "iam",
        )?;
        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        );

        let timestamp = SigV4Timestamp::from_amz_date("20150830T123600Z")?;
        let signed = signer.sign(
            "GET",
            "https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08",
            &headers,
            b"",
            timestamp,
        )?;

        assert_eq!(
            signed.authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, SignedHeaders=content-type;host;x-amz-content-sha256;x-amz-date, Signature=dd479fa8a80364edf2119ec24bebde66712ee9c9cb2b0d92eb3ab9ccdc0c3947"
        );
        assert_eq!(
            signed.content_sha256,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        Ok(())
    }

    #[test]
    fn session_token_is_signed_and_emitted() -> Result<()> {
        let signer = SigV4Signer::new(
            "AKIDEXAMPLE",
            "secret",
            Some("the-token".to_string()),
            "us-east-1",
            "bedrock",
        )?;
        let timestamp = SigV4Timestamp::from_amz_date("20240101T000000Z")?;
        let signed = signer.sign(
            "POST",
            "https://bedrock-runtime.us-east-1.amazonaws.com/model/m/converse",
            &BTreeMap::new(),
            b"{}",
            timestamp,
        )?;
        assert_eq!(signed.security_token.as_deref(), Some("the-token"));
        assert!(signed.authorization.contains("x-amz-security-token"));
        Ok(())
    }

    #[test]
    fn missing_env_credentials_fail_as_expired() {
        let secrets = ProviderSecrets::default();
        let err = SigV4Signer::from_secrets(&secrets, "us-east-1", "bedrock").unwrap_err();
        assert!(matches!(err, GatewayError::ExpiredCredentials));
    }
}
