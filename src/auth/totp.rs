//! RFC 6238 time-based one-time passwords (30-second period, 6 digits,
//! HMAC-SHA1) and the single-use backup codes that back them up.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

use crate::{GatewayError, Result};

type HmacSha1 = Hmac<Sha1>;

pub const TOTP_PERIOD_SECS: u64 = 30;
pub const TOTP_DIGITS: u32 = 6;
/// Codes from one period before or after still validate (clock skew).
pub const TOTP_WINDOW: i64 = 1;
pub const BACKUP_CODE_COUNT: usize = 10;

const SECRET_BYTES: usize = 20;

/// Fresh 20-byte shared secret, base32-encoded without padding (the form
/// authenticator apps expect in otpauth URIs).
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    base32::encode(base32::Alphabet::Rfc4648 { padding: false }, &bytes)
}

/// Ten single-use backup codes, each 8 hex chars formatted XXXX-XXXX.
pub fn generate_backup_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT)
        .map(|_| {
            let mut bytes = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut bytes);
            let hex: String = bytes.iter().map(|b| format!("{b:02X}")).collect();
            format!("{}-{}", &hex[..4], &hex[4..])
        })
        .collect()
}

pub fn provisioning_uri(secret: &str, account: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{issuer}:{account}?secret={secret}&issuer={issuer}&period={TOTP_PERIOD_SECS}&digits={TOTP_DIGITS}"
    )
}

/// Validates `code` against `secret` at `now` (epoch seconds), accepting
/// the previous and next period.
pub fn validate(secret: &str, code: &str, now: u64) -> Result<bool> {
    let code = code.trim();
    if code.len() != TOTP_DIGITS as usize || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(false);
    }

    let key = decode_secret(secret)?;
    let counter = (now / TOTP_PERIOD_SECS) as i64;
    for offset in -TOTP_WINDOW..=TOTP_WINDOW {
        let step = counter + offset;
        if step < 0 {
            continue;
        }
        if hotp(&key, step as u64)? == code {
            return Ok(true);
        }
    }
    Ok(false)
}

fn decode_secret(secret: &str) -> Result<Vec<u8>> {
    base32::decode(
        base32::Alphabet::Rfc4648 { padding: false },
        secret.trim(),
    )
    .ok_or_else(|| GatewayError::Internal("totp secret is not valid base32".to_string()))
}

fn hotp(key: &[u8], counter: u64) -> Result<String> {
    let mut mac = HmacSha1::new_from_slice(key)
        .map_err(|err| GatewayError::Internal(format!("totp hmac key: {err}")))?;
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[digest.len() - 1] & 0x0f) as usize;
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let code = binary % 10u32.pow(TOTP_DIGITS);
    Ok(format!("{code:0width$}", width = TOTP_DIGITS as usize))
}

/// Current code for a secret; used by tests and the enrollment flow's
/// confirmation step.
pub fn current_code(secret: &str, now: u64) -> Result<String> {
    let key = decode_secret(secret)?;
    hotp(&key, now / TOTP_PERIOD_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 6238 appendix B, SHA-1 rows, truncated to six digits.
    const RFC_SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    #[test]
    fn rfc6238_known_answers() {
        for (now, expected) in [
            (59u64, "287082"),
            (1_111_111_109, "081804"),
            (1_111_111_111, "050471"),
            (1_234_567_890, "005924"),
        ] {
            assert_eq!(current_code(RFC_SECRET, now).unwrap(), expected, "t={now}");
            assert!(validate(RFC_SECRET, expected, now).unwrap());
        }
    }

    #[test]
    fn accepts_adjacent_period() {
        let code = current_code(RFC_SECRET, 59).unwrap();
        assert!(validate(RFC_SECRET, &code, 59 + TOTP_PERIOD_SECS).unwrap());
        assert!(!validate(RFC_SECRET, &code, 59 + 3 * TOTP_PERIOD_SECS).unwrap());
    }

    #[test]
    fn rejects_malformed_codes() {
        assert!(!validate(RFC_SECRET, "12345", 59).unwrap());
        assert!(!validate(RFC_SECRET, "abcdef", 59).unwrap());
        assert!(!validate(RFC_SECRET, "1234567", 59).unwrap());
    }

    #[test]
    fn backup_codes_have_expected_shape() {
        let codes = generate_backup_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);
        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            assert!(code
                .chars()
                .filter(|c| *c != '-')
                .all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn secret_is_twenty_bytes_of_base32() {
        let secret = generate_secret();
        let decoded = base32::decode(base32::Alphabet::Rfc4648 { padding: false }, &secret);
        assert_eq!(decoded.map(|b| b.len()), Some(20));
    }
}
