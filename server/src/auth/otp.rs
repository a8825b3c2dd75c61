//! TOTP (RFC 6238 over HMAC-SHA1, 30 second steps, six digits) plus the
//! QR image handed out at enrollment.

use crate::error::{ServerError, ServerResult};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;

const STEP_SECONDS: i64 = 30;
const DIGITS: u32 = 6;

pub fn new_secret() -> String {
    let mut raw = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE32_NOPAD.encode(&raw)
}

pub fn otpauth_url(secret: &str, email: &str, issuer: &str) -> String {
    format!(
        "otpauth://totp/{}:{}?secret={}&issuer={}&algorithm=SHA1&digits=6&period=30",
        issuer, email, secret, issuer
    )
}

fn hotp(secret: &[u8], counter: u64) -> String {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret).expect("hmac accepts any key length");
    mac.update(&counter.to_be_bytes());
    let digest = mac.finalize().into_bytes();

    let offset = (digest[19] & 0x0f) as usize;
    let bin = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    format!("{:06}", bin % 10u32.pow(DIGITS))
}

pub fn totp(secret_b32: &str, time_s: i64) -> ServerResult<String> {
    let secret = BASE32_NOPAD
        .decode(secret_b32.as_bytes())
        .map_err(|_| ServerError::BadRequest)?;
    Ok(hotp(&secret, (time_s / STEP_SECONDS) as u64))
}

/// Accepts the current step and one step either side, absorbing clock
/// drift.
pub fn validate(secret_b32: &str, code: &str, time_s: i64) -> bool {
    if secret_b32.is_empty() || code.len() != DIGITS as usize {
        return false;
    }
    for drift in [-1i64, 0, 1] {
        if let Ok(expect) = totp(secret_b32, time_s + drift * STEP_SECONDS) {
            if constant_time_eq(expect.as_bytes(), code.as_bytes()) {
                return true;
            }
        }
    }
    false
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Renders the enrollment URL as a PNG QR code, scaled for phone cameras.
pub fn qr_png(url: &str) -> ServerResult<Vec<u8>> {
    const SCALE: u32 = 8;
    const QUIET: u32 = 4;

    let code = qrcode::QrCode::new(url.as_bytes()).map_err(|_| ServerError::BadRequest)?;
    let width = code.width() as u32;
    let colors = code.to_colors();

    let size = (width + 2 * QUIET) * SCALE;
    let mut img = image::GrayImage::from_pixel(size, size, image::Luma([255u8]));
    for (i, color) in colors.iter().enumerate() {
        if *color == qrcode::Color::Dark {
            let x = (i as u32 % width + QUIET) * SCALE;
            let y = (i as u32 / width + QUIET) * SCALE;
            for dy in 0..SCALE {
                for dx in 0..SCALE {
                    img.put_pixel(x + dx, y + dy, image::Luma([0u8]));
                }
            }
        }
    }

    let mut out = Vec::new();
    image::DynamicImage::ImageLuma8(img)
        .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .map_err(|_| ServerError::BadRequest)?;
    Ok(out)
}

#[cfg(test)]
mod test {
    use super::*;

    // RFC 6238 appendix B vector (SHA-1, ASCII key "12345678901234567890").
    #[test]
    fn rfc_vectors() {
        let secret = BASE32_NOPAD.encode(b"12345678901234567890");
        assert_eq!(totp(&secret, 59).unwrap(), "287082");
        assert_eq!(totp(&secret, 1111111109).unwrap(), "081804");
        assert_eq!(totp(&secret, 1234567890).unwrap(), "005924");
    }

    #[test]
    fn window_accepts_adjacent_steps() {
        let secret = new_secret();
        let now = 1_700_000_000i64;
        let code = totp(&secret, now).unwrap();
        assert!(validate(&secret, &code, now));
        assert!(validate(&secret, &code, now + STEP_SECONDS));
        assert!(validate(&secret, &code, now - STEP_SECONDS));
        assert!(!validate(&secret, &code, now + 3 * STEP_SECONDS));
    }

    #[test]
    fn stale_or_malformed_codes_rejected() {
        let secret = new_secret();
        let now = 1_700_000_000i64;
        assert!(!validate(&secret, "000000", now) || totp(&secret, now).unwrap() == "000000");
        assert!(!validate(&secret, "12345", now));
        assert!(!validate(&secret, "", now));
        assert!(!validate("", "123456", now));
    }

    #[test]
    fn qr_renders_png() {
        let url = otpauth_url(&new_secret(), "user@example.com", "krin");
        let png = qr_png(&url).unwrap();
        assert_eq!(&png[..8], b"\x89PNG\r\n\x1a\n");
    }
}
