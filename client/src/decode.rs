//! Byte-level helpers shared by the browser fetch path.

use slidescope_engine::FetchError;

/// `Authorization` header value for an optional bearer token.
pub fn bearer(token: Option<&str>) -> Option<String> {
    token
        .filter(|t| !t.is_empty())
        .map(|t| format!("Bearer {t}"))
}

/// Map a non-2xx HTTP status to a fetch error.
pub fn status_error(status: u16) -> Option<FetchError> {
    if (200..300).contains(&status) {
        None
    } else {
        Some(FetchError::Http { status })
    }
}

/// Raw little-endian `f32` array, as served for point positions.
pub fn f32_le(bytes: &[u8]) -> Result<Vec<f32>, FetchError> {
    if bytes.len() % 4 != 0 {
        return Err(FetchError::Decode(format!(
            "{} bytes is not a whole number of f32 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Raw little-endian `u16` array, as served for palette indices.
pub fn u16_le(bytes: &[u8]) -> Result<Vec<u16>, FetchError> {
    if bytes.len() % 2 != 0 {
        return Err(FetchError::Decode(format!(
            "{} bytes is not a whole number of u16 values",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Best-effort MIME type for a tile URL, used when wrapping bytes in a blob.
pub fn image_mime(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("avif") => "image/avif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bearer_header_only_for_real_tokens() {
        assert_eq!(bearer(Some("abc")).as_deref(), Some("Bearer abc"));
        assert_eq!(bearer(Some("")), None);
        assert_eq!(bearer(None), None);
    }

    #[test]
    fn non_success_status_is_an_error() {
        assert_eq!(status_error(200), None);
        assert_eq!(status_error(204), None);
        assert_eq!(status_error(404), Some(FetchError::Http { status: 404 }));
        assert_eq!(status_error(503), Some(FetchError::Http { status: 503 }));
    }

    #[test]
    fn decodes_little_endian_arrays() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-2.0f32).to_le_bytes());
        assert_eq!(f32_le(&bytes), Ok(vec![1.5, -2.0]));
        assert_eq!(u16_le(&[1, 0, 0, 1]), Ok(vec![1, 256]));
        assert!(matches!(f32_le(&[0; 6]), Err(FetchError::Decode(_))));
        assert!(matches!(u16_le(&[0; 3]), Err(FetchError::Decode(_))));
    }

    #[test]
    fn mime_follows_extension() {
        assert_eq!(image_mime("/t/5/1_2.png?sig=x"), "image/png");
        assert_eq!(image_mime("/t/5/1_2.WEBP"), "image/webp");
        assert_eq!(image_mime("/t/5/1_2.jpg"), "image/jpeg");
        assert_eq!(image_mime("/t/5/tile"), "image/jpeg");
    }
}
