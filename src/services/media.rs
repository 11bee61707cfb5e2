//! Best-effort download of post media to local storage
//!
//! Files land under `MEDIA_DIR/<external_post_id>/image_<n>.<ext>` and are
//! served back at `/media`. Failures are logged and skipped - a post is
//! stored whether or not its media could be fetched.

use std::path::Path;

use tracing::warn;

/// Map a content type to a file extension (jpg when unknown)
fn extension_for(content_type: &str) -> &'static str {
    if content_type.contains("png") {
        "png"
    } else if content_type.contains("gif") {
        "gif"
    } else if content_type.contains("webp") {
        "webp"
    } else if content_type.contains("mp4") {
        "mp4"
    } else {
        "jpg"
    }
}

/// Download each media URL, returning the stored paths relative to the media
/// root. Individual failures are skipped
pub async fn download_media(
    http: &reqwest::Client,
    media_dir: &Path,
    external_post_id: &str,
    urls: &[String],
) -> Vec<String> {
    let dir = media_dir.join(external_post_id);
    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
        warn!("Failed to create media dir {:?}: {}", dir, e);
        return Vec::new();
    }

    let mut local_paths = Vec::new();
    for (idx, url) in urls.iter().enumerate() {
        match fetch_one(http, url).await {
            Ok((bytes, ext)) => {
                let filename = format!("image_{}.{}", idx + 1, ext);
                let path = dir.join(&filename);
                match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => local_paths.push(format!("{external_post_id}/{filename}")),
                    Err(e) => warn!("Failed to write media file {:?}: {}", path, e),
                }
            }
            Err(e) => warn!("Failed to download media {}: {}", url, e),
        }
    }

    local_paths
}

async fn fetch_one(
    http: &reqwest::Client,
    url: &str,
) -> Result<(Vec<u8>, &'static str), String> {
    let resp = http.get(url).send().await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("HTTP {}", resp.status()));
    }

    let ext = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(extension_for)
        .unwrap_or("jpg");

    let bytes = resp.bytes().await.map_err(|e| e.to_string())?;
    Ok((bytes.to_vec(), ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_mapping() {
        assert_eq!(extension_for("image/png"), "png");
        assert_eq!(extension_for("image/gif"), "gif");
        assert_eq!(extension_for("image/webp"), "webp");
        assert_eq!(extension_for("video/mp4"), "mp4");
        assert_eq!(extension_for("image/jpeg"), "jpg");
        assert_eq!(extension_for("application/octet-stream"), "jpg");
    }
}
