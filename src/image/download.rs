//! HTTPS retrieval of backend images.
//!
//! Downloads stream to a dot-prefixed temporary file in the backend
//! directory and only rename into place once complete, so a partial download
//! never becomes visible under the final image name.

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::ImageStoreError;

/// Streams `url` into `dest`.
///
/// # Errors
///
/// Returns [`ImageStoreError::Download`] for HTTP failures and
/// [`ImageStoreError::Io`] when the temporary file cannot be written or
/// renamed.
pub(crate) async fn fetch_to_file(url: &str, dest: &Utf8Path) -> Result<(), ImageStoreError> {
    let tmp = partial_path(dest)?;

    info!(url, path = %dest, "downloading backend image");
    let result = stream_response(url, &tmp).await;
    if result.is_err() {
        // Leave nothing half-written behind.
        tokio::fs::remove_file(&tmp).await.ok();
        return result;
    }

    tokio::fs::rename(&tmp, dest)
        .await
        .map_err(|err| ImageStoreError::Io {
            path: dest.to_path_buf(),
            message: err.to_string(),
        })
}

async fn stream_response(url: &str, tmp: &Utf8Path) -> Result<(), ImageStoreError> {
    let download_error = |err: &dyn std::fmt::Display| ImageStoreError::Download {
        url: url.to_owned(),
        message: err.to_string(),
    };
    let io_error = |err: &dyn std::fmt::Display| ImageStoreError::Io {
        path: tmp.to_path_buf(),
        message: err.to_string(),
    };

    let response = reqwest::get(url)
        .await
        .and_then(reqwest::Response::error_for_status)
        .map_err(|err| download_error(&err))?;

    let mut file = tokio::fs::File::create(tmp)
        .await
        .map_err(|err| io_error(&err))?;

    let mut body = response;
    let mut total: u64 = 0;
    while let Some(chunk) = body.chunk().await.map_err(|err| download_error(&err))? {
        total += chunk.len() as u64;
        file.write_all(&chunk).await.map_err(|err| io_error(&err))?;
    }

    file.flush().await.map_err(|err| io_error(&err))?;
    info!(url, bytes = total, "backend image downloaded");
    Ok(())
}

fn partial_path(dest: &Utf8Path) -> Result<Utf8PathBuf, ImageStoreError> {
    let parent = dest.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = dest.file_name().ok_or_else(|| ImageStoreError::Io {
        path: dest.to_path_buf(),
        message: String::from("backend image path is missing a filename"),
    })?;
    Ok(parent.join(format!(".{file_name}.part")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_is_hidden_sibling() {
        let path = partial_path(Utf8Path::new("/store/backend/alpine.qcow2"))
            .unwrap_or_else(|err| panic!("partial path: {err}"));
        assert_eq!(path, Utf8Path::new("/store/backend/.alpine.qcow2.part"));
    }
}
