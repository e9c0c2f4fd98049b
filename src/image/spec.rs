//! Image spec parsing and backend filename encoding.
//!
//! A spec is either `NAME` (the backend image must already exist) or
//! `NAME=URL` (the backend image is downloaded on first use). Names may use a
//! single `/` as a namespace separator; it is encoded as `%2F` on disk, so
//! `%` is reserved and rejected.

use super::ImageStoreError;

const BACKEND_EXTENSION: &str = ".qcow2";
const SLASH_ENCODING: &str = "%2F";

/// Parsed form of an `--image` argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ImageSpec {
    /// Image name used to key the backend store.
    pub name: String,
    /// Source URL for the backend image, when the spec provides one.
    pub url: Option<String>,
}

impl ImageSpec {
    /// Parses a raw spec string.
    ///
    /// # Errors
    ///
    /// Returns [`ImageStoreError::InvalidSpec`] when the name is empty,
    /// contains reserved characters, or the URL half is empty.
    pub fn parse(spec: &str) -> Result<Self, ImageStoreError> {
        let (raw_name, url) = match spec.split_once('=') {
            Some((name, url)) => (name, Some(url)),
            None => (spec, None),
        };

        let name = raw_name.trim();
        validate_name(spec, name)?;

        let url = match url {
            Some(value) if value.trim().is_empty() => {
                return Err(ImageStoreError::InvalidSpec {
                    spec: spec.to_owned(),
                    reason: String::from("image URL must not be empty"),
                });
            }
            Some(value) => Some(value.trim().to_owned()),
            None => None,
        };

        Ok(Self {
            name: name.to_owned(),
            url,
        })
    }

    /// Backend store filename for this image.
    #[must_use]
    pub fn backend_file_name(&self) -> String {
        encode_backend_file_name(&self.name)
    }
}

/// Encodes an image name into its backend store filename.
#[must_use]
pub fn encode_backend_file_name(name: &str) -> String {
    format!("{}{BACKEND_EXTENSION}", name.replace('/', SLASH_ENCODING))
}

/// Decodes a backend store filename back into an image name.
///
/// Returns `None` for files that do not follow the store naming scheme.
#[must_use]
pub fn decode_backend_file_name(file_name: &str) -> Option<String> {
    file_name
        .strip_suffix(BACKEND_EXTENSION)
        .map(|stem| stem.replace(SLASH_ENCODING, "/"))
}

fn validate_name(spec: &str, name: &str) -> Result<(), ImageStoreError> {
    let invalid = |reason: &str| ImageStoreError::InvalidSpec {
        spec: spec.to_owned(),
        reason: reason.to_owned(),
    };

    if name.is_empty() {
        return Err(invalid("image name must not be empty"));
    }
    if name.contains('%') {
        return Err(invalid("image names must not contain '%'"));
    }
    if name.starts_with('/') || name.ends_with('/') || name.contains("//") {
        return Err(invalid("image names must not contain empty path segments"));
    }
    if !name
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-' | '/'))
    {
        return Err(invalid(
            "image names may only contain ASCII letters, digits, '.', '_', '-', and '/'",
        ));
    }
    if name.split('/').any(|segment| segment == "..") {
        return Err(invalid("image names must not contain '..' segments"));
    }
    Ok(())
}
