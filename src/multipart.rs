use std::collections::HashMap;
use std::fmt::Write as _;

use rand::Rng;

use crate::profile::ProfileBatch;

/// Builds a `multipart/form-data` body holding upload labels and profile
/// blobs. Labels become plain text fields; each profile becomes a file part
/// whose `name` and `filename` are both the profile kind. The agent
/// identifies parts by name, so the part content type stays at the
/// `application/octet-stream` default.
///
/// The body is consumed by the request, so retries build a fresh encoder.
pub(crate) struct MultipartEncoder {
    boundary: String,
    buf: Vec<u8>,
}

impl MultipartEncoder {
    pub(crate) fn new() -> Self {
        Self {
            boundary: random_boundary(),
            buf: Vec::with_capacity(4096),
        }
    }

    /// Appends a plain text field. Any UTF-8 is permitted in the value.
    pub(crate) fn write_field(&mut self, name: &str, value: &str) {
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"\r\n\r\n",
                escape_quotes(name)
            )
            .as_bytes(),
        );
        self.buf.extend_from_slice(value.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Appends a file part with the given bytes.
    pub(crate) fn write_file(&mut self, name: &str, filename: &str, data: &[u8]) {
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"\r\n");
        self.buf.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                escape_quotes(name),
                escape_quotes(filename)
            )
            .as_bytes(),
        );
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
    }

    /// Closes the body and returns the `Content-Type` header value together
    /// with the finished bytes.
    pub(crate) fn finish(mut self) -> (String, Vec<u8>) {
        self.buf.extend_from_slice(b"--");
        self.buf.extend_from_slice(self.boundary.as_bytes());
        self.buf.extend_from_slice(b"--\r\n");

        let content_type = format!("multipart/form-data; boundary={}", self.boundary);
        (content_type, self.buf)
    }
}

/// Encodes one batch with the configured labels into a request body.
pub(crate) fn encode_batch(
    labels: &HashMap<String, String>,
    batch: &ProfileBatch,
) -> (String, Vec<u8>) {
    let mut encoder = MultipartEncoder::new();

    for (name, value) in labels {
        encoder.write_field(name, value);
    }

    for profile in &batch.profiles {
        let kind = profile.kind.as_str();
        encoder.write_file(kind, kind, &profile.data);
    }

    encoder.finish()
}

/// 60 hex characters drawn from a per-process PRNG, long enough that a
/// collision with profile bytes is not a practical concern.
fn random_boundary() -> String {
    let mut raw = [0u8; 30];
    rand::thread_rng().fill(&mut raw[..]);

    let mut boundary = String::with_capacity(raw.len() * 2);
    for byte in raw {
        let _ = write!(boundary, "{byte:02x}");
    }
    boundary
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}
