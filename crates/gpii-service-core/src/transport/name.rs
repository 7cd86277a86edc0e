//! Endpoint name generation.
//!
//! Names live in the pipe namespace and must be unguessable: the namespace
//! is shared machine-wide, and a predictable name would let another local
//! process squat on it before we bind.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;

/// Reserved prefix of the local pipe namespace.
pub const PIPE_PREFIX: &str = r"\\.\pipe\";

/// Random bytes per name; 18 bytes encode to 24 base64 characters without
/// padding.
const RAND_BYTES: usize = 18;

/// Generate a fresh private pipe name for `product`.
///
/// Base64 can emit `/`, which is reserved in pipe paths, so path-reserved
/// characters are replaced before use.
#[must_use]
pub fn generate_pipe_name(product: &str) -> String {
    let mut bytes = [0u8; RAND_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    let body: String = BASE64
        .encode(bytes)
        .chars()
        .map(|c| if c == '/' || c == '\\' { '_' } else { c })
        .collect();
    format!("{PIPE_PREFIX}{product}-{body}")
}
