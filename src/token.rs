//! Random token generation for stream ids and API keys.

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Length of the stream id assigned to every server stream header.
pub const STREAM_ID_LEN: usize = 10;

/// Length of the API key written into a generated config skeleton.
pub const API_KEY_LEN: usize = 32;

/// Generate a random alphanumeric token of the given length.
///
/// `thread_rng` is a CSPRNG, so the output is suitable for stream ids and
/// API keys alike.
pub fn secure(length: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}
