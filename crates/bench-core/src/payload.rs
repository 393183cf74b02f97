use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random alphanumeric body of exactly `size` bytes.
pub fn build_body(size: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .collect()
}
