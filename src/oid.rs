use rand::RngCore;

/// Generates opaque, directory-unique name stems for container files:
/// 32 lowercase hex characters of randomness.
#[derive(Debug, Default)]
pub struct ObjectIdGenerator;

impl ObjectIdGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn next_id(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let mut out = String::with_capacity(32);
        for b in bytes {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}
