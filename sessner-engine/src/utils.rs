use chrono::Utc;
use rand::Rng as _;

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Current wall-clock time as epoch milliseconds.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Random base36 string of `len` characters.
pub fn base36(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| BASE36[rng.random_range(0..BASE36.len())] as char)
        .collect()
}

/// Mint a session id: `session_{unixMillis}_{base36rand}`.
///
/// Ids are never reused; uniqueness comes from the millisecond timestamp
/// plus 8 characters of randomness.
pub fn new_session_id() -> String {
    format!("session_{}_{}", now_millis(), base36(8))
}

/// Random alphanumeric string, used for device-identity salts.
pub fn alphanumeric(len: usize) -> String {
    use rand::distr::{Alphanumeric, SampleString as _};
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

pub fn is_default<T: Default + PartialEq>(t: &T) -> bool {
    *t == Default::default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_shape() {
        let id = new_session_id();
        let mut parts = id.splitn(3, '_');
        assert_eq!(parts.next(), Some("session"));
        let millis: i64 = parts.next().unwrap().parse().unwrap();
        assert!(millis > 0);
        let tail = parts.next().unwrap();
        assert_eq!(tail.len(), 8);
        assert!(tail.bytes().all(|b| BASE36.contains(&b)));
    }

    #[test]
    fn ids_do_not_collide() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
    }
}
