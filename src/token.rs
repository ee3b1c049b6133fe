//! Announce tokens: opaque proofs handed out in get_peers responses that the
//! requester must echo back in a subsequent announce_peer.

use rand::Rng;
use sha1::{Digest, Sha1};
use std::net::IpAddr;
use std::time::Duration;

/// How often the secret should be rotated. Together with accepting the
/// previous secret this gives announcing peers a 10 to 20 minute window.
pub(crate) const ROTATE_INTERVAL: Duration = Duration::from_secs(10 * 60);

const SECRET_LEN: usize = 4;
const TOKEN_LEN: usize = 20;

/// Hands out tokens derived from the requester's ip and a rotating secret,
/// and validates echoed tokens against the current and the previous secret.
pub(crate) struct TokenTracker {
    current: [u8; SECRET_LEN],
    previous: [u8; SECRET_LEN],
}

impl TokenTracker {
    pub fn new<R: Rng>(rng: &mut R) -> Self {
        Self {
            current: rng.gen(),
            previous: rng.gen(),
        }
    }

    /// Token for a peer at `ip`, derived from the current secret.
    pub fn create(&self, ip: IpAddr) -> Vec<u8> {
        make_token(ip, &self.current)
    }

    /// Is `token` valid for a peer at `ip`? Tokens from the current and the
    /// immediately preceding secret are accepted.
    pub fn validate(&self, ip: IpAddr, token: &[u8]) -> bool {
        token == make_token(ip, &self.current) || token == make_token(ip, &self.previous)
    }

    /// Retire the current secret. Called on a fixed timer so a token's
    /// validity window does not depend on request arrival patterns.
    pub fn rotate<R: Rng>(&mut self, rng: &mut R) {
        self.previous = self.current;
        self.current = rng.gen();
    }
}

fn make_token(ip: IpAddr, secret: &[u8; SECRET_LEN]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    match ip {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(secret);
    hasher.finalize()[..TOKEN_LEN].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn positive_current_token_valid() {
        let mut rng = rand::thread_rng();
        let tracker = TokenTracker::new(&mut rng);
        let ip = test::dummy_socket_addr_v4().ip();

        assert!(tracker.validate(ip, &tracker.create(ip)));
    }

    #[test]
    fn positive_token_survives_one_rotation() {
        let mut rng = rand::thread_rng();
        let mut tracker = TokenTracker::new(&mut rng);
        let ip = test::dummy_socket_addr_v4().ip();

        let token = tracker.create(ip);
        tracker.rotate(&mut rng);

        assert!(tracker.validate(ip, &token));
    }

    #[test]
    fn negative_token_expires_after_two_rotations() {
        let mut rng = rand::thread_rng();
        let mut tracker = TokenTracker::new(&mut rng);
        let ip = test::dummy_socket_addr_v4().ip();

        let token = tracker.create(ip);
        tracker.rotate(&mut rng);
        tracker.rotate(&mut rng);

        assert!(!tracker.validate(ip, &token));
    }

    #[test]
    fn negative_token_bound_to_ip() {
        let mut rng = rand::thread_rng();
        let tracker = TokenTracker::new(&mut rng);

        let token = tracker.create(test::dummy_socket_addr_v4().ip());

        assert!(!tracker.validate(test::dummy_socket_addr_v6().ip(), &token));
    }
}
