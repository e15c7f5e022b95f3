//! Epoch timestamp helpers.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the UNIX epoch.
pub fn now_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_plausible_and_consistent() {
        let ms = now_ms();
        let s = now_s();
        // 2020-01-01 in both units.
        assert!(ms > 1_577_836_800_000);
        assert!(s > 1_577_836_800);
        assert!(ms / 1000 >= s - 1);
    }
}
