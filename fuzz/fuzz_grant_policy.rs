//! Fuzz target for grant policy evaluation.
//!
//! Run with: cargo +nightly fuzz run fuzz_grant_policy

#![no_main]

use libfuzzer_sys::fuzz_target;
use powergate_config::policy::{GrantRule, build_policy};

fuzz_target!(|data: &[u8]| {
    if data.len() < 2 {
        return;
    }
    let split = (data[0] as usize % data.len()).max(1);
    let role = std::str::from_utf8(&data[1..split]).unwrap_or("user");
    let right = std::str::from_utf8(&data[split..]).unwrap_or("powergate.power.manage");

    let policy = build_policy(vec![
        GrantRule::allow("admin", "*"),
        GrantRule::deny("*", "powergate.daemons.modify").with_priority(5),
        GrantRule::allow("user", "powergate.power.manage"),
    ]);

    let granted = policy.is_granted(role, right);
    if right == "powergate.daemons.modify" {
        assert!(!granted);
    }
});
