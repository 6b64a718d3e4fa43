//! Fuzz target for the controller parameter block decoder.
//!
//! Run with: cargo +nightly fuzz run fuzz_param_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use powergate_core::smc::param::ParamStruct;

fuzz_target!(|data: &[u8]| {
    if let Ok(param) = ParamStruct::decode(data) {
        let _ = param.operation();
        let again = ParamStruct::decode(&param.encode());
        assert!(again.is_ok());
    }
});
