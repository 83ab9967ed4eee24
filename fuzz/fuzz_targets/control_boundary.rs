#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_engine::fuzz_control_boundary;

fuzz_target!(|data: &[u8]| {
    fuzz_control_boundary(data);
});
