#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem_engine::fuzz_command_record;

fuzz_target!(|data: &[u8]| {
    fuzz_command_record(data);
});
