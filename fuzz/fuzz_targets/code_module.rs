#![no_main]

use libfuzzer_sys::fuzz_target;
use nomad::ir::CodeModule;

fuzz_target!(|data: &[u8]| {
    let _ = CodeModule::from_bytes(data);
});
