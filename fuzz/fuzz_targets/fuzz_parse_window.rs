#![no_main]

use libfuzzer_sys::fuzz_target;
use watchboard::parse_window;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let ms = parse_window(source);
    assert!(ms >= 0);
});
