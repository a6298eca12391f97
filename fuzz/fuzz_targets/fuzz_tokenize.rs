#![no_main]

use libfuzzer_sys::fuzz_target;
use watchboard::tokenize;

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let tokens = tokenize(source);
    // Every token consumes at least one input character.
    assert!(tokens.len() <= source.chars().count());
});
