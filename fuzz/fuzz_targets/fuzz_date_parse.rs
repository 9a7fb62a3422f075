#![no_main]

use libfuzzer_sys::fuzz_target;
use rt_frame::parse_date_text;

fuzz_target!(|data: &str| {
    let _ = parse_date_text(data);
});
